// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.265](https://www.itu.int/rec/T-REC-H.265)-encoded video,
//! with RTP encoding as in [RFC 7798](https://tools.ietf.org/html/rfc7798).

use std::fmt::Write as _;

use bytes::Bytes;
use h264_reader::rbsp::{BitRead, BitReader, BitReaderError, ByteReader};
use log::{trace, warn};

use crate::rtp::ReceivedPacket;

use super::h26x::{self, FragmentBuffer, VideoOutput};
use super::{MediaKind, ParameterSetTracker, VideoParameters};

const NAL_IDR_W_RADL: u8 = 19;
const NAL_IDR_N_LP: u8 = 20;
const NAL_VPS: u8 = 32;
const NAL_SPS: u8 = 33;
const NAL_PPS: u8 = 34;
const NAL_AP: u8 = 48;
const NAL_FU: u8 = 49;

#[inline]
fn nal_type(b0: u8) -> u8 {
    (b0 >> 1) & 0b0011_1111
}

/// A [super::Depacketizer] implementation which produces unfragmented NAL
/// units as specified in [RFC 7798](https://tools.ietf.org/html/rfc7798).
///
/// As with H.264, each VCL NAL is emitted as its own access unit.
#[derive(Debug)]
pub(crate) struct Depacketizer {
    output: VideoOutput,
    fragments: FragmentBuffer,
    tracker: ParameterSetTracker,
}

impl Depacketizer {
    pub(super) fn new(
        track: usize,
        clock_rate: u32,
        tracker: ParameterSetTracker,
    ) -> Result<Self, String> {
        if clock_rate != 90_000 {
            return Err(format!(
                "H.265 clock rate must always be 90000, got {clock_rate}"
            ));
        }
        Ok(Depacketizer {
            output: VideoOutput::new(track, clock_rate)?,
            fragments: FragmentBuffer::default(),
            tracker,
        })
    }

    pub(super) fn set_origin(&mut self, origin: std::time::Duration) {
        self.output.set_origin(origin);
    }

    pub(super) fn tracker(&self) -> &ParameterSetTracker {
        &self.tracker
    }

    pub(super) fn tracker_mut(&mut self) -> &mut ParameterSetTracker {
        &mut self.tracker
    }

    pub(super) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        let timestamp = pkt.timestamp();
        // Loss is only reported; reassembly carries on across gaps.
        let loss = pkt.loss();
        let payload = pkt.into_payload_bytes();
        let result = self.handle_payload(&payload);
        self.output.flush(timestamp, loss);
        result
    }

    pub(super) fn pull(&mut self) -> Option<super::AccessUnit> {
        self.output.pull()
    }

    fn handle_payload(&mut self, data: &[u8]) -> Result<(), String> {
        if h26x::starts_with_start_code(data) {
            for nal in h26x::split_annex_b(data) {
                self.handle_nal(nal);
            }
            return Ok(());
        }
        let Some(&[b0, b1]) = data.first_chunk::<2>() else {
            return Err(format!("{}-byte payload is too short", data.len()));
        };
        if (b0 >> 7) != 0 {
            return Err(format!("NAL header {b0:02x}{b1:02x} has F bit set"));
        }
        match nal_type(b0) {
            NAL_AP => {
                let mut rest = &data[2..];
                while !rest.is_empty() {
                    let Some((len, tail)) = rest.split_first_chunk::<2>() else {
                        warn!("AP has {} trailing bytes; dropping them", rest.len());
                        break;
                    };
                    let len = usize::from(u16::from_be_bytes(*len));
                    if len < 2 {
                        return Err(format!("bad {len}-byte NAL in AP"));
                    }
                    if tail.len() < len {
                        warn!(
                            "AP entry claims {} bytes; only {} remain",
                            len,
                            tail.len()
                        );
                        break;
                    }
                    let (nal, tail) = tail.split_at(len);
                    self.handle_nal(nal);
                    rest = tail;
                }
            }
            NAL_FU => {
                let Some(&fu_header) = data.get(2) else {
                    return Err("FU is too short".to_owned());
                };
                let fu_type = fu_header & 0b0011_1111;
                match fu_header >> 6 {
                    0b11 => {
                        warn!("FU header {fu_header:02x} has both start and end; dropping");
                        return Ok(());
                    }
                    0b10 => self.fragments.start(&[(b0 & 0b1000_0001) | (fu_type << 1), b1]),
                    _ => {}
                }
                if !self.fragments.append(&data[3..]) {
                    return Ok(());
                }
                if (fu_header >> 6) == 0b01 {
                    if let Some(nal) = self.fragments.finish() {
                        self.handle_nal(&nal);
                    }
                }
            }
            _ => self.handle_nal(data),
        }
        Ok(())
    }

    /// Handles one complete, unaggregated NAL.
    fn handle_nal(&mut self, nal: &[u8]) {
        let t = nal_type(nal[0]);
        match t {
            0..=31 => self
                .output
                .stage(nal, t == NAL_IDR_W_RADL || t == NAL_IDR_N_LP),
            NAL_VPS => self.tracker.update_vps(nal),
            NAL_SPS => self.tracker.update_sps(nal),
            NAL_PPS => self.tracker.update_pps(nal),
            _ => trace!("ignoring NAL type {t}"),
        }
    }
}

/// The fields of an SPS needed for a [`VideoParameters`].
#[derive(Debug)]
struct SpsSummary {
    /// The `profile_tier_level` general profile block: space, tier, idc,
    /// compatibility flags, and constraint flags.
    profile: [u8; 11],
    general_level_idc: u8,
    pixel_dimensions: (u32, u32),
}

fn bits_error(e: BitReaderError) -> String {
    format!("bad SPS: {e:?}")
}

/// Reads `seq_parameter_set_rbsp` (H.265 section 7.3.2.2.1) through the
/// conformance window and stops.
fn parse_sps(nal: &[u8]) -> Result<SpsSummary, String> {
    let Some((_, rest)) = nal.split_first_chunk::<2>() else {
        return Err("SPS is too short".to_owned());
    };
    let mut r = BitReader::new(ByteReader::without_skip(rest));
    r.skip(4, "sps_video_parameter_set_id").map_err(bits_error)?;
    let max_sub_layers_minus1: u8 = r
        .read(3, "sps_max_sub_layers_minus1")
        .map_err(bits_error)?;
    if max_sub_layers_minus1 > 6 {
        return Err("sps_max_sub_layers_minus1 must be in [0, 6]".to_owned());
    }
    r.skip(1, "sps_temporal_id_nesting_flag").map_err(bits_error)?;

    // profile_tier_level(1, sps_max_sub_layers_minus1), section 7.3.3.
    let mut profile = [0u8; 11];
    for b in &mut profile {
        *b = r.read(8, "general_profile").map_err(bits_error)?;
    }
    let general_level_idc: u8 = r.read(8, "general_level_idc").map_err(bits_error)?;
    if max_sub_layers_minus1 > 0 {
        // Two flags per sub-layer, then reserved bits padding to 16.
        let flags: u16 = r.read(16, "sub_layer_present_flags").map_err(bits_error)?;
        for i in 0..max_sub_layers_minus1 {
            if flags & (1 << (15 - 2 * i)) != 0 {
                r.skip(88, "sub_layer_profile").map_err(bits_error)?;
            }
            if flags & (1 << (14 - 2 * i)) != 0 {
                r.skip(8, "sub_layer_level_idc").map_err(bits_error)?;
            }
        }
    }

    r.read_ue("sps_seq_parameter_set_id").map_err(bits_error)?;
    let chroma_format_idc = r.read_ue("chroma_format_idc").map_err(bits_error)?;
    if chroma_format_idc > 3 {
        return Err("chroma_format_idc must be in [0, 3]".to_owned());
    }
    if chroma_format_idc == 3 {
        r.skip(1, "separate_colour_plane_flag").map_err(bits_error)?;
    }
    let mut width = r.read_ue("pic_width_in_luma_samples").map_err(bits_error)?;
    let mut height = r.read_ue("pic_height_in_luma_samples").map_err(bits_error)?;
    if r.read_bool("conformance_window_flag").map_err(bits_error)? {
        let left = r.read_ue("conf_win_left_offset").map_err(bits_error)?;
        let right = r.read_ue("conf_win_right_offset").map_err(bits_error)?;
        let top = r.read_ue("conf_win_top_offset").map_err(bits_error)?;
        let bottom = r.read_ue("conf_win_bottom_offset").map_err(bits_error)?;

        // Offsets are in chroma samples.
        let width_shift = u32::from(chroma_format_idc == 1 || chroma_format_idc == 2);
        let height_shift = u32::from(chroma_format_idc == 1);
        width = left
            .checked_add(right)
            .and_then(|x| x.checked_shl(width_shift))
            .and_then(|x| width.checked_sub(x))
            .ok_or("bad conformance window")?;
        height = top
            .checked_add(bottom)
            .and_then(|x| x.checked_shl(height_shift))
            .and_then(|x| height.checked_sub(x))
            .ok_or("bad conformance window")?;
    }
    Ok(SpsSummary {
        profile,
        general_level_idc,
        pixel_dimensions: (width, height),
    })
}

impl SpsSummary {
    /// Formats the codec as in ISO/IEC 14496-15 section E.3, eg `hvc1.1.60000000.L90.B0`.
    fn rfc6381_codec(&self) -> String {
        let p = &self.profile;
        let general_profile_space = match p[0] >> 6 {
            0 => "",
            1 => "A",
            2 => "B",
            _ => "C",
        };
        let general_profile_idc = p[0] & 0b0001_1111;
        let general_profile_compatibility_flags = u32::from_be_bytes([p[1], p[2], p[3], p[4]]);
        let general_tier_flag = if (p[0] & 0b0010_0000) != 0 { "H" } else { "L" };
        let mut out = format!(
            "hvc1.{general_profile_space}{general_profile_idc}.{general_profile_compatibility_flags:02X}.{general_tier_flag}{}",
            self.general_level_idc
        );

        // The 6 constraint bytes; trailing zero bytes are omitted, but the
        // first is always written.
        let mut constraints = &p[5..11];
        while let [head @ .., 0] = constraints {
            if head.is_empty() {
                break;
            }
            constraints = head;
        }
        for b in constraints {
            let _ = write!(&mut out, ".{b:02X}");
        }
        out
    }
}

/// Decodes a VPS, SPS, and PPS into [`VideoParameters`].
pub(super) fn decode_parameters(
    vps: &[u8],
    sps: &[u8],
    pps: &[u8],
) -> Result<VideoParameters, String> {
    for (nal, expected, name) in [(vps, NAL_VPS, "VPS"), (sps, NAL_SPS, "SPS"), (pps, NAL_PPS, "PPS")] {
        match nal.first() {
            Some(&b0) if nal_type(b0) == expected => {}
            _ => {
                return Err(format!(
                    "{name} NAL is not a {name}: {:?}",
                    crate::hex::LimitedHex::head(nal)
                ))
            }
        }
    }
    let summary = parse_sps(sps)
        .map_err(|e| format!("{e}\nwhile parsing SPS: {:?}", crate::hex::LimitedHex::new(sps, 256)))?;
    Ok(VideoParameters {
        kind: MediaKind::H265,
        pixel_dimensions: summary.pixel_dimensions,
        rfc6381_codec: summary.rfc6381_codec(),
        profile_idc: summary.profile[0] & 0b0001_1111,
        level_idc: summary.general_level_idc,
        parameter_sets: vec![
            Bytes::copy_from_slice(vps),
            Bytes::copy_from_slice(sps),
            Bytes::copy_from_slice(pps),
        ],
        extra_data: Bytes::new(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use base64::Engine as _;

    use crate::codec::{
        CodecDescriptor, DefaultParameterSetDecoder, MediaKind, ParameterSetTracker,
    };
    use crate::testutil::{init_logging, packet};

    fn b64(s: &str) -> Vec<u8> {
        base64::engine::general_purpose::STANDARD.decode(s).unwrap()
    }

    const VPS: &str = "QAEMAf//AWAAAAMAsAAAAwAAAwBarAwAAAMABAAAAwAyqA==";
    const SPS: &str = "QgEBAWAAAAMAsAAAAwAAAwBaoAWCAeFja5JFL83BQYFBAAADAAEAAAMADKE=";
    const PPS: &str = "RAHA8saNA7NA";

    fn depacketizer() -> super::Depacketizer {
        init_logging();
        let tracker = ParameterSetTracker::new(MediaKind::H265, Arc::new(DefaultParameterSetDecoder));
        super::Depacketizer::new(0, 90_000, tracker).unwrap()
    }

    #[test]
    fn depacketize() {
        let mut d = depacketizer();

        // Plain PREFIX_SEI: ignored.
        d.push(packet(0, 0, 0, b"\x4e\x01plain")).unwrap();
        assert!(d.pull().is_none());

        // Aggregation packet of two TRAIL_R slices.
        d.push(packet(0, 1, 0, b"\x60\x01\x00\x09\x02\x01trail 1\x00\x09\x02\x01trail 2"))
            .unwrap();
        let a = d.pull().unwrap();
        let b = d.pull().unwrap();
        assert_eq!(&a.data[..], b"\x00\x00\x00\x09\x02\x01trail 1");
        assert_eq!(&b.data[..], b"\x00\x00\x00\x09\x02\x01trail 2");
        assert!(!a.is_key_frame);

        // FU of an IDR_N_LP in three fragments.
        d.push(packet(0, 2, 3_000, b"\x62\x01\x94fu start, ")).unwrap();
        d.push(packet(0, 3, 3_000, b"\x62\x01\x14fu middle, ")).unwrap();
        assert!(d.pull().is_none());
        d.push(packet(0, 4, 3_000, b"\x62\x01\x54fu end")).unwrap();
        let idr = d.pull().unwrap();
        assert_eq!(
            &idr.data[..],
            b"\x00\x00\x00\x1d\x28\x01fu start, fu middle, fu end"
        );
        assert!(idr.is_key_frame);
        assert!(d.pull().is_none());
    }

    #[test]
    fn fu_survives_sequence_gap() {
        let mut d = depacketizer();
        d.push(packet(0, 0, 0, b"\x62\x01\x81start, ")).unwrap();
        let mut middle = packet(0, 5, 0, b"\x62\x01\x01middle, ");
        middle.loss = 4;
        d.push(middle).unwrap();
        d.push(packet(0, 6, 0, b"\x62\x01\x41end")).unwrap();
        let trail = d.pull().unwrap();
        assert_eq!(&trail.data[4..], b"\x02\x01start, middle, end");
        assert!(!trail.is_key_frame);
        assert_eq!(trail.loss, 4);
    }

    #[test]
    fn in_band_parameters() {
        let mut d = depacketizer();
        d.push(packet(0, 0, 0, &b64(VPS))).unwrap();
        d.push(packet(0, 1, 0, &b64(SPS))).unwrap();
        assert!(d.tracker_mut().take_changed().is_none());
        d.push(packet(0, 2, 0, &b64(PPS))).unwrap();
        assert!(d.pull().is_none());
        let CodecDescriptor::Video(v) = d.tracker_mut().take_changed().unwrap() else {
            panic!("expected video");
        };
        assert_eq!(v.pixel_dimensions(), (704, 480));
        assert_eq!(v.rfc6381_codec(), "hvc1.1.60000000.L90.B0");
        assert_eq!(v.parameter_sets().len(), 3);
        assert!(d.tracker().descriptor().is_some());
    }

    #[test]
    fn idr_w_radl_is_key() {
        let mut d = depacketizer();
        d.push(packet(0, 0, 0, b"\x26\x01idr")).unwrap();
        assert!(d.pull().unwrap().is_key_frame);
    }

    #[test]
    fn invalid_fu_is_dropped() {
        let mut d = depacketizer();
        d.push(packet(0, 0, 0, b"\x62\x01\xd4both")).unwrap();
        d.push(packet(0, 1, 0, b"\x62\x01\x54end")).unwrap();
        assert!(d.pull().is_none());
        d.push(packet(0, 2, 0, b"\x62")).unwrap_err();
    }

    #[test]
    fn decode_tenda_cp3pro() {
        let p = super::decode_parameters(
            &b64("QAEMAf//AWAAAAMAkAAAAwAAAwA/LAwAAgAAAwAoAAIAAgACgA=="),
            &b64("QgEBAWAAAAMAkAAAAwAAAwA/oAUCAXFlLkkyS7I="),
            &b64("RAHA8vAzJA=="),
        )
        .unwrap();
        assert_eq!(p.pixel_dimensions(), (640, 368));
    }

    /// Parameters from <https://github.com/scottlamb/moonfire-nvr/issues/333>.
    #[test]
    fn decode_hacked_xiaomi_yi_pro_2k_home() {
        let p = super::decode_parameters(
            &b64("QAEMAf//AWAAAAMAAAMAAAMAAAMAuqwJ"),
            &b64("QgEBAWAAAAMAAAMAAAMAAAMAuqABICAFEf5a7kSIi/Lc1AQEBAI="),
            &b64("RAHA8oSJAzJA"),
        )
        .unwrap();
        assert_eq!(p.pixel_dimensions(), (2304, 1296));
        assert_eq!(p.level_idc(), 186);
    }

    #[test]
    fn wrong_nal_types() {
        super::decode_parameters(&b64(SPS), &b64(SPS), &b64(PPS)).unwrap_err();
    }
}
