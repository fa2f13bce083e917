// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en)-encoded video.

use bytes::{BufMut, Bytes, BytesMut};
use h264_reader::rbsp::{BitReader, ByteReader};
use log::{debug, trace, warn};

use crate::rtp::ReceivedPacket;

use super::h26x::{self, FragmentBuffer, TolerantBitReader, VideoOutput};
use super::{MediaKind, ParameterSetTracker, VideoParameters};

const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_AUD: u8 = 9;
const NAL_STAP_A: u8 = 24;
const NAL_FU_A: u8 = 28;

/// A [super::Depacketizer] implementation which produces unfragmented NAL
/// units as specified in [RFC 6184](https://tools.ietf.org/html/rfc6184).
///
/// Every VCL NAL is its own access unit; there's no attempt to group the
/// slices of one picture. SPS and PPS NALs feed the track's
/// [`ParameterSetTracker`] rather than the output.
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
                "H.264 clock rate must always be 90000, got {clock_rate}"
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
            // Some cameras send Annex B byte streams rather than RTP-framed NALs.
            for nal in h26x::split_annex_b(data) {
                self.handle_nal(nal);
            }
            return Ok(());
        }
        let &hdr = data.first().ok_or("empty payload")?;
        if (hdr >> 7) != 0 {
            return Err(format!("NAL header {hdr:02x} has F bit set"));
        }
        match hdr & 0x1f {
            NAL_STAP_A => {
                let mut rest = &data[1..];
                while !rest.is_empty() {
                    let Some((len, tail)) = rest.split_first_chunk::<2>() else {
                        warn!("STAP-A has {} trailing bytes; dropping them", rest.len());
                        break;
                    };
                    let len = usize::from(u16::from_be_bytes(*len));
                    if len == 0 {
                        return Err("zero length in STAP-A".to_owned());
                    }
                    if tail.len() < len {
                        warn!(
                            "STAP-A entry claims {} bytes; only {} remain",
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
            NAL_FU_A => {
                let Some(&fu_header) = data.get(1) else {
                    return Err("FU-A is too short".to_owned());
                };
                let start = (fu_header & 0b1000_0000) != 0;
                let end = (fu_header & 0b0100_0000) != 0;
                if start && end {
                    return Err(format!("FU-A header {fu_header:02x} has both start and end"));
                }
                if start {
                    self.fragments.start(&[(hdr & 0b1110_0000) | (fu_header & 0b0001_1111)]);
                }
                if !self.fragments.append(&data[2..]) {
                    return Ok(());
                }
                if end {
                    if let Some(nal) = self.fragments.finish() {
                        self.handle_reassembled(&nal);
                    }
                }
            }
            _ => self.handle_nal(data),
        }
        Ok(())
    }

    /// Handles a reassembled FU-A NAL.
    ///
    /// Some cameras fragment an SPS or AUD with the PPS and IDR slice glued
    /// on after Annex B start codes; split those apart.
    fn handle_reassembled(&mut self, nal: &[u8]) {
        let nal_type = nal[0] & 0x1f;
        if (nal_type == NAL_SPS || nal_type == NAL_AUD) && h26x::contains_start_code(nal) {
            debug!("splitting Annex B stream out of fragmented NAL type {nal_type}");
            for piece in h26x::split_annex_b(nal) {
                self.handle_nal(piece);
            }
        } else {
            self.handle_nal(nal);
        }
    }

    /// Handles one complete, unaggregated NAL.
    fn handle_nal(&mut self, nal: &[u8]) {
        let nal_type = nal[0] & 0x1f;
        match nal_type {
            1..=NAL_IDR => self.output.stage(nal, nal_type == NAL_IDR),
            NAL_SPS => self.tracker.update_sps(nal),
            NAL_PPS => self.tracker.update_pps(nal),
            _ => trace!("ignoring NAL type {nal_type}"),
        }
    }
}

/// Decodes an SPS and PPS into [`VideoParameters`].
pub(super) fn decode_parameters(sps: &[u8], pps: &[u8]) -> Result<VideoParameters, String> {
    if sps.len() < 4 {
        return Err("SPS is too short".to_owned());
    }
    let mut has_extra_trailing_data = false;
    let parsed = h264_reader::nal::sps::SeqParameterSet::from_bits(TolerantBitReader {
        inner: BitReader::new(ByteReader::without_skip(&sps[1..])),
        has_extra_trailing_data: &mut has_extra_trailing_data,
    })
    .map_err(|e| format!("bad SPS: {e:?}"))?;
    if has_extra_trailing_data {
        debug!("SPS has extra trailing data; ignoring it");
    }
    let pixel_dimensions = parsed
        .pixel_dimensions()
        .map_err(|e| format!("SPS has invalid pixel dimensions: {e:?}"))?;
    let rfc6381_codec = format!("avc1.{:02X}{:02X}{:02X}", sps[1], sps[2], sps[3]);

    // Create the AVCDecoderConfiguration, ISO/IEC 14496-15 section 5.2.4.1.
    // The beginning takes profile_idc, the constraint flags, and level_idc
    // straight from the SPS.
    let sps_len = u16::try_from(sps.len()).map_err(|_| "SPS is too long".to_owned())?;
    let pps_len = u16::try_from(pps.len()).map_err(|_| "PPS is too long".to_owned())?;
    let mut avc_decoder_config = BytesMut::with_capacity(11 + sps.len() + pps.len());
    avc_decoder_config.put_u8(1); // configurationVersion
    avc_decoder_config.extend_from_slice(&sps[1..4]);

    // lengthSizeMinusOne = 3, matching the 4-byte length prefixes on access units.
    avc_decoder_config.put_u8(0xff);

    // One SPS: reserved 0b111 and a 5-bit count.
    avc_decoder_config.put_u8(0xe1);
    avc_decoder_config.put_u16(sps_len);
    avc_decoder_config.extend_from_slice(sps);
    avc_decoder_config.put_u8(1); // # of PPSs.
    avc_decoder_config.put_u16(pps_len);
    avc_decoder_config.extend_from_slice(pps);

    Ok(VideoParameters {
        kind: MediaKind::H264,
        pixel_dimensions,
        rfc6381_codec,
        profile_idc: sps[1],
        level_idc: sps[3],
        parameter_sets: vec![Bytes::copy_from_slice(sps), Bytes::copy_from_slice(pps)],
        extra_data: avc_decoder_config.freeze(),
    })
}
