// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! AAC (Advanced Audio Codec) depacketization.
//! There are many intertwined standards; see the following references:
//! *   [RFC 3640](https://datatracker.ietf.org/doc/html/rfc3640): RTP Payload
//!     for Transport of MPEG-4 Elementary Streams.
//! *   ISO/IEC 13818-7: Advanced Audio Coding.
//! *   ISO/IEC 14496-3: Audio, subpart 1: Main.

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::time::Duration;

use bitstream_io::BitRead;
use bytes::Bytes;
use log::{trace, warn};

use crate::client::timeline::{ticks_to_duration, AudioTimeline};
use crate::rtp::ReceivedPacket;

use super::{AccessUnit, AudioParameters, MediaKind};

/// Samples per AAC-LC frame.
const SAMPLES_PER_FRAME: u64 = 1024;

/// A channel configuration as in ISO/IEC 14496-3 Table 1.19.
#[derive(Debug)]
struct ChannelConfig {
    channels: u16,

    /// A human-friendly name for the channel configuration.
    #[cfg_attr(not(test), allow(dead_code))]
    name: &'static str,
}

#[rustfmt::skip]
const CHANNEL_CONFIGS: [Option<ChannelConfig>; 8] = [
    /* 0 */ None, // "defined in AOT related SpecificConfig"
    /* 1 */ Some(ChannelConfig { channels: 1, name: "mono" }),
    /* 2 */ Some(ChannelConfig { channels: 2, name: "stereo" }),
    /* 3 */ Some(ChannelConfig { channels: 3, name: "3.0" }),
    /* 4 */ Some(ChannelConfig { channels: 4, name: "4.0" }),
    /* 5 */ Some(ChannelConfig { channels: 5, name: "5.0" }),
    /* 6 */ Some(ChannelConfig { channels: 6, name: "5.1" }),
    /* 7 */ Some(ChannelConfig { channels: 8, name: "7.1" }),
];

/// An AudioSpecificConfig as in ISO/IEC 14496-3 section 1.6.2.1.
///
/// Only the fields needed for an [`AudioParameters`] are kept.
#[derive(Debug)]
struct AudioSpecificConfig {
    audio_object_type: u8,
    sampling_frequency: u32,
    channels: &'static ChannelConfig,
    frame_length: NonZeroU32,
}

impl AudioSpecificConfig {
    fn parse(raw: &[u8]) -> Result<Self, String> {
        let mut r = bitstream_io::BitReader::endian(raw, bitstream_io::BigEndian);
        let audio_object_type = match r
            .read::<u8>(5)
            .map_err(|e| format!("unable to read audio_object_type: {e}"))?
        {
            31 => {
                32 + r
                    .read::<u8>(6)
                    .map_err(|e| format!("unable to read audio_object_type ext: {e}"))?
            }
            o => o,
        };

        // ISO/IEC 14496-3 section 1.6.3.3.
        let sampling_frequency = match r
            .read::<u8>(4)
            .map_err(|e| format!("unable to read sampling_frequency: {e}"))?
        {
            0x0 => 96_000,
            0x1 => 88_200,
            0x2 => 64_000,
            0x3 => 48_000,
            0x4 => 44_100,
            0x5 => 32_000,
            0x6 => 24_000,
            0x7 => 22_050,
            0x8 => 16_000,
            0x9 => 12_000,
            0xa => 11_025,
            0xb => 8_000,
            0xc => 7_350,
            v @ 0xd | v @ 0xe => {
                return Err(format!("reserved sampling_frequency_index value 0x{v:x}"))
            }
            _ => r
                .read::<u32>(24)
                .map_err(|e| format!("unable to read sampling_frequency ext: {e}"))?,
        };
        let channels_config_id = r
            .read::<u8>(4)
            .map_err(|e| format!("unable to read channels: {e}"))?;
        let channels = CHANNEL_CONFIGS
            .get(usize::from(channels_config_id))
            .ok_or_else(|| format!("reserved channelConfiguration 0x{channels_config_id:x}"))?
            .as_ref()
            .ok_or_else(|| "program_config_element parsing unimplemented".to_string())?;
        if audio_object_type == 5 || audio_object_type == 29 {
            // extensionSamplingFrequencyIndex + extensionSamplingFrequency.
            if r.read::<u8>(4)
                .map_err(|e| format!("unable to read extensionSamplingFrequencyIndex: {e}"))?
                == 0xf
            {
                r.skip(24)
                    .map_err(|e| format!("unable to read extensionSamplingFrequency: {e}"))?;
            }
            // audioObjectType (a different one) + extensionChannelConfiguration.
            if r.read::<u8>(5)
                .map_err(|e| format!("unable to read second audioObjectType: {e}"))?
                == 22
            {
                r.skip(4)
                    .map_err(|e| format!("unable to read extensionChannelConfiguration: {e}"))?;
            }
        }

        // The supported types here are the ones that use GASpecificConfig.
        match audio_object_type {
            1 | 2 | 3 | 4 | 6 | 7 | 17 | 19 | 20 | 21 | 22 | 23 => {}
            o => return Err(format!("unsupported audio_object_type {o}")),
        }

        // GASpecificConfig, ISO/IEC 14496-3 section 4.4.1.
        let frame_length_flag = r
            .read_bit()
            .map_err(|e| format!("unable to read frame_length_flag: {e}"))?;
        let frame_length = match (audio_object_type, frame_length_flag) {
            (3 /* AAC SR */, false) => 256,
            (3 /* AAC SR */, true) => {
                return Err("frame_length_flag must be false for AAC SSR".into())
            }
            (23 /* ER AAC LD */, false) => 512,
            (23 /* ER AAC LD */, true) => 480,
            (_, false) => 1024,
            (_, true) => 960,
        };
        Ok(AudioSpecificConfig {
            audio_object_type,
            sampling_frequency,
            channels,
            frame_length: NonZeroU32::new(frame_length).ok_or("zero frame length")?,
        })
    }
}

/// Decodes a raw `AudioSpecificConfig` (the hex `config=` of the SDP `fmtp`).
pub(super) fn decode_parameters(raw: &[u8]) -> Result<AudioParameters, String> {
    let config = AudioSpecificConfig::parse(raw)?;
    Ok(AudioParameters {
        kind: MediaKind::Aac,
        // https://datatracker.ietf.org/doc/html/rfc6381#section-3.3
        rfc6381_codec: Some(format!("mp4a.40.{}", config.audio_object_type)),
        sample_rate: config.sampling_frequency,
        channels: config.channels.channels,
        frame_length: Some(config.frame_length),
        extra_data: Bytes::copy_from_slice(raw),
    })
}

/// Returns the length of an ADTS header at the start of `frame`, or 0.
///
/// Some encoders put ADTS-framed AAC into RTP; the header is 7 bytes, or 9
/// when `protection_absent` is 0 and a CRC follows. The header's 13-bit
/// `frame_length` covers the header itself and must fit within `frame`, so
/// raw AAC which merely begins with a sync-like word is left alone.
fn adts_header_len(frame: &[u8]) -> usize {
    let [0xff, b1, _, b3, b4, b5, ..] = *frame else {
        return 0;
    };
    if (b1 & 0xf0) != 0xf0 {
        return 0;
    }
    let header_len = if (b1 & 0x01) == 0 { 9 } else { 7 };
    let frame_length =
        (usize::from(b3 & 0x03) << 11) | (usize::from(b4) << 3) | usize::from(b5 >> 5);
    if frame_length < header_len || frame_length > frame.len() {
        trace!(
            "ADTS-like sync word with frame_length {frame_length} in {}-byte frame; not stripping",
            frame.len()
        );
        return 0;
    }
    header_len
}

/// Depacketizes AAC-hbr (RFC 3640 section 3.3.6) into one access unit per frame.
#[derive(Debug)]
pub(crate) struct Depacketizer {
    track: usize,
    frame_duration: Duration,
    timeline: AudioTimeline,
    ready: VecDeque<AccessUnit>,
}

impl Depacketizer {
    pub(super) fn new(track: usize, clock_rate: u32) -> Result<Self, String> {
        let clock_rate = NonZeroU32::new(clock_rate).ok_or("AAC clock rate must be non-zero")?;
        Ok(Self {
            track,
            frame_duration: ticks_to_duration(SAMPLES_PER_FRAME, clock_rate),
            timeline: AudioTimeline::default(),
            ready: VecDeque::new(),
        })
    }

    pub(super) fn set_origin(&mut self, origin: Duration) {
        self.timeline.set_origin(origin);
    }

    pub(super) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        let mut loss = pkt.loss();
        let payload = pkt.into_payload_bytes();
        if payload.len() < 2 {
            return Err("packet too short for au-headers-length".to_string());
        }
        let au_headers_length_bits = u16::from_be_bytes([payload[0], payload[1]]);
        let au_headers_count = usize::from(au_headers_length_bits / 16);
        if au_headers_count == 0 {
            return Err("packet has no AU headers".to_string());
        }
        let headers_end = 2 + 2 * au_headers_count;
        if payload.len() < headers_end {
            warn!(
                "AAC packet claims {} AU headers but has only {} bytes; dropping it",
                au_headers_count,
                payload.len()
            );
            return Ok(());
        }
        let mut data_off = headers_end;
        for i in 0..au_headers_count {
            let au_header = u16::from_be_bytes([payload[2 + 2 * i], payload[3 + 2 * i]]);
            let size = usize::from(au_header >> 3);
            if payload.len() - data_off < size {
                warn!(
                    "AAC AU {}/{} claims {} bytes; only {} remain; dropping rest of packet",
                    i + 1,
                    au_headers_count,
                    size,
                    payload.len() - data_off
                );
                break;
            }
            let mut frame = payload.slice(data_off..data_off + size);
            data_off += size;
            let adts = adts_header_len(&frame);
            if adts > 0 {
                trace!("stripping {adts}-byte ADTS header");
                frame = frame.slice(adts..);
            }
            let stamp = self.timeline.next(self.frame_duration);
            self.ready.push_back(AccessUnit {
                track: self.track,
                data: frame,
                pts: stamp.pts,
                duration: stamp.duration,
                is_key_frame: true,
                composition_offset: Duration::ZERO,
                loss: std::mem::take(&mut loss),
            });
        }
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<AccessUnit> {
        self.ready.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::packet;

    #[test]
    fn parse_audio_specific_config() {
        let dahua = AudioSpecificConfig::parse(&[0x11, 0x88]).unwrap();
        assert_eq!(dahua.sampling_frequency, 48_000);
        assert_eq!(dahua.channels.name, "mono");
        assert_eq!(dahua.frame_length.get(), 1024);

        let bunny = AudioSpecificConfig::parse(&[0x14, 0x90]).unwrap();
        assert_eq!(bunny.sampling_frequency, 12_000);
        assert_eq!(bunny.channels.name, "stereo");

        let rfc3640 = AudioSpecificConfig::parse(&[0x11, 0xB0]).unwrap();
        assert_eq!(rfc3640.sampling_frequency, 48_000);
        assert_eq!(rfc3640.channels.name, "5.1");

        let p = decode_parameters(&[0x12, 0x10]).unwrap();
        assert_eq!(p.rfc6381_codec(), Some("mp4a.40.2"));
        assert_eq!(p.sample_rate(), 44_100);
        assert_eq!(p.channels(), 2);
        assert_eq!(&p.extra_data()[..], b"\x12\x10");

        AudioSpecificConfig::parse(&[0x11]).unwrap_err();
    }

    #[test]
    fn aggregate() {
        crate::testutil::init_logging();
        let mut d = Depacketizer::new(0, 44_100).unwrap();

        // Two AU headers: sizes 4 and 3.
        d.push(packet(0, 0, 0, b"\x00\x20\x00\x20\x00\x18abcdxyz"))
            .unwrap();
        let a = d.pull().unwrap();
        let b = d.pull().unwrap();
        assert!(d.pull().is_none());
        assert_eq!(&a.data[..], b"abcd");
        assert_eq!(&b.data[..], b"xyz");
        let frame = Duration::from_nanos(23_219_954);
        assert_eq!(a.duration, frame);
        assert_eq!(a.pts, Duration::ZERO);
        assert_eq!(b.pts, frame);
        assert!(a.is_key_frame);
        assert_eq!(a.composition_offset, Duration::ZERO);

        d.push(packet(0, 1, 2048, b"\x00\x10\x00\x10ab")).unwrap();
        assert_eq!(d.pull().unwrap().pts, frame * 2);
    }

    #[test]
    fn strips_adts() {
        let mut d = Depacketizer::new(0, 8_000).unwrap();
        // 7-byte ADTS header (protection_absent=1) then 2 bytes of payload.
        d.push(packet(0, 0, 0, b"\x00\x10\x00\x48\xff\xf1\x50\x80\x01\x3f\xfcab"))
            .unwrap();
        assert_eq!(&d.pull().unwrap().data[..], b"ab");

        // 9-byte ADTS header (protection_absent=0).
        d.push(packet(0, 1, 0, b"\x00\x10\x00\x58\xff\xf0\x50\x80\x01\x7f\xfc\x12\x34ab"))
            .unwrap();
        assert_eq!(&d.pull().unwrap().data[..], b"ab");

        // Sync word, but frame_length (0x400) overruns the 9-byte frame: raw AAC.
        d.push(packet(0, 2, 0, b"\x00\x10\x00\x48\xff\xf1\x50\x80\x80\x1f\xfcab"))
            .unwrap();
        assert_eq!(&d.pull().unwrap().data[..], b"\xff\xf1\x50\x80\x80\x1f\xfcab");
    }

    #[test]
    fn truncated() {
        let mut d = Depacketizer::new(0, 8_000).unwrap();

        // Second AU claims 16 bytes with only 3 left.
        d.push(packet(0, 0, 0, b"\x00\x20\x00\x20\x00\x80abcdxyz"))
            .unwrap();
        assert_eq!(&d.pull().unwrap().data[..], b"abcd");
        assert!(d.pull().is_none());

        // Header section itself is cut short.
        d.push(packet(0, 1, 0, b"\x00\x40\x00\x20")).unwrap();
        assert!(d.pull().is_none());

        d.push(packet(0, 2, 0, b"\x00")).unwrap_err();
    }
}
