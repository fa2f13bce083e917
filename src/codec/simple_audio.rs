// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Audio codecs carried as one frame per packet: the fixed-size sample codecs
//! of [RFC 3551 section 4.5](https://datatracker.ietf.org/doc/html/rfc3551#section-4.5)
//! and Opus ([RFC 7587](https://datatracker.ietf.org/doc/html/rfc7587)).

use std::num::{NonZeroU16, NonZeroU32};
use std::time::Duration;

use bytes::Bytes;
use log::debug;

use crate::client::timeline::{ticks_to_duration, AudioTimeline};
use crate::rtp::ReceivedPacket;

use super::{AccessUnit, AudioParameters, MediaKind};

/// Clock rate assumed when the SDP doesn't give one.
pub(crate) const DEFAULT_CLOCK_RATE: u32 = 8_000;

const OPUS_DEFAULT_FRAME: Duration = Duration::from_millis(20);

/// How to compute the duration of an Opus packet.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OpusFraming {
    /// Assume every packet holds 20 ms, the common camera configuration.
    #[default]
    Fixed20Ms,

    /// Decode the TOC byte ([RFC 6716 section 3.1](https://datatracker.ietf.org/doc/html/rfc6716#section-3.1)).
    Toc,
}

/// Returns the duration of an Opus packet per its TOC byte, or `None` if malformed.
fn opus_packet_duration(payload: &[u8]) -> Option<Duration> {
    let &toc = payload.first()?;
    let config = toc >> 3;

    // Frame sizes in units of 100 µs, per the config ranges of RFC 6716 Table 2.
    let frame_tenths_ms: u64 = match config {
        0..=11 => [100, 200, 400, 600][usize::from(config & 0b11)],
        12..=15 => [100, 200][usize::from(config & 0b1)],
        _ => [25, 50, 100, 200][usize::from(config & 0b11)],
    };
    let frames: u64 = match toc & 0b11 {
        0 => 1,
        1 | 2 => 2,
        _ => {
            let &count = payload.get(1)?;
            let count = count & 0b0011_1111;
            if count == 0 {
                return None;
            }
            u64::from(count)
        }
    };
    let duration = Duration::from_micros(frame_tenths_ms * frames * 100);

    // A packet may hold at most 120 ms of audio.
    (duration <= Duration::from_millis(120)).then_some(duration)
}

/// Returns parameters for codecs without out-of-band configuration.
pub(super) fn parameters(
    kind: MediaKind,
    clock_rate: u32,
    channels: Option<NonZeroU16>,
) -> Result<AudioParameters, String> {
    if clock_rate == 0 {
        return Err(format!("{kind} clock rate must be non-zero"));
    }
    Ok(AudioParameters {
        kind,
        rfc6381_codec: (kind == MediaKind::Opus).then(|| "opus".to_owned()),
        sample_rate: clock_rate,
        channels: channels.map_or(1, NonZeroU16::get),
        frame_length: None,
        extra_data: Bytes::new(),
    })
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    track: usize,
    kind: MediaKind,
    clock_rate: NonZeroU32,
    channels: NonZeroU16,
    opus_framing: OpusFraming,
    timeline: AudioTimeline,
    pending: Option<AccessUnit>,
}

impl Depacketizer {
    pub(super) fn new(
        track: usize,
        kind: MediaKind,
        clock_rate: u32,
        channels: Option<NonZeroU16>,
        opus_framing: OpusFraming,
    ) -> Result<Self, String> {
        let clock_rate = NonZeroU32::new(clock_rate)
            .ok_or_else(|| format!("{kind} clock rate must be non-zero"))?;
        Ok(Self {
            track,
            kind,
            clock_rate,
            channels: channels.unwrap_or(NonZeroU16::MIN),
            opus_framing,
            timeline: AudioTimeline::default(),
            pending: None,
        })
    }

    fn duration(&self, payload: &[u8]) -> Result<Duration, String> {
        let len = payload.len() as u64;
        Ok(match self.kind {
            // One byte per sample.
            MediaKind::PcmMuLaw | MediaKind::PcmALaw => ticks_to_duration(len, self.clock_rate),
            MediaKind::Pcm => {
                let frame_bytes = 2 * u64::from(self.channels.get());
                if len % frame_bytes != 0 {
                    return Err(format!(
                        "invalid length {len} for {}-channel 16-bit PCM",
                        self.channels
                    ));
                }
                ticks_to_duration(len / frame_bytes, self.clock_rate)
            }
            MediaKind::Opus => match self.opus_framing {
                OpusFraming::Fixed20Ms => OPUS_DEFAULT_FRAME,
                OpusFraming::Toc => opus_packet_duration(payload).unwrap_or_else(|| {
                    debug!("malformed Opus TOC; assuming 20 ms");
                    OPUS_DEFAULT_FRAME
                }),
            },
            _ => return Err(format!("{} isn't a simple audio codec", self.kind)),
        })
    }

    pub(super) fn set_origin(&mut self, origin: Duration) {
        self.timeline.set_origin(origin);
    }

    pub(super) fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        if pkt.payload().is_empty() {
            return Err("empty audio payload".to_owned());
        }
        let duration = self.duration(pkt.payload())?;
        let stamp = self.timeline.next(duration);
        let loss = pkt.loss();
        self.pending = Some(AccessUnit {
            track: self.track,
            data: pkt.into_payload_bytes(),
            pts: stamp.pts,
            duration: stamp.duration,
            is_key_frame: true,
            composition_offset: Duration::ZERO,
            loss,
        });
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<AccessUnit> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::packet;

    #[test]
    fn g711() {
        let mut d = Depacketizer::new(0, MediaKind::PcmMuLaw, 8_000, None, OpusFraming::default())
            .unwrap();
        d.push(packet(0, 0, 0, &[0xffu8; 160])).unwrap();
        let a = d.pull().unwrap();
        assert_eq!(a.duration, Duration::from_millis(20));
        assert_eq!(a.pts, Duration::ZERO);
        assert_eq!(a.data.len(), 160);
        assert!(d.pull().is_none());
        d.push(packet(0, 1, 160, &[0xffu8; 80])).unwrap();
        let b = d.pull().unwrap();
        assert_eq!(b.pts, Duration::from_millis(20));
        assert_eq!(b.duration, Duration::from_millis(10));
    }

    #[test]
    fn l16_stereo() {
        let mut d = Depacketizer::new(
            0,
            MediaKind::Pcm,
            44_100,
            NonZeroU16::new(2),
            OpusFraming::default(),
        )
        .unwrap();
        d.push(packet(0, 0, 0, &[0u8; 4 * 441])).unwrap();
        assert_eq!(d.pull().unwrap().duration, Duration::from_millis(10));
        d.push(packet(0, 1, 0, &[0u8; 6])).unwrap_err();
        d.push(packet(0, 2, 0, &[])).unwrap_err();
    }

    #[test]
    fn opus_framing() {
        let mut fixed =
            Depacketizer::new(0, MediaKind::Opus, 48_000, None, OpusFraming::Fixed20Ms).unwrap();
        // config 3 (SILK NB 60 ms), code 0: one frame.
        fixed.push(packet(0, 0, 0, b"\x18data")).unwrap();
        assert_eq!(fixed.pull().unwrap().duration, Duration::from_millis(20));

        let mut toc = Depacketizer::new(0, MediaKind::Opus, 48_000, None, OpusFraming::Toc).unwrap();
        toc.push(packet(0, 0, 0, b"\x18data")).unwrap();
        assert_eq!(toc.pull().unwrap().duration, Duration::from_millis(60));

        // config 31 (CELT FB 20 ms), code 1: two frames.
        toc.push(packet(0, 1, 0, b"\xf9data")).unwrap();
        assert_eq!(toc.pull().unwrap().duration, Duration::from_millis(40));

        // config 16 (CELT NB 2.5 ms), code 3 with 4 frames.
        toc.push(packet(0, 2, 0, b"\x83\x04data")).unwrap();
        assert_eq!(toc.pull().unwrap().duration, Duration::from_millis(10));

        // Code 3 with no count byte falls back to 20 ms.
        toc.push(packet(0, 3, 0, b"\x83")).unwrap();
        assert_eq!(toc.pull().unwrap().duration, Duration::from_millis(20));
    }

    #[test]
    fn default_parameters() {
        let p = parameters(MediaKind::PcmALaw, DEFAULT_CLOCK_RATE, None).unwrap();
        assert_eq!(p.sample_rate(), 8_000);
        assert_eq!(p.channels(), 1);
        assert_eq!(p.rfc6381_codec(), None);
        parameters(MediaKind::Opus, 0, None).unwrap_err();
    }
}
