// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Codec-specific logic for the supported audio and video media types.
//!
//! This consists of RTP depacketization for each codec plus the decoding of
//! codec parameters (SPS/PPS/VPS, AAC `AudioSpecificConfig`) into a
//! [`CodecDescriptor`].

use std::num::{NonZeroU16, NonZeroU32};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pretty_hex::PrettyHex;

use crate::rtp::ReceivedPacket;

pub(crate) mod aac;
pub(crate) mod h264;
pub(crate) mod h265;
mod h26x;
pub mod parameters;
pub(crate) mod simple_audio;

pub use parameters::ParameterSetTracker;
pub use simple_audio::OpusFraming;

/// The closed set of media encodings this crate can depacketize.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    H264,
    H265,
    Aac,

    /// Linear 16-bit big-endian PCM (`L16`).
    Pcm,
    PcmALaw,
    PcmMuLaw,
    Opus,
}

impl MediaKind {
    /// Maps an SDP `m=` media type and `rtpmap` encoding name, as in the
    /// [IANA registry](https://www.iana.org/assignments/rtp-parameters/rtp-parameters.xhtml#rtp-parameters-2).
    pub fn from_encoding_name(media: &str, encoding_name: &str) -> Option<Self> {
        let encoding_name = encoding_name.to_ascii_lowercase();
        Some(match (media, &encoding_name[..]) {
            ("video", "h264") => MediaKind::H264,
            ("video", "h265") | ("video", "hevc") => MediaKind::H265,
            ("audio", "mpeg4-generic") => MediaKind::Aac,
            ("audio", "l16") => MediaKind::Pcm,
            ("audio", "pcma") => MediaKind::PcmALaw,
            ("audio", "pcmu") => MediaKind::PcmMuLaw,
            ("audio", "opus") => MediaKind::Opus,
            _ => return None,
        })
    }

    pub fn is_video(self) -> bool {
        matches!(self, MediaKind::H264 | MediaKind::H265)
    }

    pub fn name(self) -> &'static str {
        match self {
            MediaKind::H264 => "H264",
            MediaKind::H265 => "H265",
            MediaKind::Aac => "AAC",
            MediaKind::Pcm => "PCM",
            MediaKind::PcmALaw => "PCM_ALAW",
            MediaKind::PcmMuLaw => "PCM_MULAW",
            MediaKind::Opus => "OPUS",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Codec metadata needed to decode a track's access units.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodecDescriptor {
    Video(VideoParameters),
    Audio(AudioParameters),
}

impl CodecDescriptor {
    pub fn kind(&self) -> MediaKind {
        match self {
            CodecDescriptor::Video(v) => v.kind,
            CodecDescriptor::Audio(a) => a.kind,
        }
    }
}

/// The current descriptor of each track, indexed by track. Replaced
/// wholesale on every change.
pub type Descriptors = Arc<[Option<CodecDescriptor>]>;

#[derive(Clone, PartialEq, Eq)]
pub struct VideoParameters {
    pub(crate) kind: MediaKind,
    pub(crate) pixel_dimensions: (u32, u32),
    pub(crate) rfc6381_codec: String,
    pub(crate) profile_idc: u8,
    pub(crate) level_idc: u8,

    /// Raw NALs, in VPS (H.265 only), SPS, PPS order.
    pub(crate) parameter_sets: Vec<Bytes>,
    pub(crate) extra_data: Bytes,
}

impl VideoParameters {
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Returns a codec description in
    /// [RFC-6381](https://tools.ietf.org/html/rfc6381) form, eg `avc1.4D401E`.
    pub fn rfc6381_codec(&self) -> &str {
        &self.rfc6381_codec
    }

    /// Returns the displayed dimensions of the video frame in pixels, as `(width, height)`.
    pub fn pixel_dimensions(&self) -> (u32, u32) {
        self.pixel_dimensions
    }

    pub fn profile_idc(&self) -> u8 {
        self.profile_idc
    }

    pub fn level_idc(&self) -> u8 {
        self.level_idc
    }

    pub fn parameter_sets(&self) -> &[Bytes] {
        &self.parameter_sets
    }

    /// The codec-specific "extra data" to feed to eg ffmpeg to decode the video frames.
    /// *   H.264: an AvcDecoderConfig.
    /// *   H.265: empty; use [`VideoParameters::parameter_sets`].
    pub fn extra_data(&self) -> &Bytes {
        &self.extra_data
    }
}

impl std::fmt::Debug for VideoParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoParameters")
            .field("kind", &self.kind)
            .field("rfc6381_codec", &self.rfc6381_codec)
            .field("pixel_dimensions", &self.pixel_dimensions)
            .field("profile_idc", &self.profile_idc)
            .field("level_idc", &self.level_idc)
            .field("extra_data", &self.extra_data.hex_dump())
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AudioParameters {
    pub(crate) kind: MediaKind,
    pub(crate) rfc6381_codec: Option<String>,
    pub(crate) sample_rate: u32,
    pub(crate) channels: u16,

    /// Samples per frame, if fixed by the codec configuration.
    pub(crate) frame_length: Option<NonZeroU32>,
    pub(crate) extra_data: Bytes,
}

impl AudioParameters {
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn rfc6381_codec(&self) -> Option<&str> {
        self.rfc6381_codec.as_deref()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frame_length(&self) -> Option<NonZeroU32> {
        self.frame_length
    }

    /// The codec-specific "extra data" to feed to eg ffmpeg to decode the audio.
    /// *   AAC: a serialized `AudioSpecificConfig`.
    pub fn extra_data(&self) -> &Bytes {
        &self.extra_data
    }
}

impl std::fmt::Debug for AudioParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioParameters")
            .field("kind", &self.kind)
            .field("rfc6381_codec", &self.rfc6381_codec)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("frame_length", &self.frame_length)
            .field("extra_data", &self.extra_data.hex_dump())
            .finish()
    }
}

/// Inputs to a [`ParameterSetDecoder`]. Video codecs use the NAL fields;
/// audio codecs use the remainder.
#[derive(Copy, Clone, Debug, Default)]
pub struct ParameterSets<'a> {
    pub vps: Option<&'a [u8]>,
    pub sps: Option<&'a [u8]>,
    pub pps: Option<&'a [u8]>,
    pub audio_config: Option<&'a [u8]>,
    pub clock_rate: u32,
    pub channels: Option<NonZeroU16>,
}

/// Turns raw parameter sets into a [`CodecDescriptor`].
///
/// The default, [`DefaultParameterSetDecoder`], reads just the fields needed
/// for dimensions and codec strings. Supply another through
/// [`crate::client::SessionOptions::parameter_set_decoder`] to use a fuller parser.
pub trait ParameterSetDecoder: Send + Sync {
    fn decode(&self, kind: MediaKind, sets: &ParameterSets<'_>) -> Result<CodecDescriptor, String>;
}

#[derive(Copy, Clone, Debug, Default)]
pub struct DefaultParameterSetDecoder;

impl ParameterSetDecoder for DefaultParameterSetDecoder {
    fn decode(&self, kind: MediaKind, sets: &ParameterSets<'_>) -> Result<CodecDescriptor, String> {
        match kind {
            MediaKind::H264 => {
                let (Some(sps), Some(pps)) = (sets.sps, sets.pps) else {
                    return Err("H.264 requires SPS and PPS".to_owned());
                };
                h264::decode_parameters(sps, pps).map(CodecDescriptor::Video)
            }
            MediaKind::H265 => {
                let (Some(vps), Some(sps), Some(pps)) = (sets.vps, sets.sps, sets.pps) else {
                    return Err("H.265 requires VPS, SPS, and PPS".to_owned());
                };
                h265::decode_parameters(vps, sps, pps).map(CodecDescriptor::Video)
            }
            MediaKind::Aac => {
                let config = sets
                    .audio_config
                    .ok_or_else(|| "AAC requires an AudioSpecificConfig".to_owned())?;
                aac::decode_parameters(config).map(CodecDescriptor::Audio)
            }
            MediaKind::Pcm | MediaKind::PcmALaw | MediaKind::PcmMuLaw | MediaKind::Opus => {
                simple_audio::parameters(kind, sets.clock_rate, sets.channels)
                    .map(CodecDescriptor::Audio)
            }
        }
    }
}

/// Presentation-time offset reported on every video access unit.
pub(crate) const VIDEO_COMPOSITION_OFFSET: Duration = Duration::from_millis(1);

/// One complete encoded frame: a video access unit or an audio frame.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub track: usize,

    /// For video, a 4-byte big-endian length followed by the NAL unit. For
    /// audio, the raw frame.
    pub data: Bytes,

    /// Time since session start. Each track's first unit sits at its
    /// arrival offset from `PLAY`; later units advance by RTP time.
    pub pts: Duration,
    pub duration: Duration,

    /// True for an IDR picture: decodable without reference to earlier units.
    pub is_key_frame: bool,

    /// Advisory offset between decode and presentation time.
    pub composition_offset: Duration,

    /// Number of lost RTP packets before the packet completing this unit.
    /// Loss is only reported; nothing is repaired.
    pub loss: u16,
}

impl std::fmt::Debug for AccessUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessUnit")
            .field("track", &self.track)
            .field("pts", &self.pts)
            .field("duration", &self.duration)
            .field("is_key_frame", &self.is_key_frame)
            .field("composition_offset", &self.composition_offset)
            .field("loss", &self.loss)
            .field("data", &crate::hex::LimitedHex::head(&self.data))
            .finish()
    }
}

/// Turns RTP packets into [`AccessUnit`]s.
///
/// One is selected per track at SETUP time. Unstable; exposed for benchmarks.
#[doc(hidden)]
#[derive(Debug)]
pub struct Depacketizer(DepacketizerInner);

#[derive(Debug)]
enum DepacketizerInner {
    H264(h264::Depacketizer),
    H265(h265::Depacketizer),
    Aac(aac::Depacketizer),
    SimpleAudio(simple_audio::Depacketizer),
}

impl Depacketizer {
    /// Creates a depacketizer for `track`.
    ///
    /// `decoder` turns parameter sets seen in-band (or seeded from SDP) into
    /// a [`CodecDescriptor`]; audio depacketizers don't use it.
    pub fn new(
        track: usize,
        kind: MediaKind,
        clock_rate: u32,
        channels: Option<NonZeroU16>,
        decoder: Arc<dyn ParameterSetDecoder>,
        opus_framing: OpusFraming,
    ) -> Result<Self, String> {
        Ok(Depacketizer(match kind {
            MediaKind::H264 => DepacketizerInner::H264(h264::Depacketizer::new(
                track,
                clock_rate,
                ParameterSetTracker::new(kind, decoder),
            )?),
            MediaKind::H265 => DepacketizerInner::H265(h265::Depacketizer::new(
                track,
                clock_rate,
                ParameterSetTracker::new(kind, decoder),
            )?),
            MediaKind::Aac => DepacketizerInner::Aac(aac::Depacketizer::new(track, clock_rate)?),
            MediaKind::Pcm | MediaKind::PcmALaw | MediaKind::PcmMuLaw | MediaKind::Opus => {
                DepacketizerInner::SimpleAudio(simple_audio::Depacketizer::new(
                    track,
                    kind,
                    clock_rate,
                    channels,
                    opus_framing,
                )?)
            }
        }))
    }

    fn tracker_mut(&mut self) -> Option<&mut ParameterSetTracker> {
        match &mut self.0 {
            DepacketizerInner::H264(d) => Some(d.tracker_mut()),
            DepacketizerInner::H265(d) => Some(d.tracker_mut()),
            DepacketizerInner::Aac(_) | DepacketizerInner::SimpleAudio(_) => None,
        }
    }

    /// Seeds out-of-band parameter sets (from SDP) without reporting a change.
    pub fn seed_parameter_sets(&mut self, nals: &[Bytes]) {
        if let Some(t) = self.tracker_mut() {
            t.seed(nals);
        }
    }

    /// Returns the descriptor derived from the current parameter sets, if
    /// complete. Always `None` for audio, whose descriptor comes from SDP.
    pub fn descriptor(&self) -> Option<&CodecDescriptor> {
        match &self.0 {
            DepacketizerInner::H264(d) => d.tracker().descriptor(),
            DepacketizerInner::H265(d) => d.tracker().descriptor(),
            DepacketizerInner::Aac(_) | DepacketizerInner::SimpleAudio(_) => None,
        }
    }

    /// Sets the presentation time of this track's first unit, relative to
    /// session start. Ignored once a unit has been produced.
    pub fn set_origin(&mut self, origin: Duration) {
        match &mut self.0 {
            DepacketizerInner::H264(d) => d.set_origin(origin),
            DepacketizerInner::H265(d) => d.set_origin(origin),
            DepacketizerInner::Aac(d) => d.set_origin(origin),
            DepacketizerInner::SimpleAudio(d) => d.set_origin(origin),
        }
    }

    /// Consumes one packet. Errors describe a malformed payload; the
    /// depacketizer remains usable afterward.
    pub fn push(&mut self, pkt: ReceivedPacket) -> Result<(), String> {
        match &mut self.0 {
            DepacketizerInner::H264(d) => d.push(pkt),
            DepacketizerInner::H265(d) => d.push(pkt),
            DepacketizerInner::Aac(d) => d.push(pkt),
            DepacketizerInner::SimpleAudio(d) => d.push(pkt),
        }
    }

    /// Returns the next completed access unit, if any.
    pub fn pull(&mut self) -> Option<AccessUnit> {
        match &mut self.0 {
            DepacketizerInner::H264(d) => d.pull(),
            DepacketizerInner::H265(d) => d.pull(),
            DepacketizerInner::Aac(d) => d.pull(),
            DepacketizerInner::SimpleAudio(d) => d.pull(),
        }
    }

    /// Returns the descriptor published by in-band parameter sets since the
    /// last call, if any.
    pub fn take_changed(&mut self) -> Option<CodecDescriptor> {
        self.tracker_mut().and_then(ParameterSetTracker::take_changed)
    }
}
