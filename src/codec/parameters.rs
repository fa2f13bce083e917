// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tracks a video track's parameter sets and derives its [`CodecDescriptor`].

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, warn};

use super::{CodecDescriptor, MediaKind, ParameterSetDecoder, ParameterSets};

/// Holds the latest VPS/SPS/PPS of one H.264 or H.265 track.
///
/// A descriptor is produced only once the full set is present (SPS+PPS for
/// H.264, VPS+SPS+PPS for H.265). Repeated identical parameter sets, which
/// cameras typically send before every IDR, change nothing.
pub struct ParameterSetTracker {
    kind: MediaKind,
    decoder: Arc<dyn ParameterSetDecoder>,
    vps: Option<Bytes>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    descriptor: Option<CodecDescriptor>,

    /// True if `descriptor` was replaced since the last `take_changed`.
    changed: bool,
}

impl std::fmt::Debug for ParameterSetTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSetTracker")
            .field("kind", &self.kind)
            .field("vps", &self.vps.as_deref().map(crate::hex::LimitedHex::head))
            .field("sps", &self.sps.as_deref().map(crate::hex::LimitedHex::head))
            .field("pps", &self.pps.as_deref().map(crate::hex::LimitedHex::head))
            .field("descriptor", &self.descriptor)
            .field("changed", &self.changed)
            .finish()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Slot {
    Vps,
    Sps,
    Pps,
}

impl ParameterSetTracker {
    pub fn new(kind: MediaKind, decoder: Arc<dyn ParameterSetDecoder>) -> Self {
        Self {
            kind,
            decoder,
            vps: None,
            sps: None,
            pps: None,
            descriptor: None,
            changed: false,
        }
    }

    pub fn update_vps(&mut self, nal: &[u8]) {
        if self.kind != MediaKind::H265 {
            debug!("ignoring VPS on {} track", self.kind);
            return;
        }
        self.update(Slot::Vps, nal, true);
    }

    pub fn update_sps(&mut self, nal: &[u8]) {
        self.update(Slot::Sps, nal, true);
    }

    pub fn update_pps(&mut self, nal: &[u8]) {
        self.update(Slot::Pps, nal, true);
    }

    /// Stores out-of-band parameter sets, classified by NAL type. The
    /// resulting descriptor (if any) is the track's initial one, so this
    /// doesn't count as a change.
    pub fn seed(&mut self, nals: &[Bytes]) {
        for nal in nals {
            // Some cameras leave a trailing start code on sprop-parameter-sets.
            let nal: &[u8] = nal;
            let nal = nal.strip_suffix(b"\x00\x00\x00\x01").unwrap_or(nal);
            match self.classify(nal) {
                Some(slot) => self.update(slot, nal, false),
                None => debug!(
                    "ignoring out-of-band NAL {:?} on {} track",
                    crate::hex::LimitedHex::head(nal),
                    self.kind
                ),
            }
        }
    }

    fn classify(&self, nal: &[u8]) -> Option<Slot> {
        let &b0 = nal.first()?;
        match self.kind {
            MediaKind::H264 => match b0 & 0x1f {
                7 => Some(Slot::Sps),
                8 => Some(Slot::Pps),
                _ => None,
            },
            MediaKind::H265 => match (b0 >> 1) & 0x3f {
                32 => Some(Slot::Vps),
                33 => Some(Slot::Sps),
                34 => Some(Slot::Pps),
                _ => None,
            },
            _ => None,
        }
    }

    fn update(&mut self, slot: Slot, nal: &[u8], report: bool) {
        let stored = match slot {
            Slot::Vps => &mut self.vps,
            Slot::Sps => &mut self.sps,
            Slot::Pps => &mut self.pps,
        };
        if stored.as_deref() == Some(nal) {
            return;
        }
        debug!("{} track: new {:?} of {} bytes", self.kind, slot, nal.len());
        *stored = Some(Bytes::copy_from_slice(nal));
        self.try_decode(report);
    }

    fn is_complete(&self) -> bool {
        let needs_vps = self.kind == MediaKind::H265;
        self.sps.is_some() && self.pps.is_some() && (!needs_vps || self.vps.is_some())
    }

    fn try_decode(&mut self, report: bool) {
        if !self.is_complete() {
            return;
        }
        let sets = ParameterSets {
            vps: self.vps.as_deref(),
            sps: self.sps.as_deref(),
            pps: self.pps.as_deref(),
            ..Default::default()
        };
        match self.decoder.decode(self.kind, &sets) {
            Ok(d) => {
                debug!("{} track: parameters now {:?}", self.kind, &d);
                self.descriptor = Some(d);
                self.changed |= report;
            }
            Err(e) => warn!(
                "{} track: unable to decode parameter sets; keeping previous descriptor: {}",
                self.kind, e
            ),
        }
    }

    pub fn descriptor(&self) -> Option<&CodecDescriptor> {
        self.descriptor.as_ref()
    }

    /// Returns the current descriptor if it changed since the last call.
    pub fn take_changed(&mut self) -> Option<CodecDescriptor> {
        if !std::mem::take(&mut self.changed) {
            return None;
        }
        self.descriptor.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::codec::{AudioParameters, VideoParameters};

    /// Decoder which reports the SPS length as the width and counts calls.
    #[derive(Default)]
    struct CountingDecoder {
        calls: AtomicUsize,
    }

    impl ParameterSetDecoder for CountingDecoder {
        fn decode(
            &self,
            kind: MediaKind,
            sets: &ParameterSets<'_>,
        ) -> Result<CodecDescriptor, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let sps = sets.sps.ok_or("no sps")?;
            if sps.get(1) == Some(&0xff) {
                return Err("unparseable sps".to_owned());
            }
            Ok(CodecDescriptor::Video(VideoParameters {
                kind,
                pixel_dimensions: (sps.len() as u32, 1),
                rfc6381_codec: String::new(),
                profile_idc: 0,
                level_idc: 0,
                parameter_sets: Vec::new(),
                extra_data: Bytes::new(),
            }))
        }
    }

    fn width(d: &CodecDescriptor) -> u32 {
        match d {
            CodecDescriptor::Video(v) => v.pixel_dimensions.0,
            CodecDescriptor::Audio(AudioParameters { .. }) => unreachable!(),
        }
    }

    fn tracker(kind: MediaKind) -> (ParameterSetTracker, Arc<CountingDecoder>) {
        let decoder = Arc::new(CountingDecoder::default());
        (ParameterSetTracker::new(kind, decoder.clone()), decoder)
    }

    #[test]
    fn publishes_only_complete_sets() {
        crate::testutil::init_logging();
        let (mut t, decoder) = tracker(MediaKind::H264);
        t.update_sps(b"\x67\x01\x02");
        assert!(t.take_changed().is_none());
        assert!(t.descriptor().is_none());
        assert_eq!(decoder.calls.load(Ordering::SeqCst), 0);

        t.update_pps(b"\x68\x01");
        let d = t.take_changed().unwrap();
        assert_eq!(width(&d), 3);
        assert!(t.take_changed().is_none());
    }

    #[test]
    fn identical_updates_are_noops() {
        let (mut t, decoder) = tracker(MediaKind::H264);
        t.update_sps(b"\x67\x01\x02");
        t.update_pps(b"\x68\x01");
        t.take_changed().unwrap();
        for _ in 0..5 {
            t.update_sps(b"\x67\x01\x02");
            t.update_pps(b"\x68\x01");
        }
        assert!(t.take_changed().is_none());
        assert_eq!(decoder.calls.load(Ordering::SeqCst), 1);

        t.update_sps(b"\x67\x01\x02\x03");
        assert_eq!(width(&t.take_changed().unwrap()), 4);
    }

    #[test]
    fn decode_failure_keeps_previous() {
        let (mut t, _) = tracker(MediaKind::H264);
        t.update_sps(b"\x67\x01\x02");
        t.update_pps(b"\x68\x01");
        t.take_changed().unwrap();
        t.update_sps(b"\x67\xff");
        assert!(t.take_changed().is_none());
        assert_eq!(width(t.descriptor().unwrap()), 3);
    }

    #[test]
    fn h265_needs_vps() {
        let (mut t, _) = tracker(MediaKind::H265);
        t.update_sps(b"\x42\x01\x01");
        t.update_pps(b"\x44\x01");
        assert!(t.take_changed().is_none());
        t.update_vps(b"\x40\x01");
        assert!(t.take_changed().is_some());
    }

    #[test]
    fn h264_ignores_vps() {
        let (mut t, decoder) = tracker(MediaKind::H264);
        t.update_vps(b"\x40\x01");
        assert!(t.vps.is_none());
        assert_eq!(decoder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn seeding_is_not_a_change() {
        let (mut t, _) = tracker(MediaKind::H264);
        t.seed(&[
            Bytes::from_static(b"\x67\x01\x02\x00\x00\x00\x01"),
            Bytes::from_static(b"\x68\x01"),
            Bytes::from_static(b"\x06\x05"),
        ]);
        assert_eq!(width(t.descriptor().unwrap()), 3);
        assert!(t.take_changed().is_none());

        // The same sets arriving in-band don't count as a change either.
        t.update_sps(b"\x67\x01\x02");
        assert!(t.take_changed().is_none());
    }
}
