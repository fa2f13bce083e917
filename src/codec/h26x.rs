// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common logic between H.264 and H.265.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, warn};
use smallvec::SmallVec;

use crate::client::timeline::VideoTimeline;

use super::AccessUnit;

/// Upper bound on a single reassembled NAL. A stream that exceeds it is
/// almost certainly missing an end fragment.
pub(crate) const MAX_REASSEMBLY_BYTES: usize = 4 * 1024 * 1024;

/// `h264_reader::rbsp::BitRead` impl that *notes* extra trailing data rather than failing on it.
///
/// Some (Reolink) cameras appear to have a stray extra byte at the end of
/// their parameter sets; most RTSP implementations tolerate this.
#[derive(Debug)]
pub(super) struct TolerantBitReader<'a, R> {
    pub(super) inner: R,
    pub(super) has_extra_trailing_data: &'a mut bool,
}

impl<R: h264_reader::rbsp::BitRead> h264_reader::rbsp::BitRead for TolerantBitReader<'_, R> {
    fn read_ue(&mut self, name: &'static str) -> Result<u32, h264_reader::rbsp::BitReaderError> {
        self.inner.read_ue(name)
    }

    fn read_se(&mut self, name: &'static str) -> Result<i32, h264_reader::rbsp::BitReaderError> {
        self.inner.read_se(name)
    }

    fn read_bool(&mut self, name: &'static str) -> Result<bool, h264_reader::rbsp::BitReaderError> {
        self.inner.read_bool(name)
    }

    fn skip(
        &mut self,
        bit_count: u32,
        name: &'static str,
    ) -> Result<(), h264_reader::rbsp::BitReaderError> {
        self.inner.skip(bit_count, name)
    }

    fn read<U: h264_reader::rbsp::Numeric>(
        &mut self,
        bit_count: u32,
        name: &'static str,
    ) -> Result<U, h264_reader::rbsp::BitReaderError> {
        self.inner.read(bit_count, name)
    }

    fn read_to<V: h264_reader::rbsp::Primitive>(
        &mut self,
        name: &'static str,
    ) -> Result<V, h264_reader::rbsp::BitReaderError> {
        self.inner.read_to(name)
    }

    fn has_more_rbsp_data(
        &mut self,
        name: &'static str,
    ) -> Result<bool, h264_reader::rbsp::BitReaderError> {
        self.inner.has_more_rbsp_data(name)
    }

    fn finish_rbsp(self) -> Result<(), h264_reader::rbsp::BitReaderError> {
        match self.inner.finish_rbsp() {
            Ok(()) => Ok(()),
            Err(h264_reader::rbsp::BitReaderError::RemainingData) => {
                *self.has_extra_trailing_data = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn finish_sei_payload(self) -> Result<(), h264_reader::rbsp::BitReaderError> {
        self.inner.finish_sei_payload()
    }
}

/// Returns true if `data` contains an Annex B start code (`00 00 01`) anywhere.
pub(super) fn contains_start_code(data: &[u8]) -> bool {
    data.windows(3).any(|w| w == b"\x00\x00\x01")
}

/// Returns true if `data` begins with a 3- or 4-byte Annex B start code.
pub(super) fn starts_with_start_code(data: &[u8]) -> bool {
    data.starts_with(b"\x00\x00\x01") || data.starts_with(b"\x00\x00\x00\x01")
}

/// Splits an Annex B byte stream into its NAL units.
///
/// Bytes before the first start code, if any, form the first NAL. Trailing
/// zero bytes (either `trailing_zero_8bits` or the leading zero of a 4-byte
/// start code) are trimmed, and empty pieces are skipped.
pub(super) fn split_annex_b(data: &[u8]) -> SmallVec<[&[u8]; 4]> {
    let mut out = SmallVec::new();
    let mut nal_start = 0;
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i..i + 3] == *b"\x00\x00\x01" {
            push_trimmed(&mut out, &data[nal_start..i]);
            i += 3;
            nal_start = i;
        } else {
            i += 1;
        }
    }
    push_trimmed(&mut out, &data[nal_start..]);
    out
}

fn push_trimmed<'a>(out: &mut SmallVec<[&'a [u8]; 4]>, mut nal: &'a [u8]) {
    while let [head @ .., 0] = nal {
        nal = head;
    }
    if !nal.is_empty() {
        out.push(nal);
    }
}

/// Reassembly buffer for one fragmented NAL (H.264 FU-A or H.265 FU).
#[derive(Debug, Default)]
pub(super) struct FragmentBuffer {
    buf: BytesMut,

    /// True between a start fragment and the matching end (or an abandon).
    in_progress: bool,
}

impl FragmentBuffer {
    /// Begins a new NAL with the reconstructed header, discarding any stale partial.
    pub(super) fn start(&mut self, header: &[u8]) {
        if self.in_progress {
            debug!(
                "new fragment start with {} bytes of a previous NAL pending; discarding them",
                self.buf.len()
            );
        }
        self.buf.clear();
        self.buf.extend_from_slice(header);
        self.in_progress = true;
    }

    /// Appends a fragment body. Returns false if there's no NAL in progress
    /// or the NAL has grown too large, in which case the fragment is dropped.
    pub(super) fn append(&mut self, body: &[u8]) -> bool {
        if !self.in_progress {
            debug!("dropping {}-byte fragment with no start", body.len());
            return false;
        }
        if self.buf.len() + body.len() > MAX_REASSEMBLY_BYTES {
            warn!(
                "fragmented NAL exceeds {} bytes; abandoning it",
                MAX_REASSEMBLY_BYTES
            );
            self.abandon();
            return false;
        }
        self.buf.extend_from_slice(body);
        true
    }

    /// Returns the completed NAL, or `None` if there wasn't one in progress.
    pub(super) fn finish(&mut self) -> Option<Bytes> {
        if !std::mem::take(&mut self.in_progress) {
            return None;
        }
        Some(self.buf.split().freeze())
    }

    fn abandon(&mut self) {
        self.buf.clear();
        self.in_progress = false;
    }

    #[cfg(test)]
    pub(super) fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

/// Collects the NALs a packet produces and stamps them as access units.
///
/// The timeline advances once per packet and only if the packet produced at
/// least one NAL, so parameter-set-only packets don't perturb durations.
#[derive(Debug)]
pub(super) struct VideoOutput {
    track: usize,
    timeline: VideoTimeline,
    staged: SmallVec<[(Bytes, bool); 2]>,
    ready: VecDeque<AccessUnit>,

    /// Loss seen on packets which completed no NAL, such as FU middles.
    pending_loss: u16,
}

impl VideoOutput {
    pub(super) fn new(track: usize, clock_rate: u32) -> Result<Self, String> {
        Ok(Self {
            track,
            timeline: VideoTimeline::new(clock_rate)?,
            staged: SmallVec::new(),
            ready: VecDeque::new(),
            pending_loss: 0,
        })
    }

    pub(super) fn set_origin(&mut self, origin: std::time::Duration) {
        self.timeline.set_origin(origin);
    }

    /// Stages one NAL in length-prefixed form.
    pub(super) fn stage(&mut self, nal: &[u8], is_key_frame: bool) {
        let mut data = BytesMut::with_capacity(4 + nal.len());
        // A NAL never exceeds MAX_REASSEMBLY_BYTES, so the length fits.
        data.put_u32(nal.len() as u32);
        data.extend_from_slice(nal);
        self.staged.push((data.freeze(), is_key_frame));
    }

    /// Stamps all NALs staged for the packet with the given RTP timestamp.
    pub(super) fn flush(&mut self, timestamp: u32, loss: u16) {
        self.pending_loss = self.pending_loss.saturating_add(loss);
        if self.staged.is_empty() {
            return;
        }
        let stamp = self.timeline.advance(timestamp);
        let mut loss = std::mem::take(&mut self.pending_loss);
        for (data, is_key_frame) in self.staged.drain(..) {
            self.ready.push_back(AccessUnit {
                track: self.track,
                data,
                pts: stamp.pts,
                duration: stamp.duration,
                is_key_frame,
                composition_offset: super::VIDEO_COMPOSITION_OFFSET,
                loss: std::mem::take(&mut loss),
            });
        }
    }

    pub(super) fn pull(&mut self) -> Option<AccessUnit> {
        self.ready.pop_front()
    }
}
