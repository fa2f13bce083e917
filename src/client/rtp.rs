// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP sequence tracking; see [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550).

use bytes::Bytes;
use log::{debug, trace, warn};

use crate::rtp::{RawPacket, ReceivedPacket};

/// Per-track sequence number bookkeeping.
///
/// Reports gaps via [`ReceivedPacket::loss`] and logs them, but never
/// reorders or drops packets. Over TCP, a gap means the server discarded
/// packets before sending; there's nothing to wait for.
///
/// A change of SSRC restarts tracking. [RFC 3550 section
/// 8.2](https://tools.ietf.org/html/rfc3550#section-8.2) allows this after
/// an RTCP BYE, and some cameras do it without one when their encoder
/// restarts.
#[derive(Debug, Default)]
pub(super) struct SequenceChecker {
    ssrc: Option<u32>,
    next_seq: Option<u16>,
}

impl SequenceChecker {
    /// Validates `data` as an RTP packet for `track` and computes its loss.
    ///
    /// Returns `None` for a malformed packet, after logging it.
    pub(super) fn process(&mut self, track: usize, data: Bytes) -> Option<ReceivedPacket> {
        let (raw, payload_range) = match RawPacket::new(data) {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    "track {track}: skipping corrupt RTP packet ({}) while expecting seq={:04x?}:\n{:#?}",
                    e.reason,
                    self.next_seq,
                    crate::hex::LimitedHex::new(&e.data, 64),
                );
                return None;
            }
        };
        let ssrc = raw.ssrc();
        let seq = raw.sequence_number();
        if matches!(self.ssrc, Some(s) if s != ssrc) {
            debug!(
                "track {track}: ssrc changed from {:08x?} to {ssrc:08x}; restarting sequence tracking",
                self.ssrc
            );
            self.next_seq = None;
        }
        let mut advance = true;
        let loss = match self.next_seq {
            None => 0,
            Some(expected) => match seq.wrapping_sub(expected) {
                0 => 0,
                gap if gap < 0x8000 => {
                    warn!(
                        "track {track}: {gap} packets lost before seq={seq:04x} (expected {expected:04x})"
                    );
                    gap
                }
                _ => {
                    warn!(
                        "track {track}: out-of-order or repeated seq={seq:04x} (expected {expected:04x})"
                    );
                    advance = false;
                    0
                }
            },
        };
        trace!(
            "track {track}: seq={seq:04x} ts={} mark={} len={}",
            raw.timestamp(),
            raw.mark(),
            payload_range.len()
        );
        self.ssrc = Some(ssrc);
        if advance {
            self.next_seq = Some(seq.wrapping_add(1));
        }
        Some(ReceivedPacket {
            track,
            raw,
            payload_range,
            loss,
        })
    }
}
