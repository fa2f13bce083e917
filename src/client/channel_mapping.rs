// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interleaved channel to track assignments.

use std::num::NonZeroU8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelType {
    Rtp,
    Rtcp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelMapping {
    pub track: usize,
    pub channel_type: ChannelType,
}

/// Mapping of the 256 possible interleaved channels to track indices and
/// RTP/RTCP.
///
/// Even channels carry RTP and their odd successors carry RTCP for the same
/// track. [RFC 2326 section 10.12](https://tools.ietf.org/html/rfc2326#section-10.12)
/// says `interleaved=n` also assigns `n+1`, and every server seen in practice
/// answers with `n-(n+1)`, so one slot per even/odd pair suffices. That caps
/// a presentation at 128 tracks, far beyond what any camera offers.
#[derive(Default)]
pub struct ChannelMappings(smallvec::SmallVec<[Option<NonZeroU8>; 16]>);

impl ChannelMappings {
    /// Returns the next unassigned even channel id, or `None` if all assigned.
    pub fn next_unassigned(&self) -> Option<u8> {
        if let Some(i) = self.0.iter().position(Option::is_none) {
            return Some((i as u8) << 1);
        }
        if self.0.len() < 128 {
            return Some((self.0.len() as u8) << 1);
        }
        None
    }

    /// Assigns an even channel id (to RTP) and its odd successor (to RTCP).
    pub fn assign(&mut self, channel_id: u8, track: usize) -> Result<(), String> {
        if (channel_id & 1) != 0 {
            return Err(format!("Can't assign odd channel id {channel_id}"));
        }
        let encoded = u8::try_from(track + 1)
            .ok()
            .and_then(NonZeroU8::new)
            .ok_or_else(|| format!("Can't assign channel to track {track}; limit is 254"))?;
        let i = usize::from(channel_id >> 1);
        if i >= self.0.len() {
            self.0.resize(i + 1, None);
        }
        match &mut self.0[i] {
            Some(c) => Err(format!(
                "Channel id {} is already assigned to track {}; won't reassign to track {}",
                channel_id,
                c.get() - 1,
                track
            )),
            slot @ None => {
                *slot = Some(encoded);
                Ok(())
            }
        }
    }

    /// Looks up a channel id's mapping.
    pub fn lookup(&self, channel_id: u8) -> Option<ChannelMapping> {
        let slot = self.0.get(usize::from(channel_id >> 1))?;
        slot.map(|c| ChannelMapping {
            track: usize::from(c.get() - 1),
            channel_type: if (channel_id & 1) == 0 {
                ChannelType::Rtp
            } else {
                ChannelType::Rtcp
            },
        })
    }
}

impl std::fmt::Debug for ChannelMappings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.iter().enumerate().filter_map(|(i, v)| {
                v.map(|v| (format!("{}-{}", i << 1, (i << 1) + 1), v.get() - 1))
            }))
            .finish()
    }
}
