// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Converts RTP clock ticks into presentation times and durations.

use std::num::NonZeroU32;
use std::time::Duration;

use log::{debug, warn};

/// Presentation time and duration of one emitted access unit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stamp {
    /// Time since session start: the track's origin plus the time elapsed
    /// since its first emitted unit.
    pub pts: Duration,

    /// Time since the previous emitted unit (video) or the unit's own
    /// sample duration (audio).
    pub duration: Duration,
}

/// Converts a count of clock ticks to a [`Duration`], rounding down to the nanosecond.
pub(crate) fn ticks_to_duration(ticks: u64, clock_rate: NonZeroU32) -> Duration {
    let nanos = u128::from(ticks) * 1_000_000_000 / u128::from(clock_rate.get());
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Per-track video timeline driven by 32-bit wrapping RTP timestamps.
///
/// Each call to [`VideoTimeline::advance`] reports the gap since the
/// previous call as the duration. A backward step close to `u32::MAX` is a
/// wraparound and is absorbed; any other backward step is a source reset
/// and yields a zero duration instead of a negative one. Either way the
/// presentation time never decreases.
#[doc(hidden)]
#[derive(Debug)]
pub struct VideoTimeline {
    clock_rate: NonZeroU32,

    /// RTP timestamp of the most recently emitted unit.
    previous: Option<u32>,

    /// Presentation time of the first emitted unit.
    origin: Duration,

    /// Ticks elapsed since the first emitted unit.
    elapsed: u64,
}

impl VideoTimeline {
    pub fn new(clock_rate: u32) -> Result<Self, String> {
        let clock_rate = NonZeroU32::new(clock_rate)
            .ok_or_else(|| "clock_rate=0 rejected to prevent division by zero".to_string())?;
        Ok(Self {
            clock_rate,
            previous: None,
            origin: Duration::ZERO,
            elapsed: 0,
        })
    }

    /// Sets the presentation time of the first unit. No effect once a unit
    /// has been placed.
    pub fn set_origin(&mut self, origin: Duration) {
        if self.previous.is_none() {
            self.origin = origin;
        }
    }

    /// Width of the window below `u32::MAX` in which a backward step is
    /// treated as wraparound: 100 ms of ticks.
    fn wrap_window(&self) -> u32 {
        self.clock_rate.get() / 10
    }

    /// Places a unit with the given RTP timestamp on the timeline.
    pub fn advance(&mut self, timestamp: u32) -> Stamp {
        let Some(previous) = self.previous else {
            self.previous = Some(timestamp);
            return Stamp {
                pts: self.origin,
                duration: Duration::ZERO,
            };
        };
        let delta = if timestamp >= previous {
            timestamp - previous
        } else if u32::MAX - previous < self.wrap_window() {
            debug!(
                "RTP timestamp wrapped from {} to {}; continuing",
                previous, timestamp
            );
            timestamp.wrapping_sub(previous)
        } else {
            warn!(
                "RTP timestamp jumped backward from {} to {}; resetting reference",
                previous, timestamp
            );
            0
        };
        self.previous = Some(timestamp);
        self.elapsed += u64::from(delta);
        Stamp {
            pts: self.origin + ticks_to_duration(self.elapsed, self.clock_rate),
            duration: ticks_to_duration(u64::from(delta), self.clock_rate),
        }
    }

    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }
}

/// Per-track audio timeline, accumulating each frame's fixed duration.
///
/// Audio packets may carry several frames under one RTP timestamp (AAC), so
/// the frames' sample counts rather than timestamp deltas drive the clock.
#[doc(hidden)]
#[derive(Debug, Default)]
pub struct AudioTimeline {
    /// Presentation time of the next frame.
    elapsed: Duration,
    started: bool,
}

impl AudioTimeline {
    /// Sets the presentation time of the first frame. No effect once a
    /// frame has been placed.
    pub fn set_origin(&mut self, origin: Duration) {
        if !self.started {
            self.elapsed = origin;
        }
    }

    /// Returns the stamp for a frame of `duration` and advances past it.
    pub fn next(&mut self, duration: Duration) -> Stamp {
        let pts = self.elapsed;
        self.started = true;
        self.elapsed += duration;
        Stamp { pts, duration }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_unit_has_no_duration() {
        let mut t = VideoTimeline::new(90_000).unwrap();
        assert_eq!(t.advance(123_456), Stamp::default());
    }

    #[test]
    fn linear_deltas() {
        let mut t = VideoTimeline::new(90_000).unwrap();
        t.advance(1_000);
        for i in 1..=10u32 {
            let s = t.advance(1_000 + i * 3_000);
            assert_eq!(s.duration, Duration::from_millis(3_000 / 90));
            assert_eq!(s.pts, Duration::from_millis(u64::from(i) * 3_000 / 90));
        }
    }

    #[test]
    fn uneven_delta_rounds_down() {
        let mut t = VideoTimeline::new(90_000).unwrap();
        t.advance(0);
        let s = t.advance(1);
        assert_eq!(s.duration, Duration::from_nanos(11_111));
    }

    #[test]
    fn wraparound_is_absorbed() {
        let mut t = VideoTimeline::new(90_000).unwrap();
        t.advance(0xFFFF_FF00);
        let before = t.advance(0xFFFF_FFF0);
        let s = t.advance(100);
        assert_eq!(s.duration, ticks_to_duration(116, t.clock_rate()));
        assert!(s.duration < Duration::from_millis(2));
        assert!(s.pts > before.pts);

        // And the timeline carries on linearly afterward.
        let s2 = t.advance(100 + 3_000);
        assert_eq!(s2.duration, Duration::from_millis(3_000 / 90));
    }

    #[test]
    fn backward_jump_resets_without_negative_duration() {
        let mut t = VideoTimeline::new(90_000).unwrap();
        t.advance(500_000);
        let a = t.advance(503_000);
        let b = t.advance(10_000);
        assert_eq!(b.duration, Duration::ZERO);
        assert_eq!(b.pts, a.pts);
        let c = t.advance(13_000);
        assert_eq!(c.duration, Duration::from_millis(3_000 / 90));
        assert!(c.pts > b.pts);
    }

    #[test]
    fn origin_offsets_pts() {
        let mut t = VideoTimeline::new(90_000).unwrap();
        t.set_origin(Duration::from_millis(250));
        assert_eq!(t.advance(9_000).pts, Duration::from_millis(250));
        t.set_origin(Duration::from_secs(5));
        let s = t.advance(18_000);
        assert_eq!(s.pts, Duration::from_millis(350));
        assert_eq!(s.duration, Duration::from_millis(100));

        let mut a = AudioTimeline::default();
        a.set_origin(Duration::from_millis(40));
        assert_eq!(a.next(Duration::from_millis(20)).pts, Duration::from_millis(40));
        a.set_origin(Duration::ZERO);
        assert_eq!(a.next(Duration::from_millis(20)).pts, Duration::from_millis(60));
    }

    #[test]
    fn zero_clock_rate() {
        VideoTimeline::new(0).unwrap_err();
    }

    #[test]
    fn audio_accumulates() {
        let mut t = AudioTimeline::default();
        let frame = Duration::from_millis(128);
        assert_eq!(
            t.next(frame),
            Stamp {
                pts: Duration::ZERO,
                duration: frame
            }
        );
        assert_eq!(t.next(frame).pts, frame);
        assert_eq!(t.next(frame).pts, frame * 2);
    }
}
