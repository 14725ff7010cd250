// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::num::NonZeroU32;

use crate::Timestamp;

/// Extends 32-bit (wrapping) RTP timestamps of one stream into [Timestamp]s
/// measured from the stream's anchor.
///
/// The anchor is the `rtptime` from `RTP-Info` when the server sends one, else
/// the first timestamp seen. Backward jumps are allowed: servers send slightly
/// older timestamps in RTCP, and B-frames or seeks produce them in RTP.
#[derive(Debug)]
pub(crate) struct Timeline {
    timestamp: i64,
    clock_rate: NonZeroU32,
    start: Option<u32>,
}

impl Timeline {
    pub(crate) fn new(start: Option<u32>, clock_rate: u32) -> Result<Self, String> {
        let clock_rate = NonZeroU32::new(clock_rate)
            .ok_or_else(|| "clock_rate=0 rejected to prevent division by zero".to_string())?;
        Ok(Timeline {
            timestamp: i64::from(start.unwrap_or(0)),
            clock_rate,
            start,
        })
    }

    /// A timeline anchored at the first timestamp it sees.
    pub(crate) fn unanchored(clock_rate: NonZeroU32) -> Self {
        Timeline {
            timestamp: 0,
            clock_rate,
            start: None,
        }
    }

    /// Restarts the timeline at `rtptime`, or at the next timestamp seen.
    pub(crate) fn anchor(&mut self, rtptime: Option<u32>) {
        self.start = rtptime;
        self.timestamp = i64::from(rtptime.unwrap_or(0));
    }

    #[inline]
    pub(crate) fn start(&self) -> Option<u32> {
        self.start
    }

    #[inline]
    pub(crate) fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }

    /// Advances to the given RTP timestamp, which becomes the reference for
    /// wraparound detection of the next one.
    pub(crate) fn advance_to(&mut self, rtp_timestamp: u32) -> Result<Timestamp, String> {
        let ts = self.place(rtp_timestamp)?;
        self.timestamp = ts.timestamp();
        Ok(ts)
    }

    /// Places `rtp_timestamp` on the timeline without advancing it, as for
    /// the RTP time of an RTCP sender report. Sets the anchor if unset.
    pub(crate) fn place(&mut self, rtp_timestamp: u32) -> Result<Timestamp, String> {
        let start = *self.start.get_or_insert_with(|| {
            self.timestamp = i64::from(rtp_timestamp);
            rtp_timestamp
        });
        let delta = (rtp_timestamp as i32).wrapping_sub(self.timestamp as i32);
        let timestamp = self.timestamp.checked_add(i64::from(delta)).ok_or_else(|| {
            format!(
                "timestamp {} + delta {} won't fit in i64!",
                self.timestamp, delta
            )
        })?;
        Timestamp::new(timestamp, self.clock_rate, start).ok_or_else(|| {
            format!(
                "timestamp {} + delta {} - start {} underflows i64!",
                self.timestamp, delta, start
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Timeline;

    #[test]
    fn timeline() {
        Timeline::new(Some(0), 0).unwrap_err();

        let mut t = Timeline::new(Some(42), 90_000).unwrap();
        assert_eq!(t.advance_to(83).unwrap().elapsed(), 83 - 42);
        assert_eq!(t.advance_to(453).unwrap().elapsed(), 453 - 42);

        // Backward jumps are fine, and RTCP placement doesn't move the reference.
        assert_eq!(t.advance_to(400).unwrap().elapsed(), 400 - 42);
        assert_eq!(t.place(41).unwrap().elapsed(), -1);
        assert_eq!(t.advance_to(500).unwrap().elapsed(), 500 - 42);

        // Wraparound.
        let mut t = Timeline::new(Some(u32::MAX), 90_000).unwrap();
        assert_eq!(t.advance_to(5).unwrap().elapsed(), 5 + 1);
        assert_eq!(t.advance_to(u32::MAX - 1).unwrap().elapsed(), -1);

        // No initial rtptime.
        let mut t = Timeline::new(None, 90_000).unwrap();
        assert_eq!(t.advance_to(218250000).unwrap().elapsed(), 0);
        assert_eq!(t.start(), Some(218250000));
    }

    #[test]
    fn reanchor() {
        let mut t = Timeline::new(None, 8_000).unwrap();
        t.advance_to(1000).unwrap();
        t.anchor(Some(9000));
        let ts = t.advance_to(17_000).unwrap();
        assert_eq!(ts.elapsed_secs(), 1.0);
        t.anchor(None);
        assert_eq!(t.advance_to(3).unwrap().elapsed(), 0);
    }
}
