//! Monotonic media clock for RTP timestamp derivation.
//!
//! RTP video uses a 90 kHz media clock (RFC 6184). We only have a millisecond
//! wall clock, so the timestamp is elapsed milliseconds since session start
//! scaled by 90.0 and truncated. The sub-millisecond precision loss is kept
//! deliberately for compatibility with existing receivers of this stream.

use std::time::Instant;

/// Video media clock rate in Hz.
pub const CLOCK_RATE: u32 = 90_000;

/// Monotonic clock anchored at packetizer session start.
#[derive(Debug, Clone)]
pub struct MediaClock {
    start: Instant,
}

impl MediaClock {
    /// Anchor the clock at the current instant.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the anchor. Never decreases.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Current 90 kHz RTP timestamp, truncated to 32 bits.
    pub fn rtp_timestamp(&self) -> u32 {
        ticks_90khz(self.elapsed_ms())
    }
}

/// Elapsed milliseconds scaled to 90 kHz ticks.
///
/// Goes through u64 before the 32-bit truncation: a direct f64-to-u32 cast
/// saturates at u32::MAX, which would freeze the timestamp once a stream
/// runs past the 32-bit tick range (about 13 hours). RTP timestamps wrap
/// mod 2^32 (RFC 3550).
fn ticks_90khz(ms: u64) -> u32 {
    (ms as f64 * 90.0) as u64 as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_non_decreasing() {
        let clock = MediaClock::start();
        let mut prev = clock.rtp_timestamp();
        for _ in 0..100 {
            let ts = clock.rtp_timestamp();
            assert!(ts >= prev);
            prev = ts;
        }
    }

    #[test]
    fn test_timestamp_wraps_past_32_bit_tick_range() {
        // 47_721_900 ms of stream time is just past 2^32 ticks at 90/ms
        let ms = 47_721_900u64;
        assert_eq!(ms * 90 - (1u64 << 32), 3_704);
        assert_eq!(ticks_90khz(ms), 3_704);
        // The clock keeps advancing after the wrap rather than pinning
        assert_eq!(ticks_90khz(ms + 1000), 93_704);
        assert_ne!(ticks_90khz(ms), u32::MAX);
    }

    #[test]
    fn test_timestamp_tracks_elapsed_time() {
        let clock = MediaClock::start();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let ts = clock.rtp_timestamp();
        // 20ms at 90 ticks/ms, allow generous scheduling slack upward
        assert!(ts >= 20 * 90, "timestamp {} below 20ms worth of ticks", ts);
    }
}
