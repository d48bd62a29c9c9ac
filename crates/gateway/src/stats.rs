//! Video stream parameters and monotonic send counters.

use std::sync::atomic::{AtomicU64, Ordering};

use huddle_protocol::VideoCodec;
use serde::Serialize;

/// Stream parameters as negotiated with the encoder.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Target bitrate in kbps.
    pub bitrate: u32,
    pub codec: VideoCodec,
}

/// Monotonic counters updated by the sender thread. Readers may sample
/// at any time; individual counters are independently consistent.
#[derive(Debug, Default)]
pub struct VideoStats {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    key_frames_sent: AtomicU64,
    /// Exponential moving average of the encoded frame size, alpha 1/16.
    avg_frame_size: AtomicU64,
}

impl VideoStats {
    pub fn record_frame(&self, size: usize, keyframe: bool) {
        let size = size as u64;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(size, Ordering::Relaxed);
        if keyframe {
            self.key_frames_sent.fetch_add(1, Ordering::Relaxed);
        }

        let prev = self.avg_frame_size.load(Ordering::Relaxed);
        let next = if prev == 0 {
            size
        } else {
            let delta = (size as i64 - prev as i64).div_euclid(16);
            (prev as i64 + delta).max(0) as u64
        };
        self.avg_frame_size.store(next, Ordering::Relaxed);
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn key_frames_sent(&self) -> u64 {
        self.key_frames_sent.load(Ordering::Relaxed)
    }

    pub fn avg_frame_size(&self) -> u64 {
        self.avg_frame_size.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic() {
        let stats = VideoStats::default();
        stats.record_frame(1000, true);
        stats.record_frame(500, false);
        stats.record_frame(1500, false);
        assert_eq!(stats.frames_sent(), 3);
        assert_eq!(stats.bytes_sent(), 3000);
        assert_eq!(stats.key_frames_sent(), 1);
    }

    #[test]
    fn average_tracks_frame_size() {
        let stats = VideoStats::default();
        stats.record_frame(1000, false);
        assert_eq!(stats.avg_frame_size(), 1000);
        for _ in 0..200 {
            stats.record_frame(2000, false);
        }
        // EMA converges toward the steady-state size.
        let avg = stats.avg_frame_size();
        assert!((1900..=2000).contains(&avg), "avg={avg}");
    }

    #[test]
    fn average_converges_downward_too() {
        let stats = VideoStats::default();
        stats.record_frame(10_000, true);
        for _ in 0..300 {
            stats.record_frame(100, false);
        }
        let avg = stats.avg_frame_size();
        assert!(avg <= 200, "avg={avg}");
    }
}
