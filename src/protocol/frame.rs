//! Fixed-size PCM audio frame

use std::time::Duration;

use bytes::Bytes;

/// One fixed-size block of PCM16LE mono audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Monotonic per session, starting at 0
    pub seq: u64,
    /// Media time since capture start
    pub timestamp_ms: u64,
    pub sample_rate: u32,
    pub pcm: Bytes,
}

impl AudioFrame {
    /// Number of 16-bit samples in the frame
    #[must_use]
    pub const fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }

    /// Playback length at the frame's own sample rate
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.sample_count() as f64 / f64::from(self.sample_rate))
    }
}
