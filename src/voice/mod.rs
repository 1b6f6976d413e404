//! Voice processing module
//!
//! Handles microphone capture, frame encoding, and gapless playback of
//! upstream audio.

mod capture;
mod encoder;
pub mod pcm;
mod playback;
mod scheduler;

pub use capture::{AudioCapture, SAMPLE_RATE};
pub use encoder::{DEFAULT_FRAME_SAMPLES, EncoderStats, FrameEncoder};
pub use playback::{AudioPlayback, DEFAULT_OUTPUT_SAMPLE_RATE};
pub use scheduler::{
    AudioOutput, PcmBuffer, PlaybackCursor, PlaybackQueue, PlaybackScheduler, PlaybackStats,
    ScheduledSpan,
};
