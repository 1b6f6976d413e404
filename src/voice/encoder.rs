//! Fixed-size frame accumulation for captured audio
//!
//! The audio callback delivers small blocks (typically 128 samples). The
//! encoder gathers them into fixed frames, converts each to PCM16 and hands it
//! to the network side with a non-blocking send. A full or closed channel
//! drops the frame: the callback must never wait on the network.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::{self, error::TrySendError};

use super::pcm::encode_pcm16;
use crate::protocol::AudioFrame;

/// Default samples per frame
pub const DEFAULT_FRAME_SAMPLES: usize = 4096;

/// Counters shared between the callback thread and observers
#[derive(Debug, Default)]
pub struct EncoderStats {
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl EncoderStats {
    /// Frames handed to the network side
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Frames discarded because the outbound channel was full or closed
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Accumulates float samples into PCM16 frames
pub struct FrameEncoder {
    frame_samples: usize,
    sample_rate: u32,
    buffer: Vec<f32>,
    next_seq: u64,
    sink: mpsc::Sender<AudioFrame>,
    stats: Arc<EncoderStats>,
}

impl FrameEncoder {
    /// Create an encoder emitting frames of `frame_samples` into `sink`
    ///
    /// # Panics
    ///
    /// Panics if `frame_samples` is zero
    #[must_use]
    pub fn new(frame_samples: usize, sample_rate: u32, sink: mpsc::Sender<AudioFrame>) -> Self {
        assert!(frame_samples > 0, "frame size must be positive");
        Self {
            frame_samples,
            sample_rate,
            buffer: Vec::with_capacity(frame_samples),
            next_seq: 0,
            sink,
            stats: Arc::new(EncoderStats::default()),
        }
    }

    /// Shared counters for this encoder
    #[must_use]
    pub fn stats(&self) -> Arc<EncoderStats> {
        Arc::clone(&self.stats)
    }

    /// Samples currently waiting for the frame to fill
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one block from the audio callback
    pub fn push(&mut self, mut block: &[f32]) {
        while !block.is_empty() {
            let room = self.frame_samples - self.buffer.len();
            let take = room.min(block.len());
            self.buffer.extend_from_slice(&block[..take]);
            block = &block[take..];

            if self.buffer.len() == self.frame_samples {
                self.emit();
            }
        }
    }

    fn emit(&mut self) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let frame = AudioFrame {
            seq,
            timestamp_ms: self.media_time_ms(seq),
            sample_rate: self.sample_rate,
            pcm: encode_pcm16(&self.buffer),
        };
        self.buffer.clear();

        match self.sink.try_send(frame) {
            Ok(()) => {
                self.stats.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(seq, "outbound frame queue full, dropping frame");
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(seq, "outbound frame queue closed, dropping frame");
            }
        }
    }

    fn media_time_ms(&self, seq: u64) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        seq * self.frame_samples as u64 * 1000 / u64::from(self.sample_rate)
    }
}
