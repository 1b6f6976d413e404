//! Gapless playback scheduling
//!
//! Response buffers are queued in arrival order and rendered back-to-back:
//! each buffer begins on the output sample right after the previous one ends.
//! Chaining happens inside the render callback, so network jitter can delay
//! a buffer but never overlap two of them.
//!
//! When the queue runs dry the cursor pauses. A late buffer starts from its
//! first sample as soon as it arrives; nothing is skipped to catch up and no
//! filler buffers are scheduled. The device still receives zeros while
//! paused, since an open output stream has to be fed.
//!
//! Buffers are played at the declared output rate. Samples are never
//! resampled, even when the capture side runs at a different rate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use super::pcm::decode_pcm16;
use crate::Result;

/// Number of scheduled spans the cursor remembers
const SPAN_HISTORY: usize = 256;

/// A decoded response buffer waiting for playback
#[derive(Debug, Clone)]
pub struct PcmBuffer {
    /// Arrival order, assigned by the scheduler
    pub seq: u64,
    pub samples: Arc<[f32]>,
}

/// Where a buffer landed on the output timeline, in output frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSpan {
    pub seq: u64,
    pub start: u64,
    pub end: u64,
}

/// Counters observable from outside the render thread
#[derive(Debug, Default)]
pub struct PlaybackStats {
    queued: AtomicUsize,
    played: AtomicU64,
    underruns: AtomicU64,
}

impl PlaybackStats {
    /// Buffers waiting in the queue
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Buffers that started playing
    #[must_use]
    pub fn played(&self) -> u64 {
        self.played.load(Ordering::Relaxed)
    }

    /// Times the queue ran dry after a buffer finished
    #[must_use]
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct QueueShared {
    closed: AtomicBool,
    next_seq: AtomicU64,
    stats: PlaybackStats,
}

/// Producer side of the playback queue
///
/// Cheap to clone and `Send`, so the network task can enqueue while the
/// scheduler (and its device stream) stays with its owner.
#[derive(Debug, Clone)]
pub struct PlaybackQueue {
    tx: Sender<PcmBuffer>,
    rx: Receiver<PcmBuffer>,
    shared: Arc<QueueShared>,
}

impl PlaybackQueue {
    fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            shared: Arc::new(QueueShared {
                closed: AtomicBool::new(false),
                next_seq: AtomicU64::new(0),
                stats: PlaybackStats::default(),
            }),
        }
    }

    /// Queue float samples; returns the buffer's sequence number, or `None`
    /// once playback has been stopped
    pub fn enqueue(&self, samples: Vec<f32>) -> Option<u64> {
        if self.shared.closed.load(Ordering::Acquire) || samples.is_empty() {
            return None;
        }

        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        self.shared.stats.queued.fetch_add(1, Ordering::Relaxed);
        let buffer = PcmBuffer {
            seq,
            samples: samples.into(),
        };

        if self.tx.send(buffer).is_err() {
            self.shared.stats.queued.fetch_sub(1, Ordering::Relaxed);
            return None;
        }
        Some(seq)
    }

    /// Queue little-endian PCM16 bytes
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the payload has an odd byte count
    pub fn enqueue_pcm16(&self, bytes: &[u8]) -> Result<Option<u64>> {
        Ok(self.enqueue(decode_pcm16(bytes)?))
    }

    /// Shared playback counters
    #[must_use]
    pub fn stats(&self) -> &PlaybackStats {
        &self.shared.stats
    }

    /// Whether playback has been stopped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn close_and_flush(&self) -> usize {
        self.shared.closed.store(true, Ordering::Release);
        let mut flushed = 0;
        while self.rx.try_recv().is_ok() {
            flushed += 1;
        }
        self.shared.stats.queued.store(0, Ordering::Relaxed);
        flushed
    }

    fn cursor(&self) -> PlaybackCursor {
        PlaybackCursor {
            rx: self.rx.clone(),
            shared: Arc::clone(&self.shared),
            current: None,
            clock: 0,
            starved: false,
            spans: VecDeque::with_capacity(SPAN_HISTORY),
        }
    }
}

/// Render side of the playback queue, owned by the output callback
pub struct PlaybackCursor {
    rx: Receiver<PcmBuffer>,
    shared: Arc<QueueShared>,
    current: Option<(PcmBuffer, usize)>,
    clock: u64,
    starved: bool,
    spans: VecDeque<ScheduledSpan>,
}

impl PlaybackCursor {
    /// Fill an interleaved device buffer with `channels` channels
    ///
    /// Mono samples are duplicated across channels. Returns the number of
    /// frames that carried real audio.
    pub fn render(&mut self, out: &mut [f32], channels: usize) -> usize {
        let channels = channels.max(1);
        let mut audible = 0;

        for frame in out.chunks_mut(channels) {
            let sample = self.next_sample();
            if sample.is_some() {
                audible += 1;
            }
            frame.fill(sample.unwrap_or(0.0));
            self.clock += 1;
        }

        audible
    }

    fn next_sample(&mut self) -> Option<f32> {
        loop {
            if let Some((buffer, pos)) = &mut self.current {
                if let Some(&s) = buffer.samples.get(*pos) {
                    *pos += 1;
                    return Some(s);
                }
                self.current = None;
            }

            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }

            match self.rx.try_recv() {
                Ok(buffer) => self.begin(buffer),
                Err(_) => {
                    if !self.starved && self.shared.stats.played() > 0 {
                        self.shared.stats.underruns.fetch_add(1, Ordering::Relaxed);
                    }
                    self.starved = true;
                    return None;
                }
            }
        }
    }

    fn begin(&mut self, buffer: PcmBuffer) {
        let span = ScheduledSpan {
            seq: buffer.seq,
            start: self.clock,
            end: self.clock + buffer.samples.len() as u64,
        };
        if self.spans.len() == SPAN_HISTORY {
            self.spans.pop_front();
        }
        self.spans.push_back(span);

        let stats = &self.shared.stats;
        stats.played.fetch_add(1, Ordering::Relaxed);
        // Saturating: stop() may have zeroed the counter concurrently
        let _ = stats
            .queued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |q| q.checked_sub(1));

        self.starved = false;
        self.current = Some((buffer, 0));
    }

    /// Output frames rendered so far
    #[must_use]
    pub const fn clock(&self) -> u64 {
        self.clock
    }

    /// Whether the cursor is waiting for the next buffer
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.current.is_none()
    }

    /// Recently scheduled buffers, oldest first
    pub fn spans(&self) -> impl Iterator<Item = &ScheduledSpan> {
        self.spans.iter()
    }
}

/// An audio output the scheduler can drive
pub trait AudioOutput {
    /// Live output stream; dropping it releases the device
    type Stream;

    /// Open the device and start pulling samples from `cursor`
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened
    fn open(&mut self, cursor: PlaybackCursor) -> Result<Self::Stream>;

    /// Declared output sample rate
    fn sample_rate(&self) -> u32;
}

/// Caller-owned playback pipeline: queue plus output device
pub struct PlaybackScheduler<O: AudioOutput> {
    output: O,
    stream: Option<O::Stream>,
    queue: PlaybackQueue,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    /// Create a scheduler for an output; nothing is opened until `start`
    #[must_use]
    pub fn new(output: O) -> Self {
        Self {
            output,
            stream: None,
            queue: PlaybackQueue::new(),
        }
    }

    /// Open the output device and begin rendering queued buffers
    ///
    /// # Errors
    ///
    /// Returns error if the output device cannot be opened
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        if self.queue.is_closed() {
            self.queue = PlaybackQueue::new();
        }

        let stream = self.output.open(self.queue.cursor())?;
        self.stream = Some(stream);
        tracing::debug!(sample_rate = self.output.sample_rate(), "playback started");
        Ok(())
    }

    /// Producer handle for the network side
    #[must_use]
    pub fn queue(&self) -> PlaybackQueue {
        self.queue.clone()
    }

    /// Queue float samples for gapless playback
    pub fn enqueue(&self, samples: Vec<f32>) -> Option<u64> {
        self.queue.enqueue(samples)
    }

    /// Playback length of `samples` at the declared output rate
    #[must_use]
    pub fn duration_of(&self, samples: usize) -> Duration {
        let rate = self.output.sample_rate();
        if rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(samples as u64 * 1_000_000_000 / u64::from(rate))
    }

    /// Shared playback counters
    #[must_use]
    pub fn stats(&self) -> &PlaybackStats {
        self.queue.stats()
    }

    /// Whether an output stream is open
    #[must_use]
    pub const fn is_playing(&self) -> bool {
        self.stream.is_some()
    }

    /// Flush the queue and release the output device immediately
    ///
    /// No fade-out. Enqueues through outstanding `PlaybackQueue` handles are
    /// ignored afterwards.
    pub fn stop(&mut self) {
        let flushed = self.queue.close_and_flush();
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!(flushed, "playback stopped");
        }
    }
}

impl<O: AudioOutput> Drop for PlaybackScheduler<O> {
    fn drop(&mut self) {
        self.stop();
    }
}
