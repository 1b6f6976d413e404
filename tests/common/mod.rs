//! Shared test utilities

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_duplex::protocol::Envelope;
use beacon_duplex::upstream::{ResponseChunk, SessionParams};
use beacon_duplex::voice::{AudioOutput, PlaybackCursor};
use beacon_duplex::{Error, Result, UpstreamHandle, UpstreamService, UpstreamSession};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Default)]
struct Shared {
    reject: Option<String>,
    handshake_delay: Option<Duration>,
    received: Mutex<Vec<Bytes>>,
    received_notify: Notify,
    responders: Mutex<Vec<Option<mpsc::UnboundedSender<Result<ResponseChunk>>>>>,
    sessions: AtomicUsize,
    closes: AtomicUsize,
}

/// Upstream double whose responses are pushed by the test
///
/// Sessions are indexed in creation order. A session's response stream stays
/// open, yielding nothing, until the test responds or ends it.
#[derive(Clone, Default)]
pub struct ScriptedUpstream {
    shared: Arc<Shared>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every handshake fails with `UpstreamUnavailable(message)`
    pub fn rejecting(message: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                reject: Some(message.to_string()),
                ..Shared::default()
            }),
        }
    }

    /// Every handshake takes `delay` to complete
    pub fn slow(delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                handshake_delay: Some(delay),
                ..Shared::default()
            }),
        }
    }

    pub fn service(&self) -> Arc<dyn UpstreamService> {
        Arc::new(self.clone())
    }

    /// Audio received so far, across all sessions, in arrival order
    pub fn received(&self) -> Vec<Bytes> {
        self.shared.received.lock().unwrap().clone()
    }

    /// Wait until at least `count` audio chunks have been received
    pub async fn wait_received(&self, count: usize) -> Vec<Bytes> {
        loop {
            let notified = self.shared.received_notify.notified();
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            notified.await;
        }
    }

    /// Sessions opened successfully
    pub fn sessions(&self) -> usize {
        self.shared.sessions.load(Ordering::SeqCst)
    }

    /// `close` calls across all handles
    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Push a response chunk to session `index`; ignored once it has ended
    pub fn respond(&self, index: usize, chunk: ResponseChunk) {
        let responders = self.shared.responders.lock().unwrap();
        if let Some(Some(tx)) = responders.get(index) {
            let _ = tx.send(Ok(chunk));
        }
    }

    /// Fail session `index` with a transport error
    pub fn fail(&self, index: usize, message: &str) {
        let mut responders = self.shared.responders.lock().unwrap();
        if let Some(slot) = responders.get_mut(index)
            && let Some(tx) = slot.take()
        {
            let _ = tx.send(Err(Error::Transport(message.to_string())));
        }
    }

    /// End session `index`'s response stream, as if the service hung up
    pub fn end(&self, index: usize) {
        let mut responders = self.shared.responders.lock().unwrap();
        if let Some(slot) = responders.get_mut(index) {
            slot.take();
        }
    }
}

#[async_trait]
impl UpstreamService for ScriptedUpstream {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn create_session(&self, _params: &SessionParams) -> Result<UpstreamSession> {
        if let Some(delay) = self.shared.handshake_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.shared.reject {
            return Err(Error::UpstreamUnavailable(message.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.responders.lock().unwrap().push(Some(tx));
        self.shared.sessions.fetch_add(1, Ordering::SeqCst);

        Ok(UpstreamSession {
            handle: Arc::new(ScriptedHandle {
                shared: Arc::clone(&self.shared),
            }),
            responses: UnboundedReceiverStream::new(rx).boxed(),
        })
    }
}

struct ScriptedHandle {
    shared: Arc<Shared>,
}

#[async_trait]
impl UpstreamHandle for ScriptedHandle {
    fn send_audio(&self, pcm: Bytes) {
        self.shared.received.lock().unwrap().push(pcm);
        self.shared.received_notify.notify_waiters();
    }

    async fn close(&self) {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Output that hands its cursor to the test instead of a sound card
#[derive(Clone, Default)]
pub struct ManualOutput {
    cursor: Arc<Mutex<Option<PlaybackCursor>>>,
    rate: u32,
}

pub struct ManualStream;

impl ManualOutput {
    pub fn new(rate: u32) -> Self {
        Self {
            cursor: Arc::default(),
            rate,
        }
    }

    /// Pull `frames` mono samples through the cursor
    pub fn render(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames];
        let mut cursor = self.cursor.lock().unwrap();
        cursor.as_mut().expect("playback not started").render(&mut out, 1);
        out
    }

    /// Scheduled spans as `(start, end)` output frames
    pub fn spans(&self) -> Vec<(u64, u64)> {
        let cursor = self.cursor.lock().unwrap();
        cursor
            .as_ref()
            .expect("playback not started")
            .spans()
            .map(|s| (s.start, s.end))
            .collect()
    }
}

impl AudioOutput for ManualOutput {
    type Stream = ManualStream;

    fn open(&mut self, cursor: PlaybackCursor) -> Result<ManualStream> {
        *self.cursor.lock().unwrap() = Some(cursor);
        Ok(ManualStream)
    }

    fn sample_rate(&self) -> u32 {
        self.rate
    }
}

/// A 4096-sample frame whose samples encode `tag`
pub fn tagged_frame(tag: u64, seq: u64) -> beacon_duplex::AudioFrame {
    #[allow(clippy::cast_precision_loss)]
    let level = (tag as f32 + 1.0) / 10.0;
    beacon_duplex::AudioFrame {
        seq,
        timestamp_ms: seq * 256,
        sample_rate: 16_000,
        pcm: beacon_duplex::voice::pcm::encode_pcm16(&vec![level; 4096]),
    }
}

/// Receive the next control message, panicking on anything else
pub async fn next_control(rx: &mut mpsc::Receiver<Envelope>) -> beacon_duplex::ControlMessage {
    match rx.recv().await {
        Some(Envelope::Control(msg)) => msg,
        other => panic!("expected control message, got {other:?}"),
    }
}
