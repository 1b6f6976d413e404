//! Upstream AI streaming service
//!
//! The relay talks to the voice model through [`UpstreamService`]. Each
//! session yields a fire-and-forget [`UpstreamHandle`] for outbound audio and
//! a response stream that is moved into the session task exactly once.

mod loopback;
mod realtime;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use secrecy::SecretString;

pub use loopback::LoopbackUpstream;
pub use realtime::{RealtimeConfig, RealtimeUpstream};

use crate::Result;

/// One chunk of upstream output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseChunk {
    /// PCM16LE mono audio at the output rate
    Audio(Bytes),
    /// Transcript or assistant text
    Text(String),
}

/// Ordered, non-restartable sequence of response chunks
///
/// Ends when the upstream terminates the session. An `Err` item is a
/// transport failure.
pub type ResponseStream = BoxStream<'static, Result<ResponseChunk>>;

/// Parameters for opening an upstream session
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Relay session ID
    pub session_id: String,
    /// Rate of audio sent upstream
    pub input_sample_rate: u32,
    /// Rate of audio expected back
    pub output_sample_rate: u32,
}

/// A freshly opened upstream session
pub struct UpstreamSession {
    /// Send side
    pub handle: Arc<dyn UpstreamHandle>,
    /// Receive side
    pub responses: ResponseStream,
}

impl std::fmt::Debug for UpstreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSession").finish_non_exhaustive()
    }
}

/// Factory for upstream sessions
#[async_trait]
pub trait UpstreamService: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Open a session and complete the handshake
    ///
    /// # Errors
    ///
    /// Returns `Error::UpstreamUnavailable` if the service rejects the
    /// handshake or cannot be reached
    async fn create_session(&self, params: &SessionParams) -> Result<UpstreamSession>;
}

/// Send side of an upstream session
#[async_trait]
pub trait UpstreamHandle: Send + Sync {
    /// Queue PCM16LE audio for the service; never blocks
    fn send_audio(&self, pcm: Bytes);

    /// Release the session; safe to call more than once
    async fn close(&self);
}

/// Build the configured upstream service
///
/// Without a URL the relay runs against the local loopback.
#[must_use]
pub fn from_config(config: &crate::Config) -> Arc<dyn UpstreamService> {
    let upstream = &config.upstream;
    match upstream.url.as_ref() {
        Some(url) => Arc::new(RealtimeUpstream::new(RealtimeConfig {
            url: url.clone(),
            api_key: upstream.api_key.clone().map(SecretString::from),
            model: upstream.model.clone(),
            voice: upstream.voice.clone(),
            backlog: config.relay.upstream_backlog,
            handshake_timeout: config.relay.handshake_timeout(),
        })),
        None => Arc::new(LoopbackUpstream::new(config.relay.upstream_backlog)),
    }
}
