//! WebSocket client for a realtime voice model endpoint
//!
//! Wire format (JSON text frames):
//!
//! ```text
//! -> {"type":"session.start", "session_id", "model", "voice", "input_sample_rate", "output_sample_rate"}
//! <- {"type":"session.started"} | {"type":"error","message"}
//! -> {"type":"audio","data":"<base64 pcm16le>"}
//! <- {"type":"audio","data":"<base64 pcm16le>"} | {"type":"text","text"}
//! <- {"type":"session.ended"}
//! -> {"type":"session.end"}
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::stream::{self, SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{ResponseChunk, ResponseStream, SessionParams, UpstreamHandle, UpstreamService, UpstreamSession};
use crate::relay::Backlog;
use crate::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close` waits for queued audio to flush
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Connection settings for [`RealtimeUpstream`]
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// `ws://` or `wss://` endpoint
    pub url: Url,
    /// Bearer token sent on connect
    pub api_key: Option<SecretString>,
    /// Model identifier forwarded in `session.start`
    pub model: Option<String>,
    /// Voice identifier forwarded in `session.start`
    pub voice: Option<String>,
    /// Outbound frames held per session while the link is slow
    pub backlog: usize,
    /// Bound on connect plus `session.started`
    pub handshake_timeout: Duration,
}

/// Events received from the service
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServiceEvent {
    #[serde(rename = "session.started")]
    SessionStarted,
    #[serde(rename = "session.ended")]
    SessionEnded,
    #[serde(rename = "audio")]
    Audio { data: String },
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

/// Upstream service reached over WebSocket
#[derive(Debug)]
pub struct RealtimeUpstream {
    config: RealtimeConfig,
}

impl RealtimeUpstream {
    /// Create a service client
    #[must_use]
    pub const fn new(config: RealtimeConfig) -> Self {
        Self { config }
    }

    async fn handshake(&self, params: &SessionParams) -> Result<Socket> {
        let unavailable = |e: &dyn std::fmt::Display| Error::UpstreamUnavailable(e.to_string());

        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| unavailable(&e))?;

        if let Some(key) = &self.config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret()))
                .map_err(|e| Error::Config(format!("invalid upstream api key: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (mut socket, _) = connect_async(request).await.map_err(|e| unavailable(&e))?;

        let start = serde_json::json!({
            "type": "session.start",
            "session_id": params.session_id,
            "model": self.config.model,
            "voice": self.config.voice,
            "input_sample_rate": params.input_sample_rate,
            "output_sample_rate": params.output_sample_rate,
        });
        socket
            .send(Message::text(start.to_string()))
            .await
            .map_err(|e| unavailable(&e))?;

        while let Some(msg) = socket.next().await {
            match msg.map_err(|e| unavailable(&e))? {
                Message::Text(text) => match serde_json::from_str(text.as_str()) {
                    Ok(ServiceEvent::SessionStarted) => return Ok(socket),
                    Ok(ServiceEvent::Error { message }) => {
                        return Err(Error::UpstreamUnavailable(message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "ignoring malformed handshake message");
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        Err(Error::UpstreamUnavailable(
            "connection closed during handshake".to_string(),
        ))
    }
}

#[async_trait]
impl UpstreamService for RealtimeUpstream {
    fn name(&self) -> &'static str {
        "realtime"
    }

    async fn create_session(&self, params: &SessionParams) -> Result<UpstreamSession> {
        let socket = tokio::time::timeout(self.config.handshake_timeout, self.handshake(params))
            .await
            .map_err(|_| Error::UpstreamUnavailable("handshake timed out".to_string()))??;

        tracing::debug!(
            session_id = %params.session_id,
            url = %self.config.url,
            "upstream session started"
        );

        let (sink, stream) = socket.split();
        let backlog = Arc::new(Backlog::new(self.config.backlog));
        let writer = tokio::spawn(write_audio(
            sink,
            Arc::clone(&backlog),
            params.session_id.clone(),
        ));

        Ok(UpstreamSession {
            handle: Arc::new(RealtimeHandle {
                session_id: params.session_id.clone(),
                backlog,
                writer: Mutex::new(Some(writer)),
            }),
            responses: responses(stream, params.session_id.clone()),
        })
    }
}

/// Drain the backlog onto the socket until the handle closes it
async fn write_audio(
    mut sink: SplitSink<Socket, Message>,
    backlog: Arc<Backlog<Bytes>>,
    session_id: String,
) {
    while let Some(pcm) = backlog.pop().await {
        let msg = serde_json::json!({ "type": "audio", "data": STANDARD.encode(&pcm) });
        if let Err(e) = sink.send(Message::text(msg.to_string())).await {
            tracing::warn!(session_id = %session_id, error = %e, "upstream write failed");
            backlog.close();
            return;
        }
    }

    let end = serde_json::json!({ "type": "session.end" });
    let _ = sink.send(Message::text(end.to_string())).await;
    let _ = sink.close().await;
}

fn responses(stream: SplitStream<Socket>, session_id: String) -> ResponseStream {
    stream::unfold(Some(stream), move |state| {
        let session_id = session_id.clone();
        async move {
            let mut stream = state?;
            loop {
                let msg = match stream.next().await {
                    None => return None,
                    Some(Err(e)) => return Some((Err(Error::from(e)), None)),
                    Some(Ok(msg)) => msg,
                };

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(pcm) => return Some((Ok(ResponseChunk::Audio(pcm)), Some(stream))),
                    Message::Close(_) => return None,
                    _ => continue,
                };

                match serde_json::from_str(text.as_str()) {
                    Ok(ServiceEvent::Audio { data }) => match STANDARD.decode(data) {
                        Ok(pcm) => {
                            return Some((Ok(ResponseChunk::Audio(Bytes::from(pcm))), Some(stream)));
                        }
                        Err(e) => {
                            tracing::warn!(session_id = %session_id, error = %e, "skipping undecodable upstream audio");
                        }
                    },
                    Ok(ServiceEvent::Text { text }) => {
                        return Some((Ok(ResponseChunk::Text(text)), Some(stream)));
                    }
                    Ok(ServiceEvent::SessionEnded) => return None,
                    Ok(ServiceEvent::Error { message }) => {
                        return Some((Err(Error::Transport(message)), None));
                    }
                    Ok(ServiceEvent::SessionStarted | ServiceEvent::Other) => {}
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "skipping malformed upstream message");
                    }
                }
            }
        }
    })
    .boxed()
}

struct RealtimeHandle {
    session_id: String,
    backlog: Arc<Backlog<Bytes>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl UpstreamHandle for RealtimeHandle {
    fn send_audio(&self, pcm: Bytes) {
        if self.backlog.push(pcm) {
            tracing::debug!(
                session_id = %self.session_id,
                evicted = self.backlog.evicted(),
                "upstream backlog full, dropped oldest frame"
            );
        }
    }

    async fn close(&self) {
        self.backlog.close();
        let Some(writer) = self.writer.lock().await.take() else {
            return;
        };

        let abort = writer.abort_handle();
        if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
            tracing::warn!(session_id = %self.session_id, "upstream writer did not finish, aborting");
            abort.abort();
        }
    }
}
