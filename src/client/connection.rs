//! Client side of the session protocol
//!
//! One task per connection, driven by a single `select!` loop: each inbound
//! envelope is handled to completion before the next, captured frames are
//! forwarded as they arrive, and the stop signal ends the session.

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::protocol::{AudioFrame, ControlEvent, ControlMessage, Envelope};
use crate::voice::PlaybackQueue;
use crate::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle events surfaced to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Relay acknowledged the session
    SessionStarted {
        session_id: String,
        output_sample_rate: Option<u32>,
    },
    /// Text from the upstream service
    Transcript(String),
    /// Session ended by idle timeout or upstream termination
    SessionExpired { reason: String },
    /// Session failed or could not be started
    SessionError { code: String, message: String },
    /// Session ended normally
    SessionEnded { reason: Option<String> },
    /// Socket closed
    Disconnected,
}

impl ClientEvent {
    /// Error a caller waiting on the session should see for this event
    ///
    /// `None` for events that leave the session usable or end it normally.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        match self {
            Self::SessionExpired { reason } => Some(Error::SessionExpired(reason.clone())),
            Self::SessionError { code, message } => Some(match code.as_str() {
                "upstream_unavailable" => Error::UpstreamUnavailable(message.clone()),
                "session_active" => Error::SessionActive,
                "protocol_error" => Error::Protocol(message.clone()),
                _ => Error::Transport(format!("{code}: {message}")),
            }),
            Self::Disconnected => Some(Error::Transport("relay closed the connection".to_string())),
            Self::SessionStarted { .. } | Self::Transcript(_) | Self::SessionEnded { .. } => None,
        }
    }
}

/// A running connection to the relay
#[derive(Debug)]
pub struct Connection {
    events: mpsc::UnboundedReceiver<ClientEvent>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Connect to `url`, request a session and start forwarding
    ///
    /// `frames` carries captured audio; response audio goes to `playback`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the socket cannot be opened
    pub async fn open(
        url: &str,
        frames: mpsc::Receiver<AudioFrame>,
        playback: PlaybackQueue,
    ) -> Result<Self> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| Error::Transport(format!("failed to connect to {url}: {e}")))?;

        tracing::info!(url, "connected to relay");

        let (events_tx, events) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run(socket, frames, playback, events_tx, stop_rx));

        Ok(Self {
            events,
            stop: Some(stop_tx),
            task,
        })
    }

    /// Next lifecycle event; `None` once the connection task has exited
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Wait until the relay acknowledges the session, returning its ID
    ///
    /// # Errors
    ///
    /// Returns the error carried by the first lifecycle event that is not a
    /// start, e.g. `Error::UpstreamUnavailable` or `Error::SessionExpired`
    pub async fn wait_for_session(&mut self) -> Result<String> {
        loop {
            let Some(event) = self.next_event().await else {
                return Err(Error::Transport("connection task exited".to_string()));
            };
            if let ClientEvent::SessionStarted { session_id, .. } = event {
                return Ok(session_id);
            }
            if let Some(e) = event.error() {
                return Err(e);
            }
            if let ClientEvent::SessionEnded { reason } = event {
                return Err(Error::Transport(format!(
                    "session ended before it started: {}",
                    reason.as_deref().unwrap_or("no reason")
                )));
            }
        }
    }

    /// Ask the connection to end the session and close
    ///
    /// Returns immediately; the task sends `session_end` on its own.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Whether the connection task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct Session {
    sink: SplitSink<Socket, Message>,
    playback: PlaybackQueue,
    events: mpsc::UnboundedSender<ClientEvent>,
    session_id: Option<String>,
}

impl Session {
    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let text = envelope.encode()?;
        self.sink.send(Message::text(text)).await?;
        Ok(())
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn handle_text(&mut self, text: &str) -> Result<()> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed message from relay");
                return Ok(());
            }
        };

        match envelope {
            Envelope::Audio(payload) if self.session_id.is_none() => {
                tracing::debug!(seq = payload.seq, "dropping response audio outside a session");
            }
            Envelope::Audio(payload) => match payload.to_frame() {
                Ok(frame) => {
                    if let Err(e) = self.playback.enqueue_pcm16(&frame.pcm) {
                        tracing::warn!(error = %e, seq = frame.seq, "dropping undecodable response audio");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "dropping malformed response audio"),
            },
            Envelope::Text(payload) => self.emit(ClientEvent::Transcript(payload.text)),
            Envelope::Control(msg) => self.handle_control(msg),
            Envelope::Ping { nonce } => self.send(&Envelope::Pong { nonce }).await?,
            Envelope::Pong { .. } => {}
        }
        Ok(())
    }

    fn handle_control(&mut self, msg: ControlMessage) {
        let reason = msg.payload_str("reason").map(ToString::to_string);

        match msg.event {
            ControlEvent::SessionStarted => {
                let session_id = msg.session_id.clone().unwrap_or_default();
                tracing::info!(session_id = %session_id, "session started");
                let output_sample_rate = msg
                    .payload
                    .get("output_sample_rate")
                    .and_then(serde_json::Value::as_u64)
                    .and_then(|r| u32::try_from(r).ok());
                self.session_id = Some(session_id.clone());
                self.emit(ClientEvent::SessionStarted {
                    session_id,
                    output_sample_rate,
                });
            }
            ControlEvent::SessionExpired => {
                tracing::info!(reason = ?reason, "session expired");
                self.session_id = None;
                self.emit(ClientEvent::SessionExpired {
                    reason: reason.unwrap_or_default(),
                });
            }
            ControlEvent::SessionError => {
                let code = msg.payload_str("code").unwrap_or("unknown").to_string();
                let message = msg.payload_str("message").unwrap_or_default().to_string();
                tracing::warn!(code = %code, message = %message, "session error");
                // A rejected duplicate start leaves the live session alone
                if code != "session_active" {
                    self.session_id = None;
                }
                self.emit(ClientEvent::SessionError { code, message });
            }
            ControlEvent::SessionEnd => {
                tracing::info!(reason = ?reason, "session ended by relay");
                self.session_id = None;
                self.emit(ClientEvent::SessionEnded { reason });
            }
            ControlEvent::SessionStart => {
                tracing::debug!("ignoring session_start from relay");
            }
        }
    }
}

async fn run(
    socket: Socket,
    mut frames: mpsc::Receiver<AudioFrame>,
    playback: PlaybackQueue,
    events: mpsc::UnboundedSender<ClientEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let (sink, mut stream) = socket.split();
    let mut session = Session {
        sink,
        playback,
        events,
        session_id: None,
    };

    if let Err(e) = session.send(&ControlMessage::start().into()).await {
        tracing::warn!(error = %e, "failed to request session");
        session.emit(ClientEvent::Disconnected);
        return;
    }

    loop {
        tokio::select! {
            biased;

            _ = &mut stop => {
                if let Some(id) = session.session_id.take() {
                    let end = ControlMessage::end(Some(&id), None);
                    if let Err(e) = session.send(&end.into()).await {
                        tracing::debug!(error = %e, "failed to send session_end");
                    }
                }
                let _ = session.sink.close().await;
                break;
            }

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = session.handle_text(text.as_str()).await {
                        tracing::warn!(error = %e, "relay connection failed");
                        session.emit(ClientEvent::Disconnected);
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("relay closed the connection");
                    session.emit(ClientEvent::Disconnected);
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "relay connection failed");
                    session.emit(ClientEvent::Disconnected);
                    break;
                }
                Some(Ok(_)) => {}
            },

            Some(frame) = frames.recv() => {
                // Frames captured before the session is live are discarded
                let Some(id) = session.session_id.clone() else { continue };
                if let Err(e) = session.send(&Envelope::audio(&frame, Some(&id))).await {
                    tracing::warn!(error = %e, "failed to send audio frame");
                    session.emit(ClientEvent::Disconnected);
                    break;
                }
            }
        }
    }

    tracing::debug!("connection task finished");
}
