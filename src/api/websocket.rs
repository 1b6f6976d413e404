//! WebSocket handler for the duplex voice session protocol

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::task::JoinHandle;

use super::ApiState;
use crate::protocol::{ControlEvent, ControlMessage, Envelope};
use crate::relay::{ClientChannel, Delivery, SessionRelay, TeardownReason};
use crate::{Error, Result};

/// Build WebSocket routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/voice", get(ws_upgrade))
        .with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle WebSocket connection
///
/// Dropping the outbound receiver when the socket goes away is what signals
/// the relay: the session task and any in-flight handshake watch the client
/// channel and tear down as a client disconnect.
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sender, mut receiver) = socket.split();
    let (client, mut outbound) = ClientChannel::bounded(state.client_queue);

    tracing::info!("voice WebSocket connected");

    // Forward relay output to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            match envelope.encode() {
                Ok(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode outbound envelope"),
            }
        }
    });

    let relay = state.relay.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut conn = Connection {
            relay,
            client,
            session: None,
            end_requested: false,
        };
        let mut pending: Option<JoinHandle<Result<String>>> = None;

        loop {
            tokio::select! {
                // A finished start is recorded before the next message is read
                biased;

                Some(result) = wait_pending(&mut pending) => conn.on_started(result).await,

                msg = receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(start) = conn.handle_text(text.as_str(), pending.is_some()).await {
                            pending = Some(start);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("voice WebSocket closed by client");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "voice WebSocket read failed");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }

        conn.close().await;
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    tracing::info!("voice WebSocket disconnected");
}

/// Resolve the in-flight session start, or never if there is none
async fn wait_pending(pending: &mut Option<JoinHandle<Result<String>>>) -> Option<Result<String>> {
    let handle = pending.as_mut()?;
    let result = handle
        .await
        .unwrap_or_else(|e| Err(Error::Transport(format!("session start task failed: {e}"))));
    *pending = None;
    Some(result)
}

/// One client connection's view of its session
struct Connection {
    relay: SessionRelay,
    client: ClientChannel,
    session: Option<String>,
    /// `session_end` arrived while the start was still in flight
    end_requested: bool,
}

impl Connection {
    /// Handle one inbound text message
    ///
    /// Returns the spawned handshake when the message started a session.
    async fn handle_text(
        &mut self,
        text: &str,
        start_pending: bool,
    ) -> Option<JoinHandle<Result<String>>> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed message");
                return None;
            }
        };

        match envelope {
            Envelope::Audio(payload) => {
                let frame = match payload.to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, seq = payload.seq, "dropping malformed audio frame");
                        return None;
                    }
                };
                match &self.session {
                    Some(id) => {
                        self.relay.on_client_frame(id, frame).await;
                    }
                    None => tracing::trace!(seq = frame.seq, "audio before session start dropped"),
                }
            }
            Envelope::Control(msg) => return self.handle_control(&msg, start_pending).await,
            Envelope::Ping { nonce } => {
                if self.client.try_send(Envelope::Pong { nonce }) != Delivery::Sent {
                    tracing::debug!("pong not delivered");
                }
            }
            Envelope::Pong { .. } | Envelope::Text(_) => {}
        }
        None
    }

    async fn handle_control(
        &mut self,
        msg: &ControlMessage,
        start_pending: bool,
    ) -> Option<JoinHandle<Result<String>>> {
        match msg.event {
            ControlEvent::SessionStart => {
                if start_pending || self.has_live_session().await {
                    let err = Error::SessionActive;
                    self.client
                        .notify(ControlMessage::error(self.session.as_deref(), err.code(), err.to_string()))
                        .await;
                    return None;
                }

                self.session = None;
                let relay = self.relay.clone();
                let client = self.client.clone();
                Some(tokio::spawn(async move { relay.create_session(client).await }))
            }
            ControlEvent::SessionEnd => {
                match self.session.take() {
                    Some(id) => {
                        self.relay.teardown(&id, TeardownReason::ClientRequested).await;
                    }
                    None if start_pending => self.end_requested = true,
                    None => tracing::debug!("session_end without a session"),
                }
                None
            }
            other => {
                tracing::debug!(event = ?other, "ignoring client control event");
                None
            }
        }
    }

    /// Record the outcome of a session start, ending it at once if the
    /// client asked to while the handshake was in flight
    async fn on_started(&mut self, result: Result<String>) {
        let end_requested = std::mem::take(&mut self.end_requested);
        match result {
            Ok(id) if end_requested => {
                tracing::debug!(session_id = %id, "session ended during handshake");
                self.relay.teardown(&id, TeardownReason::ClientRequested).await;
            }
            Ok(id) => self.session = Some(id),
            Err(e) => tracing::debug!(error = %e, "session start failed"),
        }
    }

    async fn has_live_session(&self) -> bool {
        match &self.session {
            Some(id) => self.relay.status(id).await.is_some_and(|s| s.is_live()),
            None => false,
        }
    }

    async fn close(self) {
        if let Some(id) = self.session {
            self.relay.teardown(&id, TeardownReason::ClientDisconnected).await;
        }
    }
}
