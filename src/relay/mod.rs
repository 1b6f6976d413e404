//! Session relay
//!
//! Owns the 1:1 mapping between a client channel and an upstream AI session.
//! Each session runs as its own task; the only shared structure is the
//! session registry.
//!
//! ```text
//! Idle -> Initializing -> Active -> Draining -> Closed
//!               \______________________________/
//!                     (handshake failure)
//! ```

mod backlog;
mod registry;
mod session;
mod state;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

pub use backlog::{Backlog, DEFAULT_BACKLOG};
pub use registry::SessionRegistry;
pub use state::{ClientChannel, Delivery, SessionState, SessionStatus, StatusChange, TeardownReason};

use crate::protocol::{AudioFrame, ControlMessage};
use crate::upstream::{SessionParams, UpstreamService, UpstreamSession};
use crate::{Error, Result};

/// Capacity of the status change broadcast
const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Relay tuning
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Inactivity after which a session expires
    pub idle_timeout: Duration,
    /// Bound on the upstream handshake
    pub handshake_timeout: Duration,
    /// Maximum concurrently registered sessions
    pub max_sessions: usize,
    /// Rate of client audio
    pub input_sample_rate: u32,
    /// Rate of upstream audio
    pub output_sample_rate: u32,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            max_sessions: 256,
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
        }
    }
}

impl From<&crate::Config> for RelayOptions {
    fn from(config: &crate::Config) -> Self {
        Self {
            idle_timeout: config.relay.idle_timeout(),
            handshake_timeout: config.relay.handshake_timeout(),
            max_sessions: config.relay.max_sessions,
            input_sample_rate: config.audio.input_sample_rate,
            output_sample_rate: config.audio.output_sample_rate,
        }
    }
}

/// Point-in-time view of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

struct RelayInner {
    upstream: Arc<dyn UpstreamService>,
    options: RelayOptions,
    sessions: SessionRegistry,
    status_tx: broadcast::Sender<StatusChange>,
}

/// Server-side session relay
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct SessionRelay {
    inner: Arc<RelayInner>,
}

impl std::fmt::Debug for SessionRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRelay")
            .field("upstream", &self.inner.upstream.name())
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl SessionRelay {
    /// Create a relay over `upstream`
    #[must_use]
    pub fn new(upstream: Arc<dyn UpstreamService>, options: RelayOptions) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RelayInner {
                upstream,
                options,
                sessions: SessionRegistry::new(),
                status_tx,
            }),
        }
    }

    /// Relay settings
    #[must_use]
    pub fn options(&self) -> &RelayOptions {
        &self.inner.options
    }

    /// Observe every status transition
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.status_tx.subscribe()
    }

    fn transition(&self, state: &SessionState, to: SessionStatus) -> bool {
        match state.transition(to) {
            Ok(from) if from == to => true,
            Ok(from) => {
                tracing::debug!(session_id = %state.id(), %from, %to, "session status changed");
                let _ = self.inner.status_tx.send(StatusChange {
                    session_id: state.id().to_string(),
                    from,
                    to,
                });
                true
            }
            Err(from) => {
                tracing::warn!(session_id = %state.id(), %from, %to, "illegal session transition rejected");
                false
            }
        }
    }

    /// Open an upstream session for `client`
    ///
    /// On success the client has been sent `session_started` and the session
    /// is `Active`. On failure the client has been sent `session_error` and
    /// the session, if it was registered, is `Closed` without ever having
    /// been `Active`.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionLimit` when the relay is full,
    /// `Error::UpstreamUnavailable` if the handshake is rejected or times out,
    /// and `Error::Transport` if the client goes away mid-handshake
    pub async fn create_session(&self, client: ClientChannel) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let state = Arc::new(SessionState::new(id.clone(), client.clone()));

        if let Err(e) = self
            .inner
            .sessions
            .insert(Arc::clone(&state), self.inner.options.max_sessions)
            .await
        {
            tracing::warn!(error = %e, "rejecting session");
            client
                .notify(ControlMessage::error(None, e.code(), e.to_string()))
                .await;
            return Err(e);
        }
        self.transition(&state, SessionStatus::Initializing);

        let params = SessionParams {
            session_id: id.clone(),
            input_sample_rate: self.inner.options.input_sample_rate,
            output_sample_rate: self.inner.options.output_sample_rate,
        };

        let opened = tokio::select! {
            result = tokio::time::timeout(
                self.inner.options.handshake_timeout,
                self.inner.upstream.create_session(&params),
            ) => result
                .unwrap_or_else(|_| Err(Error::UpstreamUnavailable("handshake timed out".to_string()))),
            () = client.closed() => Err(Error::Transport("client disconnected during handshake".to_string())),
        };

        let UpstreamSession { handle, responses } = match opened {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "upstream handshake failed");
                if self.inner.sessions.remove(&id).await.is_some() {
                    self.transition(&state, SessionStatus::Closed);
                    client
                        .notify(ControlMessage::error(Some(&id), e.code(), e.to_string()))
                        .await;
                }
                return Err(e);
            }
        };

        state.attach_upstream(Arc::clone(&handle));
        let cancel = state.arm_cancel();

        // A teardown that raced the handshake has already moved us to Closed
        if !self.transition(&state, SessionStatus::Active) {
            handle.close().await;
            return Err(Error::Transport(
                "session closed during handshake".to_string(),
            ));
        }
        state.touch();

        tracing::info!(
            session_id = %id,
            upstream = self.inner.upstream.name(),
            "session active"
        );
        client
            .notify(ControlMessage::started(
                &id,
                self.inner.options.input_sample_rate,
                self.inner.options.output_sample_rate,
            ))
            .await;

        tokio::spawn(session::run(
            self.clone(),
            state,
            responses,
            cancel,
            self.inner.options.idle_timeout,
            self.inner.options.output_sample_rate,
        ));

        Ok(id)
    }

    /// Forward one client frame upstream unchanged
    ///
    /// Frames for unknown or no longer active sessions are dropped. Returns
    /// whether the frame was forwarded.
    pub async fn on_client_frame(&self, session_id: &str, frame: AudioFrame) -> bool {
        let Some(state) = self.inner.sessions.get(session_id).await else {
            tracing::debug!(session_id, seq = frame.seq, "frame for unknown session dropped");
            return false;
        };

        if state.status() != SessionStatus::Active {
            tracing::debug!(
                session_id,
                seq = frame.seq,
                status = %state.status(),
                "frame for inactive session dropped"
            );
            return false;
        }

        let Some(upstream) = state.upstream() else {
            return false;
        };

        state.touch();
        upstream.send_audio(frame.pcm);
        true
    }

    /// Tear down a session
    ///
    /// Removes the mapping, stops the session task, notifies the client (when
    /// the reason calls for it) and then releases the upstream session. Only the
    /// first call for a session does anything; returns whether this call
    /// performed the teardown.
    pub async fn teardown(&self, session_id: &str, reason: TeardownReason) -> bool {
        let Some(state) = self.inner.sessions.remove(session_id).await else {
            tracing::trace!(session_id, reason = reason.as_str(), "teardown for unknown session ignored");
            return false;
        };

        if state.status() == SessionStatus::Active {
            self.transition(&state, SessionStatus::Draining);
        }

        state.cancel();
        if let Some(message) = reason.notification(session_id)
            && !state.client().notify(message).await
        {
            tracing::debug!(session_id, "client did not receive teardown notification");
        }

        if let Some(upstream) = state.upstream() {
            upstream.close().await;
        }
        self.transition(&state, SessionStatus::Closed);

        tracing::info!(session_id, reason = reason.as_str(), "session closed");
        true
    }

    /// Status of a registered session
    pub async fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.inner
            .sessions
            .get(session_id)
            .await
            .map(|s| s.status())
    }

    /// Number of registered sessions
    pub async fn active_sessions(&self) -> usize {
        self.inner.sessions.len().await
    }

    /// Snapshot of registered sessions
    pub async fn sessions(&self) -> Vec<SessionSummary> {
        self.inner
            .sessions
            .list()
            .await
            .iter()
            .map(|s| SessionSummary {
                id: s.id().to_string(),
                status: s.status(),
                created_at: s.created_at(),
            })
            .collect()
    }

    /// Tear down every session, telling each client the server is going away
    pub async fn shutdown(&self) {
        let ids = self.inner.sessions.ids().await;
        tracing::info!(sessions = ids.len(), "shutting down relay");

        let teardowns = ids
            .iter()
            .map(|id| self.teardown(id, TeardownReason::Shutdown));
        futures::future::join_all(teardowns).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControlEvent, Envelope};
    use crate::upstream::LoopbackUpstream;

    fn relay() -> SessionRelay {
        SessionRelay::new(Arc::new(LoopbackUpstream::new(8)), RelayOptions::default())
    }

    #[tokio::test]
    async fn session_limit_is_reported_to_client() {
        let relay = SessionRelay::new(
            Arc::new(LoopbackUpstream::new(8)),
            RelayOptions {
                max_sessions: 1,
                ..RelayOptions::default()
            },
        );

        let (first, _first_rx) = ClientChannel::bounded(8);
        relay.create_session(first).await.unwrap();

        let (second, mut second_rx) = ClientChannel::bounded(8);
        let err = relay.create_session(second).await.unwrap_err();
        assert!(matches!(err, Error::SessionLimit(1)));

        let Some(Envelope::Control(msg)) = second_rx.recv().await else {
            panic!("expected control message");
        };
        assert_eq!(msg.event, ControlEvent::SessionError);
        assert_eq!(msg.payload_str("code"), Some("session_limit"));
    }

    #[tokio::test]
    async fn shutdown_ends_every_session() {
        let relay = relay();
        let (client, mut rx) = ClientChannel::bounded(8);
        let id = relay.create_session(client).await.unwrap();
        let _started = rx.recv().await.unwrap();

        relay.shutdown().await;

        let Some(Envelope::Control(msg)) = rx.recv().await else {
            panic!("expected control message");
        };
        assert_eq!(msg.event, ControlEvent::SessionEnd);
        assert_eq!(msg.session_id.as_deref(), Some(id.as_str()));
        assert_eq!(msg.payload_str("reason"), Some("server_shutdown"));
        assert_eq!(relay.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn status_changes_are_published_in_order() {
        let relay = relay();
        let mut changes = relay.subscribe();
        let (client, _rx) = ClientChannel::bounded(8);

        let id = relay.create_session(client).await.unwrap();
        relay.teardown(&id, TeardownReason::ClientRequested).await;

        let mut seen = Vec::new();
        while let Ok(change) = changes.try_recv() {
            seen.push((change.from, change.to));
        }
        assert_eq!(
            seen,
            vec![
                (SessionStatus::Idle, SessionStatus::Initializing),
                (SessionStatus::Initializing, SessionStatus::Active),
                (SessionStatus::Active, SessionStatus::Draining),
                (SessionStatus::Draining, SessionStatus::Closed),
            ]
        );
    }
}
