//! Per-session state and lifecycle vocabulary

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::protocol::{ControlMessage, Envelope, ExpiryReason};
use crate::upstream::UpstreamHandle;

/// Upper bound on waiting for queue space when delivering a control message
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(1);

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Not yet created
    Idle,
    /// Upstream handshake in flight
    Initializing,
    /// Forwarding in both directions
    Active,
    /// Tearing down, flushing what is in flight
    Draining,
    /// Terminal
    Closed,
}

impl SessionStatus {
    /// Whether moving from `self` to `next` is a legal transition
    ///
    /// Re-entering `Closed` is allowed and has no effect.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Initializing)
                | (Self::Initializing, Self::Active | Self::Closed)
                | (Self::Active, Self::Draining)
                | (Self::Draining | Self::Closed, Self::Closed)
        )
    }

    /// Whether the session still holds resources
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Idle | Self::Closed)
    }

    /// Lowercase name for logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status transition, as published to relay subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub session_id: String,
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// Why a session is being torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownReason {
    /// Client sent `session_end`
    ClientRequested,
    /// Client socket went away
    ClientDisconnected,
    /// Upstream response stream ended
    UpstreamTerminated,
    /// No frames or responses within the idle interval
    IdleTimeout,
    /// Upstream link failed
    Transport(String),
    /// Relay is shutting down
    Shutdown,
}

impl TeardownReason {
    /// Short name for logs
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ClientRequested => "client_requested",
            Self::ClientDisconnected => "client_disconnected",
            Self::UpstreamTerminated => "upstream_terminated",
            Self::IdleTimeout => "idle_timeout",
            Self::Transport(_) => "transport_error",
            Self::Shutdown => "server_shutdown",
        }
    }

    /// Control message owed to the client, if it is still there to read one
    #[must_use]
    pub fn notification(&self, session_id: &str) -> Option<ControlMessage> {
        match self {
            Self::ClientRequested => Some(ControlMessage::end(Some(session_id), None)),
            Self::ClientDisconnected => None,
            Self::UpstreamTerminated => Some(ControlMessage::expired(
                session_id,
                ExpiryReason::UpstreamTerminated,
            )),
            Self::IdleTimeout => Some(ControlMessage::expired(session_id, ExpiryReason::IdleTimeout)),
            Self::Transport(message) => Some(ControlMessage::error(
                Some(session_id),
                "transport_error",
                message.clone(),
            )),
            Self::Shutdown => Some(ControlMessage::end(Some(session_id), Some("server_shutdown"))),
        }
    }
}

/// Result of a non-blocking send to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Queue full; the message was dropped
    Dropped,
    /// Client is gone
    Closed,
}

/// Outbound queue to one connected client
#[derive(Debug, Clone)]
pub struct ClientChannel {
    tx: mpsc::Sender<Envelope>,
}

impl ClientChannel {
    /// Wrap an existing sender
    #[must_use]
    pub const fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self { tx }
    }

    /// Create a channel and its receiving end
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Fire-and-forget send; never waits
    pub fn try_send(&self, envelope: Envelope) -> Delivery {
        match self.tx.try_send(envelope) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Deliver a control message, waiting briefly for queue space
    ///
    /// Returns `false` if the client is gone or did not drain in time.
    pub async fn notify(&self, message: ControlMessage) -> bool {
        matches!(
            tokio::time::timeout(NOTIFY_TIMEOUT, self.tx.send(message.into())).await,
            Ok(Ok(()))
        )
    }

    /// Whether the receiving side has been dropped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the receiving side has been dropped
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

/// Everything the relay knows about one session
pub struct SessionState {
    id: String,
    created_at: DateTime<Utc>,
    client: ClientChannel,
    status: Mutex<SessionStatus>,
    last_activity: Mutex<Instant>,
    upstream: OnceLock<Arc<dyn UpstreamHandle>>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionState {
    /// New session in `Idle`
    #[must_use]
    pub fn new(id: String, client: ClientChannel) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            client,
            status: Mutex::new(SessionStatus::Idle),
            last_activity: Mutex::new(Instant::now()),
            upstream: OnceLock::new(),
            cancel: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub const fn client(&self) -> &ClientChannel {
        &self.client
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *lock(&self.status)
    }

    /// Attempt a transition, returning the previous status on success
    ///
    /// # Errors
    ///
    /// Returns the current status if the transition is illegal
    pub fn transition(&self, to: SessionStatus) -> Result<SessionStatus, SessionStatus> {
        let mut status = lock(&self.status);
        let from = *status;
        if from.can_transition_to(to) {
            *status = to;
            Ok(from)
        } else {
            Err(from)
        }
    }

    /// Send to the client only while the session is `Active`
    ///
    /// Holds the status lock across the send, so nothing forwarded this way
    /// can land after the move to `Draining` and the notification behind it.
    /// Returns `None` if the session is no longer active.
    pub fn forward(&self, envelope: Envelope) -> Option<Delivery> {
        let status = lock(&self.status);
        (*status == SessionStatus::Active).then(|| self.client.try_send(envelope))
    }

    /// Record activity now
    pub fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    /// Attach the upstream handle; only the first call has effect
    pub fn attach_upstream(&self, handle: Arc<dyn UpstreamHandle>) {
        let _ = self.upstream.set(handle);
    }

    #[must_use]
    pub fn upstream(&self) -> Option<&Arc<dyn UpstreamHandle>> {
        self.upstream.get()
    }

    /// Install the signal used to stop the session task
    pub fn arm_cancel(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.cancel) = Some(tx);
        rx
    }

    /// Stop the session task, if one is running
    pub fn cancel(&self) {
        if let Some(tx) = lock(&self.cancel).take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_lifecycle() {
        use SessionStatus::{Active, Closed, Draining, Idle, Initializing};

        assert!(Idle.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Active));
        assert!(Initializing.can_transition_to(Closed));
        assert!(Active.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Closed));
        assert!(Closed.can_transition_to(Closed));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        use SessionStatus::{Active, Closed, Draining, Idle, Initializing};

        assert!(!Closed.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Initializing));
        assert!(!Draining.can_transition_to(Active));
        assert!(!Active.can_transition_to(Initializing));
        assert!(!Idle.can_transition_to(Active));

        let (client, _rx) = ClientChannel::bounded(1);
        let state = SessionState::new("s".to_string(), client);
        assert_eq!(state.transition(Active), Err(Idle));
        assert_eq!(state.transition(Initializing), Ok(Idle));
        assert_eq!(state.transition(Closed), Ok(Initializing));
        assert_eq!(state.transition(Active), Err(Closed));
        assert_eq!(state.status(), Closed);
    }

    #[test]
    fn disconnect_sends_no_notification() {
        assert!(TeardownReason::ClientDisconnected.notification("s").is_none());

        let expired = TeardownReason::IdleTimeout.notification("s").unwrap();
        assert_eq!(expired.payload_str("reason"), Some("idle_timeout"));

        let shutdown = TeardownReason::Shutdown.notification("s").unwrap();
        assert_eq!(shutdown.payload_str("reason"), Some("server_shutdown"));
    }

    #[tokio::test]
    async fn full_client_queue_drops_without_waiting() {
        let (client, mut rx) = ClientChannel::bounded(1);

        assert_eq!(client.try_send(Envelope::Ping { nonce: None }), Delivery::Sent);
        assert_eq!(client.try_send(Envelope::Ping { nonce: None }), Delivery::Dropped);

        rx.recv().await.unwrap();
        drop(rx);
        assert_eq!(client.try_send(Envelope::Ping { nonce: None }), Delivery::Closed);
        assert!(client.is_closed());
    }

    #[test]
    fn forward_only_while_active() {
        use SessionStatus::{Active, Draining, Initializing};

        let (client, mut rx) = ClientChannel::bounded(4);
        let state = SessionState::new("s".to_string(), client);

        assert_eq!(state.forward(Envelope::Ping { nonce: Some(1) }), None);
        state.transition(Initializing).unwrap();
        state.transition(Active).unwrap();
        assert_eq!(
            state.forward(Envelope::Ping { nonce: Some(2) }),
            Some(Delivery::Sent)
        );
        state.transition(Draining).unwrap();
        assert_eq!(state.forward(Envelope::Ping { nonce: Some(3) }), None);

        assert_eq!(rx.try_recv().unwrap(), Envelope::Ping { nonce: Some(2) });
        assert!(rx.try_recv().is_err());
    }
}
