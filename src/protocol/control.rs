//! Lifecycle control messages

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::PROTOCOL_VERSION;

/// Lifecycle events carried by control envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlEvent {
    /// Client asks for a new session
    SessionStart,
    /// Relay confirms the session is active
    SessionStarted,
    /// Either side ends the session
    SessionEnd,
    /// Session could not start or failed
    SessionError,
    /// Session timed out or the upstream ended it
    SessionExpired,
}

/// Why a session expired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    IdleTimeout,
    UpstreamTerminated,
}

impl ExpiryReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IdleTimeout => "idle_timeout",
            Self::UpstreamTerminated => "upstream_terminated",
        }
    }
}

/// Control envelope body: `{event, session_id?, payload}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub event: ControlEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl ControlMessage {
    /// Client request to open a session
    #[must_use]
    pub fn start() -> Self {
        Self {
            event: ControlEvent::SessionStart,
            session_id: None,
            payload: Value::Null,
        }
    }

    /// Relay acknowledgement that the session is active
    #[must_use]
    pub fn started(session_id: &str, input_sample_rate: u32, output_sample_rate: u32) -> Self {
        Self {
            event: ControlEvent::SessionStarted,
            session_id: Some(session_id.to_string()),
            payload: json!({
                "version": PROTOCOL_VERSION,
                "input_sample_rate": input_sample_rate,
                "output_sample_rate": output_sample_rate,
            }),
        }
    }

    /// Session end, with an optional reason
    #[must_use]
    pub fn end(session_id: Option<&str>, reason: Option<&str>) -> Self {
        Self {
            event: ControlEvent::SessionEnd,
            session_id: session_id.map(ToString::to_string),
            payload: reason.map_or(Value::Null, |r| json!({ "reason": r })),
        }
    }

    /// Session failure with a wire code and human-readable message
    #[must_use]
    pub fn error(session_id: Option<&str>, code: &str, message: impl Into<String>) -> Self {
        Self {
            event: ControlEvent::SessionError,
            session_id: session_id.map(ToString::to_string),
            payload: json!({ "code": code, "message": message.into() }),
        }
    }

    /// Session expiry notification
    #[must_use]
    pub fn expired(session_id: &str, reason: ExpiryReason) -> Self {
        Self {
            event: ControlEvent::SessionExpired,
            session_id: Some(session_id.to_string()),
            payload: json!({ "reason": reason.as_str() }),
        }
    }

    /// String field from the payload, if present
    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
