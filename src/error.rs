//! Error types for the duplex voice relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across capture, transport, and relay
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone access was refused by the OS or user
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No usable audio hardware
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Audio stream error that does not fit the kinds above
    #[error("audio error: {0}")]
    Audio(String),

    /// Socket or network failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream service rejected or failed the session handshake
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Session ended by idle timeout or upstream termination
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// Relay is at its configured session capacity
    #[error("session limit reached ({0} active)")]
    SessionLimit(usize),

    /// Connection already owns a live session
    #[error("a session is already active on this connection")]
    SessionActive,

    /// Malformed or unsupported envelope
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Stable snake_case code used in `session_error` payloads
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "permission_denied",
            Self::DeviceUnavailable(_) => "device_unavailable",
            Self::Audio(_) => "audio_error",
            Self::Transport(_) | Self::Io(_) => "transport_error",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::SessionExpired(_) => "session_expired",
            Self::SessionLimit(_) => "session_limit",
            Self::SessionActive => "session_active",
            Self::Protocol(_) | Self::Serialization(_) => "protocol_error",
            Self::Config(_) | Self::Toml(_) => "config_error",
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<axum::Error> for Error {
    fn from(err: axum::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
