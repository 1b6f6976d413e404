//! Wire protocol shared by the voice client and the relay
//!
//! Every message on the persistent socket is a JSON envelope:
//!
//! ```text
//! {"v":1,"type":"audio","seq":3,"timestamp_ms":768,"sample_rate":16000,"data":"<base64 pcm16le>"}
//! {"v":1,"type":"text","text":"hello"}
//! {"v":1,"type":"control","event":"session_expired","session_id":"…","payload":{"reason":"idle_timeout"}}
//! {"v":1,"type":"ping","nonce":7}
//! ```
//!
//! Ordering is FIFO per direction only.

mod control;
mod frame;

pub use control::{ControlEvent, ControlMessage, ExpiryReason};
pub use frame::AudioFrame;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Current protocol version written into every envelope
pub const PROTOCOL_VERSION: u16 = 1;

const fn default_version() -> u16 {
    PROTOCOL_VERSION
}

/// A single typed message on the socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Base64 PCM16LE mono audio
    Audio(AudioPayload),
    /// Text response chunk from the upstream service
    Text(TextPayload),
    /// Lifecycle signaling
    Control(ControlMessage),
    /// Keepalive probe
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<u64>,
    },
    /// Keepalive answer, echoing the probe's nonce
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<u64>,
    },
}

/// Audio envelope body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub seq: u64,
    #[serde(default)]
    pub timestamp_ms: u64,
    pub sample_rate: u32,
    /// Base64 of little-endian PCM16 mono samples
    pub data: String,
}

/// Text envelope body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub text: String,
}

#[derive(Serialize)]
struct WireRef<'a> {
    v: u16,
    #[serde(flatten)]
    envelope: &'a Envelope,
}

#[derive(Deserialize)]
struct Wire {
    #[serde(default = "default_version")]
    v: u16,
    #[serde(flatten)]
    envelope: Envelope,
}

impl Envelope {
    /// Serialize with the current protocol version attached
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&WireRef {
            v: PROTOCOL_VERSION,
            envelope: self,
        })?)
    }

    /// Parse an envelope received from the socket
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` for malformed JSON, unknown types, or an
    /// unsupported version
    pub fn decode(text: &str) -> Result<Self> {
        let wire: Wire = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("malformed envelope: {e}")))?;

        if wire.v != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported protocol version {} (expected {PROTOCOL_VERSION})",
                wire.v
            )));
        }

        Ok(wire.envelope)
    }

    /// Build an audio envelope from a captured or synthesized frame
    #[must_use]
    pub fn audio(frame: &AudioFrame, session_id: Option<&str>) -> Self {
        Self::Audio(AudioPayload {
            session_id: session_id.map(ToString::to_string),
            seq: frame.seq,
            timestamp_ms: frame.timestamp_ms,
            sample_rate: frame.sample_rate,
            data: BASE64.encode(&frame.pcm),
        })
    }

    /// Build a text envelope
    #[must_use]
    pub fn text(text: impl Into<String>, session_id: Option<&str>) -> Self {
        Self::Text(TextPayload {
            session_id: session_id.map(ToString::to_string),
            text: text.into(),
        })
    }

    /// Envelope type name, for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Audio(_) => "audio",
            Self::Text(_) => "text",
            Self::Control(_) => "control",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }
}

impl From<ControlMessage> for Envelope {
    fn from(msg: ControlMessage) -> Self {
        Self::Control(msg)
    }
}

impl AudioPayload {
    /// Decode the base64 body back into a frame
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the body is not valid base64 or holds an
    /// odd number of bytes
    pub fn to_frame(&self) -> Result<AudioFrame> {
        let pcm = BASE64
            .decode(self.data.as_bytes())
            .map_err(|e| Error::Protocol(format!("invalid base64 audio: {e}")))?;

        if pcm.len() % 2 != 0 {
            return Err(Error::Protocol(format!(
                "audio payload has odd length {}",
                pcm.len()
            )));
        }

        Ok(AudioFrame {
            seq: self.seq,
            timestamp_ms: self.timestamp_ms,
            sample_rate: self.sample_rate,
            pcm: Bytes::from(pcm),
        })
    }
}
