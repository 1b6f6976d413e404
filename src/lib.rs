//! Beacon Duplex - real-time duplex voice relay
//!
//! This library provides both ends of a low-latency voice channel between a
//! client device and a remote generative voice service:
//! - Microphone capture and fixed-size PCM16 framing
//! - A versioned session protocol over WebSocket
//! - A server-side relay pairing each client with one upstream session
//! - Gapless playback scheduling of response audio
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │          Client          │        │          Relay           │
//! │  capture → encoder ──────┼── ws ──┼─→ SessionRelay ──────────┼──→ Upstream
//! │  playback ← scheduler ←──┼────────┼── session task ←─────────┼──┘ (AI voice)
//! └──────────────────────────┘        └──────────────────────────┘
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod upstream;
pub mod voice;

pub use client::{ClientEvent, VoiceClient};
pub use config::Config;
pub use error::{Error, Result};
pub use protocol::{AudioFrame, ControlMessage, Envelope};
pub use relay::{ClientChannel, RelayOptions, SessionRelay, SessionStatus, TeardownReason};
pub use upstream::{ResponseChunk, UpstreamHandle, UpstreamService, UpstreamSession};
