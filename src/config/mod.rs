//! Configuration management for the duplex voice relay
//!
//! Values resolve env > TOML file > default.

pub mod file;

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use url::Url;

use crate::{Error, Result};

/// Relay and client configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// HTTP/WebSocket listener
    pub server: ServerConfig,

    /// Session relay tuning
    pub relay: RelayConfig,

    /// Audio format shared by client and relay
    pub audio: AudioConfig,

    /// Upstream voice service
    pub upstream: UpstreamConfig,
}

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 18790,
        }
    }
}

impl ServerConfig {
    /// Socket address to bind
    ///
    /// # Errors
    ///
    /// Returns error if host is not an IP address
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address {}: {e}", self.host)))
    }
}

/// Relay tuning
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub idle_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub max_sessions: usize,
    pub client_queue: usize,
    pub upstream_backlog: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            handshake_timeout_secs: 10,
            max_sessions: 256,
            client_queue: 64,
            upstream_backlog: crate::relay::DEFAULT_BACKLOG,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Audio format
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Capture rate of client audio
    pub input_sample_rate: u32,
    /// Playback rate of upstream audio
    pub output_sample_rate: u32,
    /// Samples per captured frame
    pub frame_samples: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: crate::voice::SAMPLE_RATE,
            output_sample_rate: crate::voice::DEFAULT_OUTPUT_SAMPLE_RATE,
            frame_samples: crate::voice::DEFAULT_FRAME_SAMPLES,
        }
    }
}

/// Upstream voice service
#[derive(Clone, Default)]
pub struct UpstreamConfig {
    /// Service endpoint; `None` selects the local loopback
    pub url: Option<Url>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("url", &self.url.as_ref().map(Url::as_str))
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .field("model", &self.model)
            .field("voice", &self.voice)
            .finish()
    }
}

fn parse_env<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| match v.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %v, "ignoring unparseable environment value");
            None
        }
    })
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// An explicit `path` must exist and parse; the default path is optional.
    ///
    /// # Errors
    ///
    /// Returns error if the explicit file is unreadable or the result fails
    /// validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = match path {
            Some(path) => file::read_config_file(path)?,
            None => file::load_config_file(),
        };
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Merge an env lookup over a parsed file over defaults, then validate
    ///
    /// # Errors
    ///
    /// Returns error if the upstream URL does not parse or validation fails
    pub fn resolve(
        fc: file::DuplexConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = Self::default();

        let server = ServerConfig {
            host: env("BEACON_DUPLEX_HOST")
                .or(fc.server.host)
                .unwrap_or(defaults.server.host),
            port: parse_env(&env, "BEACON_DUPLEX_PORT")
                .or_else(|| parse_env(&env, "PORT"))
                .or(fc.server.port)
                .unwrap_or(defaults.server.port),
        };

        let relay = RelayConfig {
            idle_timeout_secs: parse_env(&env, "BEACON_DUPLEX_IDLE_TIMEOUT_SECS")
                .or(fc.relay.idle_timeout_secs)
                .unwrap_or(defaults.relay.idle_timeout_secs),
            handshake_timeout_secs: parse_env(&env, "BEACON_DUPLEX_HANDSHAKE_TIMEOUT_SECS")
                .or(fc.relay.handshake_timeout_secs)
                .unwrap_or(defaults.relay.handshake_timeout_secs),
            max_sessions: parse_env(&env, "BEACON_DUPLEX_MAX_SESSIONS")
                .or(fc.relay.max_sessions)
                .unwrap_or(defaults.relay.max_sessions),
            client_queue: fc.relay.client_queue.unwrap_or(defaults.relay.client_queue),
            upstream_backlog: fc
                .relay
                .upstream_backlog
                .unwrap_or(defaults.relay.upstream_backlog),
        };

        let audio = AudioConfig {
            input_sample_rate: fc
                .audio
                .input_sample_rate
                .unwrap_or(defaults.audio.input_sample_rate),
            output_sample_rate: fc
                .audio
                .output_sample_rate
                .unwrap_or(defaults.audio.output_sample_rate),
            frame_samples: fc
                .audio
                .frame_samples
                .unwrap_or(defaults.audio.frame_samples),
        };

        let url = env("BEACON_UPSTREAM_URL")
            .or(fc.upstream.url)
            .filter(|u| !u.is_empty())
            .map(|u| Url::parse(&u).map_err(|e| Error::Config(format!("invalid upstream url {u}: {e}"))))
            .transpose()?;

        let upstream = UpstreamConfig {
            url,
            api_key: env("BEACON_UPSTREAM_API_KEY").or(fc.upstream.api_key),
            model: env("BEACON_UPSTREAM_MODEL").or(fc.upstream.model),
            voice: env("BEACON_UPSTREAM_VOICE").or(fc.upstream.voice),
        };

        let config = Self {
            server,
            relay,
            audio,
            upstream,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot run with
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first invalid field
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("relay.idle_timeout_secs", self.relay.idle_timeout_secs == 0),
            ("relay.handshake_timeout_secs", self.relay.handshake_timeout_secs == 0),
            ("relay.max_sessions", self.relay.max_sessions == 0),
            ("relay.client_queue", self.relay.client_queue == 0),
            ("relay.upstream_backlog", self.relay.upstream_backlog == 0),
            ("audio.input_sample_rate", self.audio.input_sample_rate == 0),
            ("audio.output_sample_rate", self.audio.output_sample_rate == 0),
            ("audio.frame_samples", self.audio.frame_samples == 0),
        ];
        if let Some((field, _)) = nonzero.iter().find(|(_, zero)| *zero) {
            return Err(Error::Config(format!("{field} must be greater than zero")));
        }

        if let Some(url) = &self.upstream.url
            && !matches!(url.scheme(), "ws" | "wss")
        {
            return Err(Error::Config(format!(
                "upstream url must be ws:// or wss://, got {}",
                url.scheme()
            )));
        }

        Ok(())
    }
}
