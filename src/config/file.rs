//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon/duplex.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "BEACON_DUPLEX_CONFIG";

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DuplexConfigFile {
    /// HTTP/WebSocket listener
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Session relay tuning
    #[serde(default)]
    pub relay: RelayFileConfig,

    /// Audio format
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Upstream voice service
    #[serde(default)]
    pub upstream: UpstreamFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Relay configuration
#[derive(Debug, Default, Deserialize)]
pub struct RelayFileConfig {
    /// Seconds without frames or responses before a session expires
    pub idle_timeout_secs: Option<u64>,
    /// Seconds allowed for the upstream handshake
    pub handshake_timeout_secs: Option<u64>,
    pub max_sessions: Option<usize>,
    /// Outbound envelopes queued per client
    pub client_queue: Option<usize>,
    /// Frames queued per session for a slow upstream link
    pub upstream_backlog: Option<usize>,
}

/// Audio format configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub input_sample_rate: Option<u32>,
    pub output_sample_rate: Option<u32>,
    pub frame_samples: Option<usize>,
}

/// Upstream service configuration
#[derive(Debug, Default, Deserialize)]
pub struct UpstreamFileConfig {
    /// `ws://` or `wss://` endpoint; unset means local loopback
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
}

/// Read and parse a config file, failing on any error
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed
pub fn read_config_file(path: &Path) -> Result<DuplexConfigFile> {
    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Load the TOML config file from the standard path
///
/// Returns `DuplexConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> DuplexConfigFile {
    let Some(path) = config_file_path() else {
        return DuplexConfigFile::default();
    };

    if !path.exists() {
        return DuplexConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            DuplexConfigFile::default()
        }
    }
}

/// Return the config file path: `$BEACON_DUPLEX_CONFIG`, else
/// `~/.config/omni/beacon/duplex.toml`
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return Some(PathBuf::from(path));
    }

    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon")
            .join("duplex.toml")
    })
}
