//! TOML configuration file loading
//!
//! Supports `~/.config/kiddo/speech/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct SpeechConfigFile {
    /// Token and ASR endpoints
    #[serde(default)]
    pub endpoints: EndpointsFileConfig,

    /// Session timing
    #[serde(default)]
    pub session: SessionFileConfig,
}

/// Remote endpoints
#[derive(Debug, Default, Deserialize)]
pub struct EndpointsFileConfig {
    /// Token endpoint (e.g. "https://kiddo.example/api/token")
    pub token_url: Option<String>,

    /// Streaming ASR socket endpoint
    pub asr_url: Option<String>,

    /// Protocol namespace
    pub namespace: Option<String>,
}

/// Session timing, all in milliseconds
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    pub connect_timeout_ms: Option<u64>,
    pub attempt_timeout_ms: Option<u64>,
    pub stop_grace_ms: Option<u64>,
    pub chunk_ms: Option<u64>,
    pub http_timeout_ms: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `SpeechConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> SpeechConfigFile {
    config_file_path().map_or_else(SpeechConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> SpeechConfigFile {
    if !path.exists() {
        return SpeechConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                SpeechConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            SpeechConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/kiddo/speech/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("kiddo")
            .join("speech")
            .join("config.toml")
    })
}
