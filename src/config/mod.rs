//! Configuration management for the speech client

pub mod file;

use std::time::Duration;

use crate::{Error, Result};

/// Default token endpoint
pub const DEFAULT_TOKEN_URL: &str = "http://localhost:9000/api/token";

/// Default streaming ASR endpoint
pub const DEFAULT_ASR_URL: &str = "wss://nls-gateway-cn-shanghai.aliyuncs.com/ws/v1";

/// Default protocol namespace
pub const DEFAULT_NAMESPACE: &str = "SpeechTranscriber";

/// Speech client configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Recognition session configuration
    pub speech: SpeechConfig,
}

/// Recognition session configuration
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// Endpoint returning `{ token, appkey }`
    pub token_url: String,

    /// Streaming ASR socket endpoint; the token is appended as a query parameter
    pub asr_url: String,

    /// Namespace stamped on every outbound envelope
    pub namespace: String,

    /// Bound on socket open plus the start handshake
    pub connect_timeout: Duration,

    /// Hard bound on a whole attempt, measured from its start
    pub attempt_timeout: Duration,

    /// How long `Stopping` waits for the server's completion event
    pub stop_grace: Duration,

    /// Audio duration carried by one binary frame
    pub chunk: Duration,

    /// Request timeout for the token endpoint
    pub http_timeout: Duration,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            token_url: DEFAULT_TOKEN_URL.to_string(),
            asr_url: DEFAULT_ASR_URL.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            connect_timeout: Duration::from_secs(3),
            attempt_timeout: Duration::from_secs(8),
            stop_grace: Duration::from_millis(1500),
            chunk: Duration::from_millis(100),
            http_timeout: Duration::from_secs(10),
        }
    }
}

impl SpeechConfig {
    /// Check that the configuration can drive a session
    ///
    /// # Errors
    ///
    /// Returns error if a timeout is zero or an endpoint URL is unusable
    pub fn validate(&self) -> Result<()> {
        let asr = url::Url::parse(&self.asr_url)
            .map_err(|e| Error::Config(format!("invalid asr_url {}: {e}", self.asr_url)))?;
        if !matches!(asr.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "asr_url must use ws or wss, got {}",
                asr.scheme()
            )));
        }

        url::Url::parse(&self.token_url)
            .map_err(|e| Error::Config(format!("invalid token_url {}: {e}", self.token_url)))?;

        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("attempt_timeout", self.attempt_timeout),
            ("chunk", self.chunk),
            ("http_timeout", self.http_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be non-zero")));
            }
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load() -> Result<Self> {
        Self::from_file(file::load_config_file())
    }

    /// Build configuration from a parsed file, applying env overrides
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn from_file(fc: file::SpeechConfigFile) -> Result<Self> {
        let defaults = SpeechConfig::default();

        let speech = SpeechConfig {
            token_url: std::env::var("KIDDO_TOKEN_URL")
                .ok()
                .or(fc.endpoints.token_url)
                .unwrap_or(defaults.token_url),
            asr_url: std::env::var("KIDDO_ASR_URL")
                .ok()
                .or(fc.endpoints.asr_url)
                .unwrap_or(defaults.asr_url),
            namespace: fc.endpoints.namespace.unwrap_or(defaults.namespace),
            connect_timeout: env_millis("KIDDO_CONNECT_TIMEOUT_MS")
                .or(fc.session.connect_timeout_ms)
                .map_or(defaults.connect_timeout, Duration::from_millis),
            attempt_timeout: env_millis("KIDDO_ATTEMPT_TIMEOUT_MS")
                .or(fc.session.attempt_timeout_ms)
                .map_or(defaults.attempt_timeout, Duration::from_millis),
            stop_grace: env_millis("KIDDO_STOP_GRACE_MS")
                .or(fc.session.stop_grace_ms)
                .map_or(defaults.stop_grace, Duration::from_millis),
            chunk: fc
                .session
                .chunk_ms
                .map_or(defaults.chunk, Duration::from_millis),
            http_timeout: fc
                .session
                .http_timeout_ms
                .map_or(defaults.http_timeout, Duration::from_millis),
        };

        speech.validate()?;
        Ok(Self { speech })
    }
}

/// Parse a millisecond value from the environment
fn env_millis(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(var = name, value = %raw, error = %e, "ignoring invalid duration");
            None
        }
    }
}
