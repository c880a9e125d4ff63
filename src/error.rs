//! Error types for the speech client

use thiserror::Error;

/// Result type alias for speech client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Status code the ASR service uses for authentication failures
pub const AUTH_FAILED_STATUS: u32 = 40_000_001;

/// Ways a recognition attempt can fail
///
/// A settled attempt is shared between every caller waiting on it, so this
/// type is `Clone` and only carries owned strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpeechError {
    /// Token endpoint unreachable, non-success status, or incomplete body
    #[error("credential unavailable: {0}")]
    CredentialUnavailable(String),

    /// Microphone permission denied, or the stream is no longer usable
    #[error("microphone unavailable: {0}")]
    MicrophoneUnavailable(String),

    /// No live capture stream has been acquired yet
    #[error("microphone not initialized")]
    MicrophoneNotInitialized,

    /// Hardware cannot satisfy even the relaxed capture request
    #[error("microphone constraint error: {0}")]
    MicrophoneConstraintError(String),

    /// Platform has no capture capability at all
    #[error("microphone unsupported: {0}")]
    MicrophoneUnsupported(String),

    /// Server did not acknowledge the start handshake in time
    #[error("connection timed out after {0} ms")]
    ConnectionTimeout(u64),

    /// Socket-level failure or unclean close
    #[error("transport error: {0}")]
    TransportError(String),

    /// Server replied with a non-success status
    #[error("protocol error {code}: {message}")]
    ProtocolError {
        /// Numeric status code from the envelope header
        code: u32,
        /// Server-provided status text
        message: String,
    },
}

impl SpeechError {
    /// Short, user-facing description of the failure
    #[must_use]
    pub const fn status_text(&self) -> &'static str {
        match self {
            Self::CredentialUnavailable(_) => "Speech service sign-in failed",
            Self::MicrophoneUnavailable(_) => "Microphone is not available",
            Self::MicrophoneNotInitialized => "Microphone has not been enabled yet",
            Self::MicrophoneConstraintError(_) => "Microphone cannot record speech",
            Self::MicrophoneUnsupported(_) => "Recording is not supported here",
            Self::ConnectionTimeout(_) => "Speech service did not respond",
            Self::TransportError(_) => "Connection to speech service lost",
            Self::ProtocolError { .. } => "Speech service reported an error",
        }
    }

    /// Whether a fresh credential is needed before trying again
    #[must_use]
    pub const fn needs_reauth(&self) -> bool {
        match self {
            Self::CredentialUnavailable(_) => true,
            Self::ProtocolError { code, .. } => *code == AUTH_FAILED_STATUS,
            _ => false,
        }
    }
}

/// Errors that can occur in the speech client
#[derive(Debug, Error)]
pub enum Error {
    /// Recognition attempt failure
    #[error(transparent)]
    Speech(#[from] SpeechError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// WAV encoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}
