//! Kiddo Speech - streaming speech recognition client for pronunciation practice
//!
//! This library provides:
//! - Short-lived credential fetching from the token endpoint
//! - Microphone capture with an acquire-once, share, release-once lifecycle
//! - PCM16 framing at the recognizer's sample rate
//! - The streaming recognition protocol session
//! - Matching transcripts against an expected utterance
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Listener                         │
//! │        start_attempt  │  Attempt::wait / stop       │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                   Session task                       │
//! │   Credential  │  Socket  │  Audio tap  │  Matcher   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │      Token endpoint     │     Streaming ASR          │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod asr;
pub mod config;
pub mod credential;
pub mod error;
pub mod listener;
pub mod voice;

pub use asr::{Status, Transcript};
pub use config::{Config, SpeechConfig};
pub use credential::{Credential, CredentialProvider, HttpCredentialProvider};
pub use error::{Error, Result, SpeechError};
pub use listener::{Attempt, Listener};
pub use voice::Microphone;
