//! Wire format of the streaming transcription protocol
//!
//! Text frames carry JSON envelopes `{ header, payload? }`; audio travels as
//! raw PCM16 binary frames with no envelope. Every envelope in one
//! conversation shares the task id, while each outbound message gets a fresh
//! message id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::SpeechError;
use crate::voice::SAMPLE_RATE;

/// Status code denoting success
pub const STATUS_SUCCESS: u32 = 20_000_000;

/// Outbound message names
pub const START_TRANSCRIPTION: &str = "StartTranscription";
pub const STOP_TRANSCRIPTION: &str = "StopTranscription";

/// Inbound message names
pub const TRANSCRIPTION_STARTED: &str = "TranscriptionStarted";
pub const TRANSCRIPTION_RESULT_CHANGED: &str = "TranscriptionResultChanged";
pub const SENTENCE_END: &str = "SentenceEnd";
pub const TRANSCRIPTION_COMPLETED: &str = "TranscriptionCompleted";
pub const TASK_FAILED: &str = "TaskFailed";

/// Envelope header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

/// A protocol envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Parameters declared by `StartTranscription`
#[derive(Debug, Clone, Serialize)]
struct StartPayload {
    format: &'static str,
    sample_rate: u32,
    enable_intermediate_result: bool,
    enable_punctuation_prediction: bool,
    enable_inverse_text_normalization: bool,
}

/// Payload of result events
#[derive(Debug, Default, Deserialize)]
struct ResultPayload {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    result: String,
}

/// Generate a protocol id: 32 lowercase hex characters
#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Identity of one recognition conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    task_id: String,
    appkey: String,
    namespace: String,
}

impl Task {
    /// New conversation with a random task id
    #[must_use]
    pub fn new(appkey: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::with_id(new_id(), appkey, namespace)
    }

    /// Conversation with a task id chosen up front
    #[must_use]
    pub fn with_id(
        task_id: impl Into<String>,
        appkey: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            appkey: appkey.into(),
            namespace: namespace.into(),
        }
    }

    /// Correlation id shared by every message in the conversation
    #[must_use]
    pub fn id(&self) -> &str {
        &self.task_id
    }

    fn header(&self, name: &str) -> Header {
        Header {
            message_id: new_id(),
            task_id: self.task_id.clone(),
            namespace: self.namespace.clone(),
            name: name.to_string(),
            appkey: Some(self.appkey.clone()),
            status: None,
            status_text: None,
            status_message: None,
        }
    }

    /// `StartTranscription`: PCM at 16kHz with punctuation and partial results
    #[must_use]
    pub fn start_transcription(&self) -> Envelope {
        let payload = StartPayload {
            format: "PCM",
            sample_rate: SAMPLE_RATE,
            enable_intermediate_result: true,
            enable_punctuation_prediction: true,
            enable_inverse_text_normalization: true,
        };
        Envelope {
            header: self.header(START_TRANSCRIPTION),
            payload: serde_json::to_value(payload).ok(),
        }
    }

    /// `StopTranscription`
    #[must_use]
    pub fn stop_transcription(&self) -> Envelope {
        Envelope {
            header: self.header(STOP_TRANSCRIPTION),
            payload: None,
        }
    }
}

/// Event pushed by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Start handshake acknowledged
    Started,
    /// Intermediate hypothesis, subject to revision
    ResultChanged { index: Option<u32>, text: String },
    /// A finalized sentence
    SentenceEnd { index: Option<u32>, text: String },
    /// Server finished the conversation
    Completed,
    /// Non-success status
    Failed { code: u32, message: String },
    /// Anything else; carries the message name
    Other(String),
}

/// A decoded inbound envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub task_id: String,
    pub event: ServerEvent,
}

impl Envelope {
    /// Serialize for a text frame
    #[must_use]
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Interpret an inbound envelope
    ///
    /// Any non-success status wins over the message name.
    #[must_use]
    pub fn into_inbound(self) -> Inbound {
        let Self { header, payload } = self;

        let event = match header.status {
            Some(code) if code != STATUS_SUCCESS => ServerEvent::Failed {
                code,
                message: status_message(&header),
            },
            _ => match header.name.as_str() {
                TRANSCRIPTION_STARTED => ServerEvent::Started,
                TRANSCRIPTION_RESULT_CHANGED => {
                    let p = result_payload(payload);
                    ServerEvent::ResultChanged {
                        index: p.index,
                        text: p.result,
                    }
                }
                SENTENCE_END => {
                    let p = result_payload(payload);
                    ServerEvent::SentenceEnd {
                        index: p.index,
                        text: p.result,
                    }
                }
                TRANSCRIPTION_COMPLETED => ServerEvent::Completed,
                TASK_FAILED => ServerEvent::Failed {
                    code: header.status.unwrap_or_default(),
                    message: status_message(&header),
                },
                other => ServerEvent::Other(other.to_string()),
            },
        };

        Inbound {
            task_id: header.task_id,
            event,
        }
    }
}

fn status_message(header: &Header) -> String {
    header
        .status_text
        .clone()
        .or_else(|| header.status_message.clone())
        .unwrap_or_default()
}

fn result_payload(payload: Option<Value>) -> ResultPayload {
    payload
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// Decode a text frame from the server
///
/// # Errors
///
/// Returns `ProtocolError` with code 0 if the frame isn't a valid envelope
pub fn parse_server_message(text: &str) -> Result<Inbound, SpeechError> {
    serde_json::from_str::<Envelope>(text)
        .map(Envelope::into_inbound)
        .map_err(|e| SpeechError::ProtocolError {
            code: 0,
            message: format!("malformed server message: {e}"),
        })
}
