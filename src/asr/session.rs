//! Protocol session: one recognition conversation over one socket
//!
//! ```text
//! Connecting ──TranscriptionStarted──▶ Started ──first frame──▶ Streaming
//!     │                                   │                        │
//!     │                              stop / timeout / early match  │
//!     │                                   ▼                        ▼
//!     └────────── error ───────────▶  Stopping ──Completed──▶ Settled
//! ```
//!
//! The whole conversation runs in one task with a single exit point, so the
//! tap is dropped and the socket closed exactly once no matter which event
//! ended it. Only one deadline is armed at a time and it is reset on every
//! transition; it dies with the task. Socket writes race the same deadline
//! and stop requests, so a peer that stops reading cannot hold the session.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};

use super::protocol::{self, Inbound, ServerEvent, Task};
use super::transport::{Connector, Incoming, Transport, socket_url};
use crate::SpeechError;
use crate::config::SpeechConfig;
use crate::credential::CredentialProvider;
use crate::voice::{
    AudioFrame, AudioStream, AudioTap, PcmChunker, contains_expected, encode_pcm16, is_usable,
    matches, resample,
};

/// Where a session is in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket open, waiting for `TranscriptionStarted`
    Connecting,
    /// Server acknowledged; tap attached, no audio yet
    Started,
    /// Audio frames flowing
    Streaming,
    /// `StopTranscription` sent, draining final results
    Stopping,
    /// Finished; nothing else happens
    Settled,
}

/// Advisory progress for the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    FetchingCredential,
    Connecting,
    Listening,
    Stopping,
    Finished,
    /// Carries the user-facing status text of the error
    Failed(&'static str),
}

impl Status {
    /// Short label for display
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::FetchingCredential => "signing in",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Stopping => "finishing",
            Self::Finished => "done",
            Self::Failed(text) => *text,
        }
    }
}

/// Progress callback
pub type StatusCallback = Arc<dyn Fn(Status) + Send + Sync>;

/// Client requests into a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Finish the attempt with whatever has been recognized
    Stop,
}

/// Result of a successful attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    /// Joined final sentences, or the expected text after an early match
    pub text: String,
    /// Hypothesis that triggered an early match
    pub heard: Option<String>,
    /// Settled on a partial match before the server finished
    pub early_exit: bool,
    /// Ended by the attempt deadline
    pub timed_out: bool,
    /// Time since the attempt started
    pub elapsed: Duration,
    /// `matches(text, expected)` when an expected string was supplied
    pub passed: Option<bool>,
}

/// How an attempt settles
pub type Settlement = Result<Transcript, SpeechError>;

/// Everything one attempt needs
pub struct SessionContext {
    pub config: SpeechConfig,
    pub task_id: String,
    pub credentials: Arc<dyn CredentialProvider>,
    pub connector: Arc<dyn Connector>,
    pub stream: Arc<dyn AudioStream>,
    pub expected: Option<String>,
    pub on_status: Option<StatusCallback>,
}

/// Non-error ways a conversation ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    /// Server completed, or the stop drain ran out
    Completed,
    /// Partial hypothesis contained the expected text
    EarlyExit,
    /// Stopped before the server acknowledged start
    Cancelled,
}

/// Next step of the event loop
enum Step {
    Continue,
    Settle(Result<Ending, SpeechError>),
}

/// Run one attempt to settlement
///
/// Fetches the credential, opens the socket, then hands over to the
/// conversation loop. Every exit, including stop and timeouts before the
/// socket exists, produces exactly one settlement.
pub async fn run(ctx: SessionContext, mut commands: mpsc::Receiver<Command>) -> Settlement {
    let started = Instant::now();
    let attempt_deadline = started + ctx.config.attempt_timeout;
    let report = Reporter(ctx.on_status.clone());

    let expected = ctx.expected.as_deref();
    report.emit(Status::FetchingCredential);
    let credential = tokio::select! {
        result = ctx.credentials.fetch() => match result {
            Ok(credential) => credential,
            Err(e) => return settle_early(&report, Err(e)),
        },
        _ = commands.recv() => {
            return settle_early(&report, Ok(idle_transcript(started, false, expected)));
        }
        () = tokio::time::sleep_until(attempt_deadline) => {
            return settle_early(&report, Ok(idle_transcript(started, true, expected)));
        }
    };

    let url = match socket_url(&ctx.config.asr_url, &credential) {
        Ok(url) => url,
        Err(e) => return settle_early(&report, Err(e)),
    };

    report.emit(Status::Connecting);
    let connect_deadline = (Instant::now() + ctx.config.connect_timeout).min(attempt_deadline);
    let transport = tokio::select! {
        result = ctx.connector.connect(&url) => match result {
            Ok(transport) => transport,
            Err(e) => return settle_early(&report, Err(e)),
        },
        _ = commands.recv() => {
            return settle_early(&report, Ok(idle_transcript(started, false, expected)));
        }
        () = tokio::time::sleep_until(connect_deadline) => {
            return settle_early(&report, Err(connection_timeout(&ctx.config)));
        }
    };

    let task = Task::with_id(
        ctx.task_id,
        credential.application_key(),
        ctx.config.namespace.clone(),
    );

    let session = Session {
        chunker: PcmChunker::new(ctx.config.chunk),
        deadline: Box::pin(tokio::time::sleep_until(connect_deadline)),
        config: ctx.config,
        task,
        transport,
        commands,
        stream: ctx.stream,
        tap: None,
        state: SessionState::Connecting,
        fragments: Vec::new(),
        expected: ctx.expected.filter(|e| !e.trim().is_empty()),
        heard: None,
        timed_out: false,
        started,
        attempt_deadline,
        frames_sent: 0,
        report,
    };

    session.drive().await
}

/// Outbound socket frame
enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Why an outbound write did not complete
#[derive(Debug)]
enum WriteFailure {
    Failed(SpeechError),
    /// The armed deadline passed while the write was pending
    Stalled,
    /// A stop command arrived while the write was pending
    Stopped,
}

/// A connected conversation
struct Session {
    config: SpeechConfig,
    task: Task,
    transport: Box<dyn Transport>,
    commands: mpsc::Receiver<Command>,
    stream: Arc<dyn AudioStream>,
    tap: Option<AudioTap>,
    chunker: PcmChunker,
    state: SessionState,
    fragments: Vec<String>,
    expected: Option<String>,
    heard: Option<String>,
    timed_out: bool,
    started: Instant,
    attempt_deadline: Instant,
    deadline: Pin<Box<Sleep>>,
    frames_sent: u64,
    report: Reporter,
}

impl Session {
    /// Send the start handshake, run the loop, and clean up once
    async fn drive(mut self) -> Settlement {
        tracing::debug!(task_id = %self.task.id(), "sending start handshake");
        let start = self.task.start_transcription().to_text();
        let outcome = match self.write(Outbound::Text(start)).await {
            Ok(()) => self.event_loop().await,
            Err(failure) => match self.on_write_failure(failure).await {
                Step::Settle(outcome) => outcome,
                Step::Continue => self.event_loop().await,
            },
        };
        self.finish(outcome).await
    }

    async fn event_loop(&mut self) -> Result<Ending, SpeechError> {
        loop {
            let step = tokio::select! {
                biased;

                () = &mut self.deadline => self.on_deadline().await,

                _ = self.commands.recv(), if self.state != SessionState::Stopping => {
                    tracing::debug!(state = ?self.state, "stop requested");
                    self.begin_stop().await
                }

                incoming = self.transport.recv() => match incoming {
                    Ok(incoming) => self.on_incoming(incoming).await,
                    Err(e) => Step::Settle(Err(e)),
                },

                frame = next_frame(&mut self.tap) => match frame {
                    Some(frame) => self.on_frame(frame).await,
                    None => Step::Settle(Err(SpeechError::MicrophoneUnavailable(
                        "capture stream ended".to_string(),
                    ))),
                },
            };

            if let Step::Settle(outcome) = step {
                return outcome;
            }
        }
    }

    /// Write one frame, racing the armed deadline and stop requests
    ///
    /// A pending write is abandoned when either fires first.
    async fn write(&mut self, frame: Outbound) -> Result<(), WriteFailure> {
        let deadline = self.deadline.deadline();
        let send = match frame {
            Outbound::Text(text) => self.transport.send_text(text),
            Outbound::Binary(bytes) => self.transport.send_binary(bytes),
        };

        tokio::select! {
            biased;

            result = tokio::time::timeout_at(deadline, send) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(WriteFailure::Failed(e)),
                Err(_) => Err(WriteFailure::Stalled),
            },

            _ = self.commands.recv(), if self.state != SessionState::Stopping => {
                Err(WriteFailure::Stopped)
            }
        }
    }

    async fn on_write_failure(&mut self, failure: WriteFailure) -> Step {
        match failure {
            WriteFailure::Failed(e) => Step::Settle(Err(e)),
            WriteFailure::Stalled => {
                tracing::debug!(state = ?self.state, "socket write stalled past deadline");
                self.on_deadline().await
            }
            WriteFailure::Stopped => {
                tracing::debug!(state = ?self.state, "stop requested during socket write");
                self.begin_stop().await
            }
        }
    }

    async fn on_deadline(&mut self) -> Step {
        match self.state {
            SessionState::Connecting => {
                Step::Settle(Err(connection_timeout(&self.config)))
            }
            SessionState::Started | SessionState::Streaming => {
                tracing::debug!("attempt deadline reached");
                self.timed_out = true;
                self.begin_stop().await
            }
            SessionState::Stopping | SessionState::Settled => {
                tracing::debug!("stop drain elapsed");
                Step::Settle(Ok(Ending::Completed))
            }
        }
    }

    async fn on_incoming(&mut self, incoming: Incoming) -> Step {
        let text = match incoming {
            Incoming::Text(text) => text,
            Incoming::Closed { clean: true, .. } if self.state != SessionState::Connecting => {
                tracing::debug!(state = ?self.state, "socket closed by server");
                return Step::Settle(Ok(Ending::Completed));
            }
            Incoming::Closed { reason, .. } => {
                return Step::Settle(Err(SpeechError::TransportError(format!(
                    "socket closed before completion: {reason}"
                ))));
            }
        };

        let Inbound { task_id, event } = match protocol::parse_server_message(&text) {
            Ok(inbound) => inbound,
            Err(e) => return Step::Settle(Err(e)),
        };

        if !task_id.is_empty() && task_id != self.task.id() {
            tracing::debug!(task_id = %task_id, "ignoring message for another task");
            return Step::Continue;
        }

        match event {
            ServerEvent::Failed { code, message } => {
                Step::Settle(Err(SpeechError::ProtocolError { code, message }))
            }
            ServerEvent::Started if self.state == SessionState::Connecting => self.on_started(),
            ServerEvent::ResultChanged { text, .. } => self.on_partial(text).await,
            ServerEvent::SentenceEnd { index, text } if self.state != SessionState::Connecting => {
                tracing::debug!(index = ?index, text = %text, "sentence finalized");
                self.fragments.push(text);
                Step::Continue
            }
            ServerEvent::Completed => Step::Settle(Ok(Ending::Completed)),
            other => {
                tracing::trace!(event = ?other, state = ?self.state, "ignoring event");
                Step::Continue
            }
        }
    }

    /// Start acknowledged: attach to the microphone
    fn on_started(&mut self) -> Step {
        self.state = SessionState::Started;
        self.arm(self.attempt_deadline);

        if !is_usable(&*self.stream) {
            return Step::Settle(Err(SpeechError::MicrophoneUnavailable(
                "capture stream is no longer live".to_string(),
            )));
        }

        match self.stream.tap() {
            Ok(tap) => {
                self.tap = Some(tap);
                tracing::debug!("transcription started, streaming audio");
                self.report.emit(Status::Listening);
                Step::Continue
            }
            Err(e) => Step::Settle(Err(e)),
        }
    }

    async fn on_partial(&mut self, hypothesis: String) -> Step {
        if !matches!(self.state, SessionState::Started | SessionState::Streaming) {
            return Step::Continue;
        }

        tracing::trace!(hypothesis = %hypothesis, "partial result");
        let hit = self
            .expected
            .as_deref()
            .is_some_and(|expected| contains_expected(&hypothesis, expected));
        if !hit {
            return Step::Continue;
        }

        tracing::debug!(hypothesis = %hypothesis, "partial result matched expected text");
        self.tap = None;
        self.state = SessionState::Stopping;
        self.heard = Some(hypothesis);
        self.arm(Instant::now() + self.config.stop_grace);
        if let Err(failure) = self.send_stop().await {
            tracing::warn!(error = ?failure, "failed to send stop after early match");
        }
        Step::Settle(Ok(Ending::EarlyExit))
    }

    async fn on_frame(&mut self, frame: AudioFrame) -> Step {
        match self.state {
            SessionState::Started => self.state = SessionState::Streaming,
            SessionState::Streaming => {}
            _ => return Step::Continue,
        }

        let pcm = encode_pcm16(&resample(&frame.samples, frame.sample_rate));
        for chunk in self.chunker.push(&pcm) {
            if let Err(failure) = self.send_audio(chunk).await {
                return self.on_write_failure(failure).await;
            }
        }
        Step::Continue
    }

    /// Detach from the microphone, then send the stop handshake
    ///
    /// The stop drain is armed before anything is written, so a stalled
    /// socket costs at most the grace period.
    async fn begin_stop(&mut self) -> Step {
        match self.state {
            SessionState::Connecting => Step::Settle(Ok(Ending::Cancelled)),
            SessionState::Started | SessionState::Streaming => {
                self.tap = None;
                self.state = SessionState::Stopping;
                self.report.emit(Status::Stopping);
                self.arm(Instant::now() + self.config.stop_grace);

                let mut sent = match self.chunker.flush() {
                    Some(rest) => self.send_audio(rest).await,
                    None => Ok(()),
                };
                if sent.is_ok() {
                    sent = self.send_stop().await;
                }

                match sent {
                    Ok(()) => Step::Continue,
                    Err(WriteFailure::Failed(e)) => Step::Settle(Err(e)),
                    Err(WriteFailure::Stalled | WriteFailure::Stopped) => {
                        tracing::debug!("socket write stalled during stop drain");
                        Step::Settle(Ok(Ending::Completed))
                    }
                }
            }
            SessionState::Stopping | SessionState::Settled => Step::Continue,
        }
    }

    fn arm(&mut self, at: Instant) {
        self.deadline.as_mut().reset(at);
    }

    async fn send_audio(&mut self, chunk: Vec<u8>) -> Result<(), WriteFailure> {
        let bytes = chunk.len();
        self.write(Outbound::Binary(chunk)).await?;
        self.frames_sent += 1;
        tracing::trace!(bytes, frames = self.frames_sent, "audio frame sent");
        Ok(())
    }

    async fn send_stop(&mut self) -> Result<(), WriteFailure> {
        tracing::debug!(frames = self.frames_sent, "sending stop handshake");
        let stop = self.task.stop_transcription().to_text();
        self.write(Outbound::Text(stop)).await
    }

    /// The single exit: release the tap and socket, then build the result
    async fn finish(mut self, outcome: Result<Ending, SpeechError>) -> Settlement {
        self.state = SessionState::Settled;
        self.tap = None;
        if tokio::time::timeout(self.config.stop_grace, self.transport.close())
            .await
            .is_err()
        {
            tracing::debug!("socket close did not finish within grace period");
        }

        let settlement = outcome.map(|ending| {
            let early_exit = ending == Ending::EarlyExit;
            let text = match (&self.expected, early_exit) {
                (Some(expected), true) => expected.clone(),
                _ => self.fragments.concat(),
            };
            let passed = self
                .expected
                .as_deref()
                .map(|expected| early_exit || matches(&text, expected));

            Transcript {
                text,
                heard: self.heard.take(),
                early_exit,
                timed_out: self.timed_out,
                elapsed: self.started.elapsed(),
                passed,
            }
        });

        if let Ok(transcript) = &settlement {
            tracing::info!(
                frames = self.frames_sent,
                early_exit = transcript.early_exit,
                timed_out = transcript.timed_out,
                elapsed_ms = u64::try_from(transcript.elapsed.as_millis()).unwrap_or(u64::MAX),
                "recognition settled"
            );
        }
        self.report.settled(&settlement);
        settlement
    }
}

/// Wait for the next captured frame; never resolves without a tap
async fn next_frame(tap: &mut Option<AudioTap>) -> Option<AudioFrame> {
    match tap {
        Some(tap) => tap.recv().await,
        None => std::future::pending().await,
    }
}

fn connection_timeout(config: &SpeechConfig) -> SpeechError {
    SpeechError::ConnectionTimeout(
        u64::try_from(config.connect_timeout.as_millis()).unwrap_or(u64::MAX),
    )
}

/// Transcript for an attempt that ended before any audio was recognized
fn idle_transcript(started: Instant, timed_out: bool, expected: Option<&str>) -> Transcript {
    Transcript {
        text: String::new(),
        heard: None,
        early_exit: false,
        timed_out,
        elapsed: started.elapsed(),
        passed: expected.map(|_| false),
    }
}

fn settle_early(report: &Reporter, settlement: Settlement) -> Settlement {
    report.settled(&settlement);
    settlement
}

/// Forwards progress to the optional callback and logs settlements
#[derive(Clone)]
struct Reporter(Option<StatusCallback>);

impl Reporter {
    fn emit(&self, status: Status) {
        tracing::debug!(status = status.label(), "status");
        if let Some(callback) = &self.0 {
            callback(status);
        }
    }

    fn settled(&self, settlement: &Settlement) {
        match settlement {
            Ok(_) => self.emit(Status::Finished),
            Err(e) => {
                tracing::warn!(error = %e, "recognition failed");
                self.emit(Status::Failed(e.status_text()));
            }
        }
    }
}
