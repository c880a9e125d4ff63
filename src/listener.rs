//! Public start/stop API for scored listening attempts
//!
//! A [`Listener`] owns the collaborators shared by every attempt (the
//! credential provider, the socket connector and the process-wide
//! microphone). Each [`Listener::start_attempt`] spawns one protocol session
//! and hands back an [`Attempt`] whose settlement can be awaited or forced.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use crate::SpeechError;
use crate::asr::protocol::new_id;
use crate::asr::{
    self, Command, Connector, SessionContext, Settlement, Status, StatusCallback, WsConnector,
};
use crate::config::SpeechConfig;
use crate::credential::{CredentialProvider, HttpCredentialProvider};
use crate::voice::{AudioStream, Microphone};

/// Entry point for recognition attempts
pub struct Listener {
    config: SpeechConfig,
    credentials: Arc<dyn CredentialProvider>,
    connector: Arc<dyn Connector>,
    microphone: Arc<Microphone>,
}

impl Listener {
    /// Listener over explicit collaborators
    #[must_use]
    pub fn new(
        config: SpeechConfig,
        credentials: Arc<dyn CredentialProvider>,
        connector: Arc<dyn Connector>,
        microphone: Arc<Microphone>,
    ) -> Self {
        Self {
            config,
            credentials,
            connector,
            microphone,
        }
    }

    /// Listener using the HTTP token endpoint, a real WebSocket and the
    /// system microphone
    #[must_use]
    pub fn from_config(config: SpeechConfig) -> Self {
        let credentials = Arc::new(HttpCredentialProvider::new(
            config.token_url.clone(),
            config.http_timeout,
        ));
        Self::new(
            config,
            credentials,
            Arc::new(WsConnector),
            Arc::new(Microphone::system()),
        )
    }

    /// Session configuration
    #[must_use]
    pub const fn config(&self) -> &SpeechConfig {
        &self.config
    }

    /// Shared microphone handle
    #[must_use]
    pub fn microphone(&self) -> &Arc<Microphone> {
        &self.microphone
    }

    /// Acquire the microphone; call once at startup, before any attempt
    ///
    /// # Errors
    ///
    /// Returns the capture error if no stream can be opened
    pub fn ensure_microphone(&self) -> Result<Arc<dyn AudioStream>, SpeechError> {
        self.microphone.ensure_stream()
    }

    /// Release the microphone at teardown
    pub fn release_microphone(&self) {
        self.microphone.release_stream();
    }

    /// Begin one listening attempt
    ///
    /// Never touches the microphone hardware: if no live stream was acquired
    /// with [`Listener::ensure_microphone`] the attempt is returned already
    /// settled with `MicrophoneNotInitialized`. Must be called within a
    /// tokio runtime.
    #[must_use]
    pub fn start_attempt(
        &self,
        expected: Option<String>,
        on_status: Option<StatusCallback>,
    ) -> Attempt {
        let task_id = new_id();
        let (commands, command_rx) = mpsc::channel(1);

        let stream = match self.microphone.get_stream() {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "attempt rejected");
                if let Some(callback) = &on_status {
                    callback(Status::Failed(e.status_text()));
                }
                let (_, settled) = watch::channel(Some(Err(e)));
                return Attempt {
                    task_id,
                    commands,
                    settled,
                };
            }
        };

        let ctx = SessionContext {
            config: self.config.clone(),
            task_id: task_id.clone(),
            credentials: Arc::clone(&self.credentials),
            connector: Arc::clone(&self.connector),
            stream,
            expected,
            on_status,
        };

        let (tx, settled) = watch::channel(None);
        let span = tracing::info_span!("attempt", task_id = %task_id);
        tokio::spawn(
            async move {
                let settlement = asr::run(ctx, command_rx).await;
                tx.send_replace(Some(settlement));
            }
            .instrument(span),
        );

        Attempt {
            task_id,
            commands,
            settled,
        }
    }
}

/// Handle to one running attempt
#[derive(Clone)]
pub struct Attempt {
    task_id: String,
    commands: mpsc::Sender<Command>,
    settled: watch::Receiver<Option<Settlement>>,
}

impl Attempt {
    /// Task id stamped on every protocol message of this attempt
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Settlement if the attempt has already finished
    #[must_use]
    pub fn try_result(&self) -> Option<Settlement> {
        self.settled.borrow().clone()
    }

    /// Wait for the attempt to settle
    ///
    /// # Errors
    ///
    /// Returns the attempt's error; `TransportError` if the session task
    /// died without settling
    pub async fn wait(&self) -> Settlement {
        let mut settled = self.settled.clone();
        settled
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|value| (*value).clone())
            .unwrap_or_else(|| {
                Err(SpeechError::TransportError(
                    "session ended without settling".to_string(),
                ))
            })
    }

    /// Ask the attempt to finish, then wait for its settlement
    ///
    /// After settlement this returns the settled result again.
    ///
    /// # Errors
    ///
    /// Same as [`Attempt::wait`]
    pub async fn stop(&self) -> Settlement {
        if self.commands.try_send(Command::Stop).is_err() {
            tracing::debug!(task_id = %self.task_id, "stop already requested or attempt settled");
        }
        self.wait().await
    }
}
