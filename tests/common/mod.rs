//! Shared test utilities: in-memory fakes for the socket, the microphone
//! and the token endpoint

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use kiddo_speech::asr::{Connector, Incoming, Status, StatusCallback, Transport};
use kiddo_speech::voice::{
    AudioFrame, AudioSource, AudioStream, AudioTap, CaptureConstraints, Microphone, TapSlot,
    TrackState,
};
use kiddo_speech::{Credential, CredentialProvider, Listener, SpeechConfig, SpeechError};

/// Something the session wrote to the socket
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text(Value),
    Binary(Vec<u8>),
    Closed,
}

impl Sent {
    /// Message name of a text frame
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Text(v) => v["header"]["name"].as_str(),
            _ => None,
        }
    }
}

/// Which writes never complete, like a peer that stopped reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stall {
    Nothing,
    Audio,
    /// Only the `StopTranscription` handshake
    Stop,
    Everything,
}

/// Session side of an in-memory socket
pub struct FakeTransport {
    inbound: mpsc::UnboundedReceiver<Incoming>,
    outbound: mpsc::UnboundedSender<Sent>,
    closes: Arc<AtomicUsize>,
    stall: Stall,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send_text(&mut self, text: String) -> Result<(), SpeechError> {
        let value: Value = serde_json::from_str(&text).expect("session sent invalid json");
        let stop = value["header"]["name"] == "StopTranscription";
        if self.stall == Stall::Everything || (self.stall == Stall::Stop && stop) {
            std::future::pending::<()>().await;
        }
        let _ = self.outbound.send(Sent::Text(value));
        Ok(())
    }

    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), SpeechError> {
        if matches!(self.stall, Stall::Audio | Stall::Everything) {
            std::future::pending::<()>().await;
        }
        let _ = self.outbound.send(Sent::Binary(bytes));
        Ok(())
    }

    async fn recv(&mut self) -> Result<Incoming, SpeechError> {
        match self.inbound.recv().await {
            Some(incoming) => Ok(incoming),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let _ = self.outbound.send(Sent::Closed);
    }
}

/// Test side of an in-memory socket
pub struct FakeServer {
    inbound: mpsc::UnboundedSender<Incoming>,
    outbound: mpsc::UnboundedReceiver<Sent>,
    closes: Arc<AtomicUsize>,
}

impl FakeServer {
    /// Push an event to the session
    pub fn push(&self, incoming: Incoming) {
        let _ = self.inbound.send(incoming);
    }

    /// Push a successful server event for `task_id`
    pub fn event(&self, task_id: &str, name: &str, payload: Option<Value>) {
        self.push(envelope(task_id, name, 20_000_000, payload));
    }

    /// Next thing the session wrote
    pub async fn next_sent(&mut self) -> Sent {
        self.outbound.recv().await.expect("session side dropped")
    }

    /// Next text frame, which must carry `name`
    pub async fn expect_text(&mut self, name: &str) -> Value {
        match self.next_sent().await {
            Sent::Text(value) => {
                assert_eq!(value["header"]["name"], name, "unexpected message {value}");
                value
            }
            other => panic!("expected {name}, got {other:?}"),
        }
    }

    /// Everything written so far that hasn't been read
    pub fn drain(&mut self) -> Vec<Sent> {
        let mut sent = Vec::new();
        while let Ok(item) = self.outbound.try_recv() {
            sent.push(item);
        }
        sent
    }

    /// How many times the session closed the socket
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Connected pair of socket ends
pub fn socket_pair() -> (FakeTransport, FakeServer) {
    stalled_socket_pair(Stall::Nothing)
}

/// Socket pair whose session side blocks on the given writes
pub fn stalled_socket_pair(stall: Stall) -> (FakeTransport, FakeServer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let closes = Arc::new(AtomicUsize::new(0));
    (
        FakeTransport {
            inbound: in_rx,
            outbound: out_tx,
            closes: Arc::clone(&closes),
            stall,
        },
        FakeServer {
            inbound: in_tx,
            outbound: out_rx,
            closes,
        },
    )
}

/// Text frame envelope
pub fn envelope(task_id: &str, name: &str, status: u32, payload: Option<Value>) -> Incoming {
    let mut message = json!({
        "header": {
            "namespace": "SpeechTranscriber",
            "name": name,
            "status": status,
            "message_id": "0123456789abcdef0123456789abcdef",
            "task_id": task_id,
            "status_text": "Gateway:SUCCESS:Success.",
        }
    });
    if let Some(payload) = payload {
        message["payload"] = payload;
    }
    Incoming::Text(message.to_string())
}

/// Payload of a result event
pub fn result(index: u32, text: &str) -> Option<Value> {
    Some(json!({ "index": index, "time": 1000, "result": text, "confidence": 0.9 }))
}

/// How the fake connector behaves
enum ConnectBehavior {
    Ready(Mutex<Option<FakeTransport>>),
    Hang,
    Fail(SpeechError),
}

/// Hands out one prepared socket
pub struct FakeConnector {
    behavior: ConnectBehavior,
    urls: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn ready(transport: FakeTransport) -> Self {
        Self::with(ConnectBehavior::Ready(Mutex::new(Some(transport))))
    }

    pub fn hanging() -> Self {
        Self::with(ConnectBehavior::Hang)
    }

    pub fn failing(err: SpeechError) -> Self {
        Self::with(ConnectBehavior::Fail(err))
    }

    fn with(behavior: ConnectBehavior) -> Self {
        Self {
            behavior,
            urls: Mutex::new(Vec::new()),
        }
    }

    /// URLs passed to `connect`
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, SpeechError> {
        self.urls.lock().unwrap().push(url.to_string());
        match &self.behavior {
            ConnectBehavior::Ready(slot) => {
                let transport = slot
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| SpeechError::TransportError("already used".to_string()))?;
                Ok(Box::new(transport))
            }
            ConnectBehavior::Hang => std::future::pending().await,
            ConnectBehavior::Fail(err) => Err(err.clone()),
        }
    }
}

/// Credential provider with a canned answer
pub enum StaticCredentials {
    Ok,
    Fail,
    Hang,
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn fetch(&self) -> Result<Credential, SpeechError> {
        match self {
            Self::Ok => Ok(Credential::new("test-token", "test-app")),
            Self::Fail => Err(SpeechError::CredentialUnavailable(
                "token endpoint returned 500".to_string(),
            )),
            Self::Hang => std::future::pending().await,
        }
    }
}

/// Microphone stream fed by the test
#[derive(Default)]
pub struct FakeStream {
    slot: TapSlot,
    dead: AtomicBool,
    stops: AtomicUsize,
    tracks: Option<Vec<TrackState>>,
}

impl FakeStream {
    /// Active stream reporting fixed track states
    pub fn with_tracks(tracks: Vec<TrackState>) -> Self {
        Self {
            tracks: Some(tracks),
            ..Self::default()
        }
    }

    /// Deliver mono samples to the attached tap
    pub fn publish(&self, samples: Vec<f32>, sample_rate: u32) -> bool {
        self.slot.publish(AudioFrame {
            samples,
            sample_rate,
        })
    }

    pub fn is_tapped(&self) -> bool {
        self.slot.is_attached()
    }

    /// Simulate the track ending, e.g. the device being unplugged
    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl AudioStream for FakeStream {
    fn is_active(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }

    fn track_states(&self) -> Vec<TrackState> {
        if let Some(tracks) = &self.tracks {
            return tracks.clone();
        }
        if self.dead.load(Ordering::SeqCst) {
            vec![TrackState::Ended]
        } else {
            vec![TrackState::Live]
        }
    }

    fn tap(&self) -> Result<AudioTap, SpeechError> {
        self.slot.attach()
    }

    fn stop(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.slot.close();
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Capture capability that records every hardware request
#[derive(Clone, Default)]
pub struct FakeSource {
    inner: Arc<FakeSourceInner>,
}

#[derive(Default)]
struct FakeSourceInner {
    requests: Mutex<Vec<CaptureConstraints>>,
    streams: Mutex<Vec<Arc<FakeStream>>>,
    reject_strict: AtomicBool,
    deny: AtomicBool,
}

impl FakeSource {
    /// Source whose hardware can't meet the speech constraints
    pub fn strict_unsupported() -> Self {
        let source = Self::default();
        source.inner.reject_strict.store(true, Ordering::SeqCst);
        source
    }

    /// Source that refuses permission
    pub fn denied() -> Self {
        let source = Self::default();
        source.inner.deny.store(true, Ordering::SeqCst);
        source
    }

    pub fn requests(&self) -> Vec<CaptureConstraints> {
        self.inner.requests.lock().unwrap().clone()
    }

    /// Most recently opened stream
    pub fn last_stream(&self) -> Arc<FakeStream> {
        self.inner
            .streams
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no stream opened")
    }
}

impl AudioSource for FakeSource {
    fn request(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Arc<dyn AudioStream>, SpeechError> {
        self.inner.requests.lock().unwrap().push(*constraints);

        if self.inner.deny.load(Ordering::SeqCst) {
            return Err(SpeechError::MicrophoneUnavailable(
                "permission denied".to_string(),
            ));
        }
        if self.inner.reject_strict.load(Ordering::SeqCst) && constraints.channels.is_some() {
            return Err(SpeechError::MicrophoneConstraintError(
                "no mono 16 kHz input".to_string(),
            ));
        }

        let stream = Arc::new(FakeStream::default());
        self.inner.streams.lock().unwrap().push(Arc::clone(&stream));
        Ok(stream)
    }
}

/// Config pointing at hosts that never resolve
pub fn test_config() -> SpeechConfig {
    SpeechConfig {
        token_url: "http://token.test/api/token".to_string(),
        asr_url: "wss://asr.test/ws/v1".to_string(),
        ..SpeechConfig::default()
    }
}

/// A listener over fakes with the microphone already acquired
pub struct Harness {
    pub listener: Listener,
    pub source: FakeSource,
    pub stream: Arc<FakeStream>,
    pub connector: Arc<FakeConnector>,
    pub statuses: Arc<Mutex<Vec<Status>>>,
}

impl Harness {
    pub fn new(credentials: StaticCredentials, connector: FakeConnector) -> Self {
        Self::with_config(test_config(), credentials, connector)
    }

    pub fn with_config(
        config: SpeechConfig,
        credentials: StaticCredentials,
        connector: FakeConnector,
    ) -> Self {
        let source = FakeSource::default();
        let microphone = Arc::new(Microphone::new(source.clone()));
        let connector = Arc::new(connector);
        let listener = Listener::new(
            config,
            Arc::new(credentials),
            Arc::clone(&connector) as Arc<dyn Connector>,
            microphone,
        );
        listener.ensure_microphone().expect("fake microphone");
        let stream = source.last_stream();

        Self {
            listener,
            source,
            stream,
            connector,
            statuses: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Callback recording every status update
    pub fn recorder(&self) -> StatusCallback {
        let statuses = Arc::clone(&self.statuses);
        Arc::new(move |status| statuses.lock().unwrap().push(status))
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.statuses.lock().unwrap().clone()
    }

    /// Yield until the session has attached to the microphone
    pub async fn wait_tapped(&self) {
        for _ in 0..1000 {
            if self.stream.is_tapped() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("session never attached to the microphone");
    }
}

/// `n` samples of a constant level
pub fn tone(n: usize, level: f32) -> Vec<f32> {
    vec![level; n]
}

/// 100 ms at 16 kHz
pub const CHUNK_SAMPLES: usize = 1600;

/// Short pause that lets spawned tasks run under a paused clock
pub async fn settle_tasks() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}
