//! End-to-end tests against a local mock token endpoint and ASR socket

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use serde_json::{Value, json};

use kiddo_speech::asr::WsConnector;
use kiddo_speech::voice::Microphone;
use kiddo_speech::{
    CredentialProvider, HttpCredentialProvider, Listener, SpeechConfig, SpeechError,
};

mod common;
use common::{CHUNK_SAMPLES, FakeSource, tone};

const GOOD_TOKEN: &str = "good-token";

#[derive(Default)]
struct MockAsr {
    audio_bytes: AtomicUsize,
    stops: AtomicUsize,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn server_event(task_id: &str, name: &str, payload: Option<Value>) -> Message {
    let mut message = json!({
        "header": {
            "namespace": "SpeechTranscriber",
            "name": name,
            "status": 20_000_000,
            "message_id": "00000000000000000000000000000000",
            "task_id": task_id,
            "status_text": "Gateway:SUCCESS:Success.",
        }
    });
    if let Some(payload) = payload {
        message["payload"] = payload;
    }
    Message::Text(message.to_string().into())
}

async fn asr_socket(
    ws: WebSocketUpgrade,
    Query(query): Query<TokenQuery>,
    State(state): State<Arc<MockAsr>>,
) -> Response {
    if query.token.as_deref() != Some(GOOD_TOKEN) {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| serve_asr(socket, state))
}

/// Acknowledges start, counts audio, answers stop with one sentence
async fn serve_asr(mut socket: WebSocket, state: Arc<MockAsr>) {
    let mut task_id = String::new();

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) => {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                let name = value["header"]["name"].as_str().unwrap_or_default();
                match name {
                    "StartTranscription" => {
                        task_id = value["header"]["task_id"].as_str().unwrap().to_string();
                        let _ = socket
                            .send(server_event(&task_id, "TranscriptionStarted", None))
                            .await;
                    }
                    "StopTranscription" => {
                        state.stops.fetch_add(1, Ordering::SeqCst);
                        let sentence = json!({ "index": 1, "result": "Hello world." });
                        let _ = socket
                            .send(server_event(&task_id, "SentenceEnd", Some(sentence)))
                            .await;
                        let _ = socket
                            .send(server_event(&task_id, "TranscriptionCompleted", None))
                            .await;
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::NORMAL,
                                reason: "".into(),
                            })))
                            .await;
                        return;
                    }
                    _ => {}
                }
            }
            Message::Binary(bytes) => {
                state.audio_bytes.fetch_add(bytes.len(), Ordering::SeqCst);
            }
            Message::Close(_) => return,
            _ => {}
        }
    }
}

async fn token() -> impl IntoResponse {
    axum::Json(json!({ "token": GOOD_TOKEN, "appkey": "test-app", "expire_time": 1_900_000_000 }))
}

async fn stale_token() -> impl IntoResponse {
    axum::Json(json!({ "token": "expired", "appkey": "test-app" }))
}

async fn broken_token() -> impl IntoResponse {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(json!({ "error": "access key not configured" })),
    )
}

async fn partial_token() -> impl IntoResponse {
    axum::Json(json!({ "token": GOOD_TOKEN }))
}

/// Start the mock services, returning their base address
async fn spawn_mock() -> (String, Arc<MockAsr>) {
    let state = Arc::new(MockAsr::default());
    let app = Router::new()
        .route("/ws/v1", get(asr_socket))
        .route("/api/token", get(token))
        .route("/api/stale-token", get(stale_token))
        .route("/api/broken-token", get(broken_token))
        .route("/api/partial-token", get(partial_token))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr.to_string(), state)
}

fn listener_for(base: &str, token_path: &str) -> (Listener, FakeSource) {
    let config = SpeechConfig {
        token_url: format!("http://{base}{token_path}"),
        asr_url: format!("ws://{base}/ws/v1"),
        ..SpeechConfig::default()
    };
    let credentials = Arc::new(HttpCredentialProvider::new(
        config.token_url.clone(),
        config.http_timeout,
    ));
    let source = FakeSource::default();
    let listener = Listener::new(
        config,
        credentials,
        Arc::new(WsConnector),
        Arc::new(Microphone::new(source.clone())),
    );
    listener.ensure_microphone().unwrap();
    (listener, source)
}

#[tokio::test]
async fn test_full_attempt_over_websocket() {
    let (base, state) = spawn_mock().await;
    let (listener, source) = listener_for(&base, "/api/token");
    let stream = source.last_stream();

    let attempt = listener.start_attempt(Some("hello world".to_string()), None);

    let mut attached = false;
    for _ in 0..200 {
        if stream.is_tapped() {
            attached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(attached, "session never started streaming");

    assert!(stream.publish(tone(CHUNK_SAMPLES * 2, 0.1), 16_000));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let transcript = attempt.stop().await.unwrap();
    assert_eq!(transcript.text, "Hello world.");
    assert_eq!(transcript.passed, Some(true));
    assert!(!transcript.early_exit);
    assert_eq!(state.audio_bytes.load(Ordering::SeqCst), CHUNK_SAMPLES * 4);
    assert_eq!(state.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejected_token_needs_reauth() {
    let (base, _state) = spawn_mock().await;
    let (listener, _source) = listener_for(&base, "/api/stale-token");

    let err = listener.start_attempt(None, None).wait().await.unwrap_err();
    assert!(matches!(err, SpeechError::ProtocolError { code: 40_000_001, .. }));
    assert!(err.needs_reauth());
}

#[tokio::test]
async fn test_token_endpoint_success() {
    let (base, _state) = spawn_mock().await;
    let provider =
        HttpCredentialProvider::new(format!("http://{base}/api/token"), Duration::from_secs(5));

    let credential = provider.fetch().await.unwrap();
    assert_eq!(credential.token(), GOOD_TOKEN);
    assert_eq!(credential.application_key(), "test-app");
}

#[tokio::test]
async fn test_token_endpoint_error_body() {
    let (base, _state) = spawn_mock().await;
    let provider = HttpCredentialProvider::new(
        format!("http://{base}/api/broken-token"),
        Duration::from_secs(5),
    );

    let err = provider.fetch().await.unwrap_err();
    let SpeechError::CredentialUnavailable(detail) = err else {
        panic!("expected CredentialUnavailable, got {err:?}");
    };
    assert!(detail.contains("access key not configured"));
    assert!(detail.contains("500"));
}

#[tokio::test]
async fn test_token_endpoint_missing_appkey() {
    let (base, _state) = spawn_mock().await;
    let provider = HttpCredentialProvider::new(
        format!("http://{base}/api/partial-token"),
        Duration::from_secs(5),
    );

    assert!(matches!(
        provider.fetch().await,
        Err(SpeechError::CredentialUnavailable(_))
    ));
}

#[tokio::test]
async fn test_token_endpoint_unreachable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let provider = HttpCredentialProvider::new(
        format!("http://127.0.0.1:{port}/api/token"),
        Duration::from_secs(5),
    );
    assert!(matches!(
        provider.fetch().await,
        Err(SpeechError::CredentialUnavailable(_))
    ));
}
