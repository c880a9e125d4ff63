//! Socket abstraction for the protocol session
//!
//! The session talks to a [`Transport`] so the state machine can be driven
//! by an in-memory fake in tests; [`WsConnector`] is the real WebSocket.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::SpeechError;
use crate::credential::Credential;
use crate::error::AUTH_FAILED_STATUS;

/// Something that arrived on the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A text frame
    Text(String),
    /// The socket closed; `clean` is false if it went away without a normal close
    Closed { clean: bool, reason: String },
}

/// One open socket
#[async_trait]
pub trait Transport: Send {
    /// Send a text frame
    async fn send_text(&mut self, text: String) -> Result<(), SpeechError>;

    /// Send a binary frame
    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), SpeechError>;

    /// Wait for the next inbound event; must be cancel-safe
    ///
    /// # Errors
    ///
    /// Returns `TransportError` on a socket-level failure
    async fn recv(&mut self) -> Result<Incoming, SpeechError>;

    /// Close the socket, ignoring failures
    async fn close(&mut self);
}

/// Opens sockets
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a socket to `url`
    ///
    /// # Errors
    ///
    /// Returns `TransportError`, or `ProtocolError` if the handshake was
    /// rejected for authentication reasons
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, SpeechError>;
}

/// Append the credential's token to the ASR endpoint
///
/// # Errors
///
/// Returns `TransportError` if the endpoint isn't a valid URL
pub fn socket_url(endpoint: &str, credential: &Credential) -> Result<String, SpeechError> {
    let mut url = url::Url::parse(endpoint)
        .map_err(|e| SpeechError::TransportError(format!("invalid endpoint {endpoint}: {e}")))?;
    url.query_pairs_mut().append_pair("token", credential.token());
    Ok(url.into())
}

/// WebSocket connector backed by tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, SpeechError> {
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| map_connect_error(&e))?;

        tracing::debug!(status = %response.status(), "websocket connected");
        Ok(Box::new(WsTransport { stream }))
    }
}

fn map_connect_error(err: &tungstenite::Error) -> SpeechError {
    if let tungstenite::Error::Http(resp) = err {
        let code = resp.status().as_u16();
        if code == 401 || code == 403 {
            return SpeechError::ProtocolError {
                code: AUTH_FAILED_STATUS,
                message: format!("handshake rejected with HTTP {code}"),
            };
        }
    }
    SpeechError::TransportError(format!("connect failed: {err}"))
}

/// An open tokio-tungstenite socket
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), SpeechError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SpeechError::TransportError(format!("send failed: {e}")))
    }

    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), SpeechError> {
        self.stream
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|e| SpeechError::TransportError(format!("send failed: {e}")))
    }

    async fn recv(&mut self) -> Result<Incoming, SpeechError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Incoming::Text(text.to_string())),
                Some(Ok(Message::Close(frame))) => {
                    let (clean, reason) = frame.map_or_else(
                        || (true, String::new()),
                        |f| (f.code == CloseCode::Normal, f.reason.to_string()),
                    );
                    return Ok(Incoming::Closed { clean, reason });
                }
                Some(Ok(
                    Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_),
                )) => {}
                Some(Err(tungstenite::Error::ConnectionClosed)) => {
                    return Ok(Incoming::Closed {
                        clean: true,
                        reason: String::new(),
                    });
                }
                Some(Err(e)) => return Err(SpeechError::TransportError(e.to_string())),
                None => {
                    return Ok(Incoming::Closed {
                        clean: false,
                        reason: "stream ended without close frame".to_string(),
                    });
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "websocket close failed");
        }
    }
}
