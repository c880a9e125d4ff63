//! Short-lived credentials for the streaming ASR service
//!
//! The token endpoint is a plain `GET` returning `{ token, appkey }`, or an
//! error body `{ error | message }` with a non-2xx status. No retries happen
//! here; a failed fetch ends the attempt and the caller decides what's next.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::SpeechError;

/// Access token plus the application key it was issued for
#[derive(Debug, Clone)]
pub struct Credential {
    token: SecretString,
    application_key: String,
    issued_at: DateTime<Utc>,
}

impl Credential {
    /// Create a credential stamped with the current time
    #[must_use]
    pub fn new(token: impl Into<String>, application_key: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            application_key: application_key.into(),
            issued_at: Utc::now(),
        }
    }

    /// Raw token, for building the socket URL
    #[must_use]
    pub fn token(&self) -> &str {
        self.token.expose_secret()
    }

    /// Application key stamped on outbound headers
    #[must_use]
    pub fn application_key(&self) -> &str {
        &self.application_key
    }

    /// When the credential was fetched
    #[must_use]
    pub const fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

/// Source of credentials for a recognition attempt
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fetch a fresh credential
    ///
    /// # Errors
    ///
    /// Returns `CredentialUnavailable` if no usable credential could be obtained
    async fn fetch(&self) -> Result<Credential, SpeechError>;
}

/// Successful token endpoint body
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    appkey: Option<String>,
}

/// Error body from the token endpoint
#[derive(Debug, Default, Deserialize)]
struct TokenErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Fetches credentials from an HTTP token endpoint
#[derive(Debug, Clone)]
pub struct HttpCredentialProvider {
    client: Client,
    url: String,
}

impl HttpCredentialProvider {
    /// Create a provider for the given endpoint
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: std::time::Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn fetch(&self) -> Result<Credential, SpeechError> {
        tracing::debug!(url = %self.url, "fetching credential");

        let response = self.client.get(&self.url).send().await.map_err(|e| {
            tracing::error!(error = %e, "token request failed");
            SpeechError::CredentialUnavailable(format!("token request failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<TokenErrorBody>(&body)
                .ok()
                .and_then(|b| b.error.or(b.message))
                .unwrap_or(body);
            tracing::error!(status = %status, detail = %detail, "token endpoint error");
            return Err(SpeechError::CredentialUnavailable(format!(
                "token endpoint returned {status}: {detail}"
            )));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse token response");
            SpeechError::CredentialUnavailable(format!("invalid token response: {e}"))
        })?;

        parse_token_response(body)
    }
}

/// Both fields must be present and non-empty
fn parse_token_response(body: TokenResponse) -> Result<Credential, SpeechError> {
    let token = body.token.filter(|t| !t.is_empty()).ok_or_else(|| {
        SpeechError::CredentialUnavailable("token response is missing token".to_string())
    })?;
    let appkey = body.appkey.filter(|k| !k.is_empty()).ok_or_else(|| {
        SpeechError::CredentialUnavailable("token response is missing appkey".to_string())
    })?;

    tracing::debug!(appkey = %appkey, "credential fetched");
    Ok(Credential::new(token, appkey))
}
