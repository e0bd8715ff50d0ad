//! Bearer token acquisition
//!
//! A session authenticates either with a ready-made access token or with an
//! API key that is exchanged for a short-lived token at the auth endpoint.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::StreamingError;

/// Token exchange endpoint used when none is configured
pub const DEFAULT_AUTH_ENDPOINT: &str = "https://users.verbit.co/api/v1/auth";

/// Global HTTP client for reuse across token exchanges
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default()
    })
}

/// How the client proves who it is
#[derive(Clone)]
pub enum Credentials {
    /// Sent as-is in the `Authorization: Bearer` header
    AccessToken(String),
    /// Exchanged for a bearer token before every connect
    ApiKey(String),
}

impl Credentials {
    fn secret(&self) -> &str {
        match self {
            Credentials::AccessToken(s) | Credentials::ApiKey(s) => s,
        }
    }
}

// Never print the secret itself
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::AccessToken(_) => f.write_str("AccessToken(***)"),
            Credentials::ApiKey(_) => f.write_str("ApiKey(***)"),
        }
    }
}

/// Retry policy for the token exchange: fixed attempts, uniform random wait
#[derive(Debug, Clone)]
pub struct TokenRetry {
    pub max_attempts: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl Default for TokenRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_wait: Duration::from_millis(500),
            max_wait: Duration::from_millis(1500),
        }
    }
}

impl TokenRetry {
    fn wait(&self) -> Duration {
        let span = self.max_wait.saturating_sub(self.min_wait);
        self.min_wait + span.mul_f64(rand::random::<f64>())
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    data: AuthRequestData<'a>,
}

#[derive(Serialize)]
struct AuthRequestData<'a> {
    api_key: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    #[serde(default)]
    token: Option<String>,
}

/// Produces `Authorization` headers for connection attempts
#[derive(Debug, Clone)]
pub struct AuthProvider {
    credentials: Credentials,
    endpoint: String,
    retry: TokenRetry,
}

impl AuthProvider {
    /// Fails with [`StreamingError::MissingCredential`] on an empty secret
    pub fn new(credentials: Credentials, endpoint: impl Into<String>) -> Result<Self, StreamingError> {
        if credentials.secret().trim().is_empty() {
            return Err(StreamingError::MissingCredential);
        }

        Ok(Self {
            credentials,
            endpoint: endpoint.into(),
            retry: TokenRetry::default(),
        })
    }

    pub fn with_retry(mut self, retry: TokenRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// `("Authorization", "Bearer <token>")`
    pub async fn authorization_header(&self) -> Result<(String, String), StreamingError> {
        let token = match self.bearer_token().await {
            Ok(token) => token,
            Err(e) => {
                log::error!("Failed to get auth token: {}", e);
                return Err(e);
            }
        };

        Ok(("Authorization".to_string(), format!("Bearer {}", token)))
    }

    pub async fn bearer_token(&self) -> Result<String, StreamingError> {
        match &self.credentials {
            Credentials::AccessToken(token) => Ok(token.clone()),
            Credentials::ApiKey(api_key) => self.exchange_with_retry(api_key).await,
        }
    }

    async fn exchange_with_retry(&self, api_key: &str) -> Result<String, StreamingError> {
        let mut attempt = 1;
        loop {
            match self.exchange(api_key).await {
                Ok(token) => return Ok(token),
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.wait();
                    log::warn!(
                        "Token exchange attempt {}/{} failed: {}, retrying in {:?}",
                        attempt,
                        self.retry.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn exchange(&self, api_key: &str) -> Result<String, StreamingError> {
        let body = AuthRequest {
            data: AuthRequestData { api_key },
        };

        let response = get_http_client()
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| StreamingError::Auth(format!("network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamingError::Auth(format!(
                "auth endpoint returned {}: {}",
                status, body
            )));
        }

        let parsed: AuthResponse = response
            .json()
            .await
            .map_err(|e| StreamingError::Auth(format!("invalid auth response: {}", e)))?;

        match parsed.token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(StreamingError::Auth(
                "auth endpoint returned no token".to_string(),
            )),
        }
    }
}
