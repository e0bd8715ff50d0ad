//! Error types for the streaming session engine
//!
//! Two layers:
//! - [`TransportError`] is what a transport adapter reports. It carries enough
//!   information to classify a failure as connection-class (retry / reconnect)
//!   or fatal.
//! - [`StreamingError`] is what callers of the engine observe.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the audio source supplied by the caller
pub type MediaError = Box<dyn std::error::Error + Send + Sync>;

/// HTTP-like handshake statuses that are worth retrying even though they are 4xx
const RETRY_HTTP_CLIENT_CODES: &[u16] = &[429];

/// 5xx handshake statuses that indicate a permanent protocol/config mismatch
const NO_RETRY_HTTP_SERVER_CODES: &[u16] = &[501, 505, 506, 507, 508, 510];

/// Failures reported by a [`Transport`](super::transport::Transport) or by one
/// of its connection halves
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The WebSocket upgrade was answered with a non-101 HTTP status
    #[error("WebSocket handshake rejected with HTTP status {status}")]
    Handshake { status: u16, body: Option<String> },

    /// Reset, refused, closed or otherwise broken connection (includes DNS failures)
    #[error("connection error: {0}")]
    Connection(String),

    /// An OS-level or socket timeout expired
    #[error("timed out: {0}")]
    Timeout(String),

    /// Anything else (malformed URL, invalid header, ...). Never retried.
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Connection-class errors trigger retries at connect time and
    /// reconnection mid-stream
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_) | TransportError::Timeout(_)
        )
    }

    /// Whether a failed connect attempt should be retried after a backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Handshake { status, .. } => should_retry_http_status(*status),
            other => other.is_connection_class(),
        }
    }
}

/// Retry classification for handshake statuses
pub fn should_retry_http_status(status: u16) -> bool {
    if RETRY_HTTP_CLIENT_CODES.contains(&status) {
        true
    } else if NO_RETRY_HTTP_SERVER_CODES.contains(&status) {
        false
    } else if (400..500).contains(&status) {
        false
    } else {
        (500..600).contains(&status)
    }
}

/// Errors that can occur during a streaming session
#[derive(Debug, Error)]
pub enum StreamingError {
    /// No access token or API key was supplied
    #[error("a non-empty access token or API key is required")]
    MissingCredential,

    /// The connection URL could not be built
    #[error("invalid WebSocket URL: {0}")]
    InvalidUrl(String),

    /// Token exchange with the auth endpoint failed
    #[error("failed to obtain auth token: {0}")]
    Auth(String),

    /// Transport failure (handshake, connection loss, timeout, ...)
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Connecting kept failing with retryable errors until the time budget ran out
    #[error(
        "gave up connecting after {attempts} attempt(s) in {elapsed:?}, last error: {last_error}"
    )]
    RetryBudgetExceeded {
        attempts: u32,
        elapsed: Duration,
        #[source]
        last_error: TransportError,
    },

    /// A text frame from the server could not be decoded
    #[error("failed to decode server response: {0}")]
    Decode(String),

    /// The caller's audio source failed
    #[error("media source failed: {0}")]
    MediaSource(#[source] MediaError),

    /// An operation needed an open connection and there was none
    #[error("WebSocket client is disconnected")]
    NotConnected,

    /// The media stream already ended, the server will not return anything new
    #[error("media stream already finished, refusing to connect")]
    MediaStreamFinished,
}

impl StreamingError {
    /// Errors that warrant a reconnect when the session allows it
    pub fn is_connection_error(&self) -> bool {
        matches!(self, StreamingError::Transport(e) if e.is_connection_class())
    }
}
