//! Connection establishment and the shared connection handle
//!
//! # Retry Strategy
//!
//! Connecting uses randomized exponential backoff ("full jitter": a uniform
//! wait in `[0, min(cap, base * 2^attempt)]`) bounded by a total elapsed-time
//! budget rather than an attempt count. Only connection-class failures and a
//! few handshake statuses are retried, see [`TransportError::is_retryable`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use super::auth::AuthProvider;
use super::error::{StreamingError, TransportError};
use super::protocol::{build_connect_url, ClientEvent, MediaConfig, ResponseTypes};
use super::transport::{ConnectRequest, Frame, FrameSink, FrameSource, Transport};

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound for a single backoff wait
const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

/// Randomized exponential backoff
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: RETRY_BASE_DELAY,
            max: RETRY_MAX_DELAY,
        }
    }
}

impl Backoff {
    /// Upper bound of the wait after the given (0-based) failed attempt
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Jittered wait after the given (0-based) failed attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        self.ceiling(attempt).mul_f64(rand::random::<f64>())
    }
}

/// The live transport connection of one connection attempt
///
/// The outbound half lives here and is shared by the media sender, the
/// keepalive task and caller-issued events. Once closed, every send fails
/// with a connection-class error.
pub struct ConnectionHandle {
    id: u64,
    sink: Mutex<Box<dyn FrameSink>>,
    open: AtomicBool,
    log_target: Arc<str>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: u64, sink: Box<dyn FrameSink>, log_target: Arc<str>) -> Self {
        Self {
            id,
            sink: Mutex::new(sink),
            open: AtomicBool::new(true),
            log_target,
        }
    }

    /// Sequence number of the connection within its session (1-based)
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Connection(format!(
                "connection #{} is closed",
                self.id
            )));
        }
        self.sink.lock().await.send(frame).await
    }

    pub async fn send_binary(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.send(Frame::Binary(data)).await
    }

    pub async fn ping(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.send(Frame::Ping(payload)).await
    }

    pub async fn send_event(&self, event: &ClientEvent) -> Result<(), StreamingError> {
        let json = event.to_json()?;
        log::debug!(target: &*self.log_target, "Sending event: {}", json);
        self.send(Frame::Text(json)).await?;
        Ok(())
    }

    /// Close the connection if it is still open. Returns whether this call closed it.
    pub async fn close(&self, code: u16) -> bool {
        if !self.open.swap(false, Ordering::SeqCst) {
            return false;
        }

        log::info!(target: &*self.log_target, "Closing WebSocket (connection #{})", self.id);
        if let Err(e) = self.sink.lock().await.close(code).await {
            log::debug!(target: &*self.log_target, "Error closing WebSocket: {}", e);
        }
        true
    }
}

/// Opens connections for a session, replaying the same parameters every time
pub(crate) struct ConnectionEstablisher<'a> {
    pub transport: &'a dyn Transport,
    pub auth: &'a AuthProvider,
    pub retry_budget: Duration,
    pub backoff: Backoff,
    pub log_target: &'a Arc<str>,
}

impl ConnectionEstablisher<'_> {
    /// Build the URL, authenticate and connect with retries
    ///
    /// # Returns
    /// * `Ok((handle, source))` - exactly one open connection
    /// * `Err(StreamingError::RetryBudgetExceeded)` - retryable failures until the budget ran out
    /// * `Err(other)` - a non-retryable failure, unwrapped
    pub async fn connect(
        &self,
        connection_id: u64,
        ws_url: &str,
        media_config: &MediaConfig,
        response_types: ResponseTypes,
    ) -> Result<(Arc<ConnectionHandle>, Box<dyn FrameSource>), StreamingError> {
        let target: &str = self.log_target;
        let url = build_connect_url(ws_url, media_config, response_types)?;
        let headers = vec![self.auth.authorization_header().await?];
        let request = ConnectRequest { url, headers };

        log::info!(target: target, "Connecting to WebSocket at {}", request.url);

        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            let error = match self.transport.connect(request.clone()).await {
                Ok((sink, source)) => {
                    log::info!(
                        target: target,
                        "WebSocket connected (connection #{}, attempt {})",
                        connection_id,
                        attempts
                    );
                    let handle =
                        ConnectionHandle::new(connection_id, sink, self.log_target.clone());
                    return Ok((Arc::new(handle), source));
                }
                Err(e) => e,
            };

            let should_retry = error.is_retryable();
            log::warn!(
                target: target,
                "Error while connecting WebSocket: {}, should_retry={}",
                error,
                should_retry
            );

            if !should_retry {
                log::error!(target: target, "Error while connecting WebSocket: {}", error);
                return Err(error.into());
            }

            let elapsed = started.elapsed();
            if elapsed >= self.retry_budget {
                log::error!(
                    target: target,
                    "Error while connecting WebSocket! Exceeded maximum retries and giving up. \
                     Last attempt raised: {} (attempts={}, elapsed={:?})",
                    error,
                    attempts,
                    elapsed
                );
                return Err(StreamingError::RetryBudgetExceeded {
                    attempts,
                    elapsed,
                    last_error: error,
                });
            }

            let delay = self
                .backoff
                .delay(attempts - 1)
                .min(self.retry_budget - elapsed);
            log::info!(
                target: target,
                "Retrying WebSocket connection in {:?} (attempt {})",
                delay,
                attempts + 1
            );
            tokio::time::sleep(delay).await;
        }
    }
}
