//! Streaming session controller
//!
//! [`StreamingClient`] is the caller-facing entry point. Starting a session
//! connects (with retries), launches the media sender and hands back a
//! [`ResponseStream`] that pulls decoded responses on demand.
//!
//! # Session Phases
//!
//! ```text
//! Idle ─▶ Connecting ─▶ Streaming ─▶ Completed
//!              ▲            │
//!              │            ▼ (connection lost, reconnect allowed)
//!              └──────── Draining
//!
//! any phase ─▶ Failed (fatal error, retry budget exhausted, connection
//!                      lost without reconnect, or lost after the media
//!                      finished)
//! ```
//!
//! On a connection loss the stream stops the sender of the dead attempt
//! (cancel, bounded join, abort as a last resort), connects again with the
//! same media config and response types, and keeps pulling audio from the
//! same partially consumed source. Already consumed chunks are not re-sent.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::auth::{AuthProvider, Credentials};
use super::connection::{Backoff, ConnectionEstablisher, ConnectionHandle};
use super::error::{MediaError, StreamingError};
use super::keepalive::spawn_keepalive;
use super::media_sender::{
    default_media_error_callback, MediaErrorCallback, MediaSender, MediaSource,
    SharedMediaSource,
};
use super::protocol::{ClientEvent, MediaConfig, Response, ResponseTypes, EVENT_EOS, STATUS_NORMAL};
use super::response_reader::{ResponseItem, ResponseReader};
use super::transport::{Transport, WsTransport};
use crate::config::ClientSettings;

/// What happens when the connection drops mid-stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Surface the connection error to the caller
    None,
    /// Reconnect, each time bounded by the connect retry budget
    BoundedRetry,
}

/// Lifecycle phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Streaming,
    /// Connection lost; stopping the old attempt before reconnecting
    Draining,
    /// Every requested end-of-stream response arrived, or the server closed
    Completed,
    /// Fatal error, or the connection was lost after the media finished and
    /// before every end-of-stream response arrived. The latter still ends
    /// the response stream with `None` rather than an error.
    Failed,
}

/// State shared between the client and its running session
struct SharedState {
    /// The one open connection, if any. Only the session replaces it.
    current: Mutex<Option<Arc<ConnectionHandle>>>,
    media_finished: Arc<AtomicBool>,
}

impl SharedState {
    fn current_handle(&self) -> Option<Arc<ConnectionHandle>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_current(&self, handle: Arc<ConnectionHandle>) {
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    /// Forget `handle` unless another session already replaced it
    fn clear_current(&self, handle: &Arc<ConnectionHandle>) {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.as_ref().is_some_and(|h| Arc::ptr_eq(h, handle)) {
            *current = None;
        }
    }
}

/// Everything a running session needs, frozen at start
struct SessionContext {
    transport: Arc<dyn Transport>,
    auth: AuthProvider,
    settings: ClientSettings,
    reconnect: ReconnectPolicy,
    on_media_error: MediaErrorCallback,
    shared: Arc<SharedState>,
    log_target: Arc<str>,
}

/// Client for streaming speech recognition sessions
///
/// # Example
///
/// ```no_run
/// use futures_util::stream;
/// use speech_stream::{Credentials, ResponseTypes, StreamingClient};
///
/// # async fn demo(chunks: Vec<Vec<u8>>) -> Result<(), speech_stream::StreamingError> {
/// let client = StreamingClient::new(Credentials::AccessToken("token".into()))?;
/// let media = stream::iter(chunks.into_iter().map(Ok));
/// let mut responses = client
///     .start_stream("wss://example.com/ws", media, None, ResponseTypes::TRANSCRIPT)
///     .await?;
/// while let Some(response) = responses.next().await {
///     println!("{:?}", response?.best_transcript());
/// }
/// # Ok(())
/// # }
/// ```
pub struct StreamingClient {
    transport: Option<Arc<dyn Transport>>,
    auth: AuthProvider,
    settings: ClientSettings,
    reconnect: ReconnectPolicy,
    on_media_error: Option<MediaErrorCallback>,
    shared: Arc<SharedState>,
}

impl fmt::Debug for StreamingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingClient")
            .field("auth", &self.auth)
            .field("settings", &self.settings)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

impl StreamingClient {
    /// Reconnecting client with default settings
    pub fn new(credentials: Credentials) -> Result<Self, StreamingError> {
        Self::with_settings(credentials, ClientSettings::default())
    }

    /// Client that never reconnects: a dropped connection ends the session with an error
    pub fn single_connection(credentials: Credentials) -> Result<Self, StreamingError> {
        let settings = ClientSettings {
            reconnect: false,
            ..Default::default()
        };
        Self::with_settings(credentials, settings)
    }

    /// Fails with [`StreamingError::MissingCredential`] when the secret is empty
    pub fn with_settings(
        credentials: Credentials,
        settings: ClientSettings,
    ) -> Result<Self, StreamingError> {
        let auth = AuthProvider::new(credentials, settings.auth_endpoint.clone())?;
        let reconnect = if settings.reconnect {
            ReconnectPolicy::BoundedRetry
        } else {
            ReconnectPolicy::None
        };

        Ok(Self {
            transport: None,
            auth,
            settings,
            reconnect,
            on_media_error: None,
            shared: Arc::new(SharedState {
                current: Mutex::new(None),
                media_finished: Arc::new(AtomicBool::new(false)),
            }),
        })
    }

    /// Use a custom transport instead of the WebSocket one
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_auth(mut self, auth: AuthProvider) -> Self {
        self.auth = auth;
        self
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.reconnect
    }

    pub fn max_connection_retry_seconds(&self) -> f64 {
        self.settings.max_connection_retry_seconds
    }

    pub fn set_max_connection_retry_seconds(&mut self, seconds: f64) {
        self.settings.max_connection_retry_seconds = seconds;
    }

    /// Socket timeout for the built-in WebSocket transport
    pub fn set_socket_timeout(&mut self, seconds: Option<f64>) {
        self.settings.socket_timeout_seconds = seconds;
    }

    /// Route all records of this client to another `log` target
    pub fn set_log_target(&mut self, target: impl Into<String>) {
        self.settings.log_target = target.into();
    }

    /// Called (on the sender task) with any failure of the media path
    pub fn set_on_media_error<F>(&mut self, callback: F)
    where
        F: Fn(StreamingError) + Send + Sync + 'static,
    {
        self.on_media_error = Some(Arc::new(callback));
    }

    /// True once all media was sent (or [`send_eos_event`](Self::send_eos_event) was called)
    pub fn media_stream_finished(&self) -> bool {
        self.shared.media_finished.load(Ordering::SeqCst)
    }

    /// Start streaming `media` and receive recognition responses
    ///
    /// # Arguments
    /// * `ws_url` - WebSocket URL of the session
    /// * `media` - audio chunks in the encoding described by `media_config`
    /// * `media_config` - defaults to 16 kHz mono S16LE
    /// * `response_types` - which response types to request; the session
    ///   completes once each of them has sent its end-of-stream response
    pub async fn start_stream<S>(
        &self,
        ws_url: &str,
        media: S,
        media_config: Option<MediaConfig>,
        response_types: ResponseTypes,
    ) -> Result<ResponseStream, StreamingError>
    where
        S: Stream<Item = Result<Vec<u8>, MediaError>> + Send + 'static,
    {
        self.connect_and_start(
            ws_url,
            Some(media.boxed()),
            media_config.unwrap_or_default(),
            response_types,
        )
        .await
    }

    /// Start a session whose media reaches the server from elsewhere
    pub async fn start_with_external_source(
        &self,
        ws_url: &str,
        response_types: ResponseTypes,
    ) -> Result<ResponseStream, StreamingError> {
        self.connect_and_start(ws_url, None, MediaConfig::default(), response_types)
            .await
    }

    /// Send a `{event, payload}` message on the current connection
    pub async fn send_event(
        &self,
        event: &str,
        payload: Option<Value>,
    ) -> Result<(), StreamingError> {
        let handle = self
            .shared
            .current_handle()
            .filter(|h| h.is_open())
            .ok_or(StreamingError::NotConnected)?;
        handle.send_event(&ClientEvent::new(event, payload)).await
    }

    /// Tell the server that no more media will be sent
    pub async fn send_eos_event(&self) -> Result<(), StreamingError> {
        self.shared.media_finished.store(true, Ordering::SeqCst);
        self.send_event(EVENT_EOS, None).await
    }

    async fn connect_and_start(
        &self,
        ws_url: &str,
        media: Option<MediaSource>,
        media_config: MediaConfig,
        response_types: ResponseTypes,
    ) -> Result<ResponseStream, StreamingError> {
        if self.media_stream_finished() {
            return Err(StreamingError::MediaStreamFinished);
        }

        let log_target: Arc<str> = Arc::from(self.settings.log_target.as_str());
        let transport = self.transport.clone().unwrap_or_else(|| {
            Arc::new(WsTransport::new(self.settings.socket_timeout())) as Arc<dyn Transport>
        });
        let on_media_error = self
            .on_media_error
            .clone()
            .unwrap_or_else(|| default_media_error_callback(log_target.clone()));

        let context = Arc::new(SessionContext {
            transport,
            auth: self.auth.clone(),
            settings: self.settings.clone(),
            reconnect: self.reconnect,
            on_media_error,
            shared: self.shared.clone(),
            log_target,
        });

        let mut stream = ResponseStream {
            context,
            session_id: Uuid::new_v4(),
            ws_url: ws_url.to_string(),
            media: media.map(|m| Arc::new(tokio::sync::Mutex::new(m))),
            media_config,
            response_types,
            eos_received: Arc::new(Mutex::new(ResponseTypes::EMPTY)),
            phase: SessionPhase::Idle,
            connections: 0,
            attempt: None,
        };

        log::info!(
            target: stream.target(),
            "Starting session {} (response types: {})",
            stream.session_id,
            response_types
        );

        if let Err(e) = stream.connect().await {
            stream.transition(SessionPhase::Failed);
            return Err(e);
        }
        Ok(stream)
    }
}

/// Tasks and channels of one connection attempt
struct Attempt {
    handle: Arc<ConnectionHandle>,
    cancel: CancellationToken,
    responses: mpsc::Receiver<ResponseItem>,
    sender: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
    reader: JoinHandle<()>,
}

/// Pull-based sequence of responses for one session
///
/// Responses arrive in the order the server sent them. A slow consumer
/// holds back the reader but never the media sender.
pub struct ResponseStream {
    context: Arc<SessionContext>,
    session_id: Uuid,
    ws_url: String,
    media: Option<SharedMediaSource>,
    media_config: MediaConfig,
    response_types: ResponseTypes,
    /// Session-lifetime: not reset on reconnect
    eos_received: Arc<Mutex<ResponseTypes>>,
    phase: SessionPhase,
    connections: u64,
    attempt: Option<Attempt>,
}

impl ResponseStream {
    fn target(&self) -> &str {
        &self.context.log_target
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Number of connections opened so far (1 + reconnects)
    pub fn connection_count(&self) -> u64 {
        self.connections
    }

    /// Response types whose end-of-stream response has arrived
    pub fn eos_received(&self) -> ResponseTypes {
        *self
            .eos_received
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&mut self, next: SessionPhase) {
        if self.phase != next {
            log::info!(
                target: &*self.context.log_target,
                "Session {}: {:?} -> {:?}",
                self.session_id,
                self.phase,
                next
            );
            self.phase = next;
        }
    }

    /// Next response, `None` once the session has ended
    ///
    /// An `Err` ends the session: no further items follow it. Dropping the
    /// returned future while a reconnect is in flight is fine; the next call
    /// picks the reconnect up again.
    pub async fn next(&mut self) -> Option<Result<Response, StreamingError>> {
        loop {
            match self.phase {
                SessionPhase::Completed | SessionPhase::Failed => {
                    self.stop_attempt().await;
                    return None;
                }
                SessionPhase::Draining | SessionPhase::Connecting => {
                    match self.reconnect().await {
                        Ok(true) => {}
                        Ok(false) => return None,
                        Err(e) => return Some(Err(e)),
                    }
                }
                SessionPhase::Idle | SessionPhase::Streaming => {}
            }

            let item = self.attempt.as_mut()?.responses.recv().await;

            match item {
                Some(Ok(response)) => return Some(Ok(response)),
                None => {
                    self.complete().await;
                    return None;
                }
                Some(Err(e))
                    if e.is_connection_error()
                        && self.context.reconnect == ReconnectPolicy::BoundedRetry =>
                {
                    log::error!(
                        target: self.target(),
                        "Connection lost while reading responses: {}",
                        e
                    );
                    self.transition(SessionPhase::Draining);
                }
                Some(Err(e)) => {
                    // The reader already closed the handle unless the connection is gone
                    self.transition(SessionPhase::Failed);
                    self.stop_attempt().await;
                    return Some(Err(e));
                }
            }
        }
    }

    /// Replace a lost connection
    ///
    /// Returns `Ok(false)` when the media already finished, so the server
    /// has nothing more to say.
    async fn reconnect(&mut self) -> Result<bool, StreamingError> {
        self.stop_attempt().await;

        if self.context.shared.media_finished.load(Ordering::SeqCst) {
            log::warn!(
                target: self.target(),
                "Media stream already finished! Will not attempt to reconnect \
                 as the server will not return any more responses."
            );
            self.transition(SessionPhase::Failed);
            return Ok(false);
        }

        log::debug!(target: self.target(), "Trying to reconnect");
        if let Err(e) = self.connect().await {
            log::error!(target: self.target(), "Reconnect failed: {}", e);
            self.transition(SessionPhase::Failed);
            return Err(e);
        }
        Ok(true)
    }

    /// Adapt into a [`futures_util::Stream`]
    pub fn into_stream(self) -> impl Stream<Item = Result<Response, StreamingError>> + Send {
        futures_util::stream::unfold(self, |mut responses| async move {
            responses.next().await.map(|item| (item, responses))
        })
    }

    /// Open a connection and launch the attempt's tasks
    async fn connect(&mut self) -> Result<(), StreamingError> {
        self.transition(SessionPhase::Connecting);

        if self.context.shared.media_finished.load(Ordering::SeqCst) {
            return Err(StreamingError::MediaStreamFinished);
        }

        let context = self.context.clone();
        let establisher = ConnectionEstablisher {
            transport: context.transport.as_ref(),
            auth: &context.auth,
            retry_budget: context.settings.max_connection_retry(),
            backoff: Backoff::default(),
            log_target: &context.log_target,
        };

        let connection_id = self.connections + 1;
        let (handle, source) = establisher
            .connect(
                connection_id,
                &self.ws_url,
                &self.media_config,
                self.response_types,
            )
            .await?;
        self.connections = connection_id;
        context.shared.set_current(handle.clone());

        let cancel = CancellationToken::new();

        let sender = self.media.as_ref().map(|source| {
            MediaSender {
                source: source.clone(),
                handle: handle.clone(),
                cancel: cancel.clone(),
                media_finished: context.shared.media_finished.clone(),
                on_error: context.on_media_error.clone(),
                log_target: context.log_target.clone(),
            }
            .spawn()
        });

        let keepalive = context.settings.auto_ping_interval().map(|interval| {
            spawn_keepalive(
                handle.clone(),
                interval,
                cancel.clone(),
                context.log_target.clone(),
            )
        });

        let (tx, rx) = mpsc::channel(1);
        let reader = ResponseReader {
            source,
            handle: handle.clone(),
            cancel: cancel.clone(),
            requested: self.response_types,
            eos_received: self.eos_received.clone(),
            tx,
            log_target: context.log_target.clone(),
        }
        .spawn();

        self.attempt = Some(Attempt {
            handle,
            cancel,
            responses: rx,
            sender,
            keepalive,
            reader,
        });
        self.transition(SessionPhase::Streaming);
        Ok(())
    }

    /// Stop every task of the current attempt
    ///
    /// The sender gets `media_stop_timeout` to notice the cancellation; after
    /// that it is aborted and joined, so it can never write to a connection
    /// that is about to be replaced. The attempt stays in place until the
    /// sender is gone, so an interrupted call can simply be repeated.
    async fn stop_attempt(&mut self) {
        let limit = self.context.settings.media_stop_timeout();
        let target = self.context.log_target.clone();

        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        attempt.cancel.cancel();

        if let Some(sender) = attempt.sender.as_mut() {
            match tokio::time::timeout(limit, &mut *sender).await {
                Ok(_) => log::debug!(target: &*target, "Media sender stopped"),
                Err(_) => {
                    log::warn!(
                        target: &*target,
                        "Media sender did not stop within {:?}, aborting it",
                        limit
                    );
                    sender.abort();
                    let _ = (&mut *sender).await;
                }
            }
            attempt.sender = None;
        }

        let Some(attempt) = self.attempt.take() else {
            return;
        };
        if let Some(keepalive) = attempt.keepalive {
            keepalive.abort();
        }
        attempt.reader.abort();

        self.context.shared.clear_current(&attempt.handle);
    }

    async fn complete(&mut self) {
        let handle = self.attempt.as_ref().map(|a| a.handle.clone());
        if let Some(handle) = handle {
            handle.close(STATUS_NORMAL).await;
        }
        self.stop_attempt().await;
        self.transition(SessionPhase::Completed);
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };

        // Abandoned mid-session: stop the tasks and close the connection in the background
        attempt.cancel.cancel();
        attempt.reader.abort();
        if let Some(keepalive) = attempt.keepalive {
            keepalive.abort();
        }
        if let Some(sender) = attempt.sender {
            sender.abort();
        }
        self.context.shared.clear_current(&attempt.handle);

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let handle = attempt.handle;
            runtime.spawn(async move {
                handle.close(STATUS_NORMAL).await;
            });
        }
    }
}
