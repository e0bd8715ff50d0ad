//! Bidirectional streaming speech recognition over WebSocket
//!
//! The client sends raw audio as binary frames and receives JSON recognition
//! responses, reconnecting transparently when the connection drops.
//!
//! # Architecture
//!
//! ```text
//!                         ┌──────────── ResponseStream (session controller) ───────────┐
//!                         │                                                           │
//! Audio source ──▶ MediaSender ──▶ ConnectionHandle ══ WebSocket ══▶ ResponseReader ──▶ next()
//!  (shared)        (own task)         │                   (own task, mpsc(1))
//!                                     └── Keepalive pings
//! ```
//!
//! # Reconnection Strategy
//!
//! - Every connect retries with jittered exponential backoff until a time
//!   budget runs out; 4xx handshake failures (except 429) fail immediately
//! - A connection error while reading stops the old sender, then connects again
//!   and resumes from the same audio source
//! - Once the media stream has finished nothing is reconnected: the stream ends
//! - The session completes when every requested response type sent its
//!   end-of-stream response

pub mod auth;
mod connection;
pub mod error;
mod keepalive;
mod media_sender;
pub mod protocol;
mod response_reader;
mod session;
pub mod transport;

pub use auth::{AuthProvider, Credentials, TokenRetry};
pub use connection::{Backoff, ConnectionHandle};
pub use error::{should_retry_http_status, MediaError, StreamingError, TransportError};
pub use media_sender::{default_media_error_callback, MediaErrorCallback, MediaSource};
pub use protocol::{
    build_connect_url, ClientEvent, MediaConfig, Response, ResponseType, ResponseTypes,
};
pub use response_reader::{handle_close_frame, CloseOutcome};
pub use session::{ReconnectPolicy, ResponseStream, SessionPhase, StreamingClient};
pub use transport::{ConnectRequest, Frame, FrameSink, FrameSource, Transport, WsTransport};
