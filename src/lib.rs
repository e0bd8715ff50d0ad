//! Client for bidirectional streaming speech recognition sessions
//!
//! See [`streaming`] for the session engine and [`config`] for settings.

pub mod config;
pub mod streaming;

pub use config::ClientSettings;
pub use streaming::{
    Credentials, MediaConfig, ReconnectPolicy, Response, ResponseStream, ResponseType,
    ResponseTypes, SessionPhase, StreamingClient, StreamingError,
};
