//! Response reader: decodes inbound frames for one connection attempt
//!
//! The reader runs on its own task and hands decoded responses to the
//! session through a channel of capacity one. A slow consumer therefore has
//! at most two responses pending: one in the channel and one the reader is
//! waiting to hand over. The end-of-stream close can happen while those are
//! still pending; they are delivered all the same. It stops when
//! - every requested response type has sent its end-of-stream response,
//! - the peer sends a close frame, or
//! - receiving or decoding fails.
//!
//! Connection-class failures are forwarded without touching the handle (it is
//! presumed dead) so the session can reconnect. Any other failure closes the
//! handle first. A normal stop always closes the handle if it is still open.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::ConnectionHandle;
use super::error::StreamingError;
use super::protocol::{
    parse_close_payload, Response, ResponseTypes, STATUS_GOING_AWAY, STATUS_NORMAL,
};
use super::transport::{Frame, FrameSource};

pub(crate) type ResponseItem = Result<Response, StreamingError>;

/// What a close frame told us
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Normal or going-away
    Expected { code: u16, reason: String },
    /// Any other status code
    Unexpected { code: u16, reason: String },
    /// The payload could not be parsed
    Malformed,
}

/// Log a received close frame. Never fails: a bad close frame is only observed.
pub fn handle_close_frame(payload: &[u8], log_target: &str) -> CloseOutcome {
    match parse_close_payload(payload) {
        Ok((code, reason)) => {
            let msg = format!("WebSocket closed. Code={}, Reason={}", code, reason);
            if code == STATUS_NORMAL || code == STATUS_GOING_AWAY {
                log::info!(target: log_target, "{}", msg);
                CloseOutcome::Expected { code, reason }
            } else {
                log::warn!(target: log_target, "Unexpected close code: {}", msg);
                CloseOutcome::Unexpected { code, reason }
            }
        }
        Err(e) => {
            log::error!(
                target: log_target,
                "WebSocket closed with invalid payload. Data={:?} ({})",
                payload,
                e
            );
            CloseOutcome::Malformed
        }
    }
}

pub(crate) struct ResponseReader {
    pub source: Box<dyn FrameSource>,
    pub handle: Arc<ConnectionHandle>,
    /// Cancelled when this reader closes the handle, stopping the attempt's sender
    pub cancel: CancellationToken,
    pub requested: ResponseTypes,
    /// End-of-stream types seen so far in the session (survives reconnects)
    pub eos_received: Arc<Mutex<ResponseTypes>>,
    pub tx: mpsc::Sender<ResponseItem>,
    pub log_target: Arc<str>,
}

impl ResponseReader {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let target = self.log_target.clone();
        log::debug!(
            target: &*target,
            "Waiting for responses (connection #{}) ...",
            self.handle.id()
        );

        match self.read_loop().await {
            Ok(()) => self.close().await,
            Err(e) if e.is_connection_error() => {
                log::error!(
                    target: &*target,
                    "Connection error while reading responses: {}",
                    e
                );
                let _ = self.tx.send(Err(e)).await;
            }
            Err(e) => {
                log::error!(target: &*target, "Error while reading responses: {}", e);
                self.close().await;
                let _ = self.tx.send(Err(e)).await;
            }
        }
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        self.handle.close(STATUS_NORMAL).await;
    }

    /// Record an end-of-stream response; returns whether every requested type is done
    fn track_end_of_stream(&self, response: &Response) -> bool {
        let mut received = self
            .eos_received
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if response.is_end_of_stream() {
            match response.response_type() {
                Some(response_type) => received.insert(response_type),
                None => log::warn!(
                    target: &*self.log_target,
                    "Received reply with unknown 'type' field: {}",
                    response.response.kind
                ),
            }
        }

        received.covers(self.requested)
    }

    async fn read_loop(&mut self) -> Result<(), StreamingError> {
        let target = self.log_target.clone();

        loop {
            match self.source.recv().await? {
                Frame::Text(text) => {
                    let response = Response::from_json(&text)?;

                    let complete = self.track_end_of_stream(&response);
                    if complete {
                        log::info!(target: &*target, "Received all expected EOS responses");
                        self.close().await;
                    }

                    if self.tx.send(Ok(response)).await.is_err() {
                        log::debug!(target: &*target, "Response consumer went away");
                        return Ok(());
                    }

                    if complete {
                        return Ok(());
                    }
                }
                Frame::Close(payload) => {
                    handle_close_frame(&payload, &target);
                    return Ok(());
                }
                Frame::Ping(payload) => {
                    log::debug!(target: &*target, "Received Ping with payload: {:?}", payload);
                }
                Frame::Pong(payload) => {
                    log::debug!(target: &*target, "Received Pong with payload: {:?}", payload);
                }
                Frame::Binary(data) => {
                    log::warn!(
                        target: &*target,
                        "Unexpected WebSocket response: binary frame ({} bytes)",
                        data.len()
                    );
                }
            }
        }
    }
}
