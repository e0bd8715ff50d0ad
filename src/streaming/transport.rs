//! Transport adapter boundary
//!
//! The engine never touches a socket directly. It talks to a [`Transport`]
//! that opens a connection and hands back its two directions:
//! a [`FrameSink`] (shared by the media sender, keepalive and event senders)
//! and a [`FrameSource`] (owned by the response reader).
//!
//! [`WsTransport`] is the production implementation on top of
//! `tokio-tungstenite`.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, http::HeaderValue, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

use super::error::TransportError;
use super::protocol::{encode_close_payload, parse_close_payload};

/// A decoded WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Raw close payload: 2-byte big-endian code + UTF-8 reason, possibly empty
    Close(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

/// Everything needed to open one connection
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: Url,
    /// Extra HTTP headers for the upgrade request (e.g. `Authorization`)
    pub headers: Vec<(String, String)>,
}

/// Outbound half of an open connection
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Send a close frame with the given status code and release the connection
    async fn close(&mut self, code: u16) -> Result<(), TransportError>;
}

/// Inbound half of an open connection
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame. A connection that ends without a close frame
    /// is reported as a connection-class error.
    async fn recv(&mut self) -> Result<Frame, TransportError>;
}

/// Opens connections
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `tokio-tungstenite` backed transport
#[derive(Debug, Clone, Default)]
pub struct WsTransport {
    /// Applied to the handshake and to every receive when set
    socket_timeout: Option<Duration>,
}

impl WsTransport {
    pub fn new(socket_timeout: Option<Duration>) -> Self {
        Self { socket_timeout }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(map_ws_error)?;

        for (name, value) in &request.headers {
            let value =
                HeaderValue::from_str(value).map_err(|e| TransportError::Other(e.to_string()))?;
            let name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Other(e.to_string()))?;
            ws_request.headers_mut().insert(name, value);
        }

        let connect = connect_async_with_config(
            ws_request, None, true, // disable_nagle (we want low latency)
        );

        let (ws_stream, _response) = match self.socket_timeout {
            Some(limit) => timeout(limit, connect)
                .await
                .map_err(|_| TransportError::Timeout("WebSocket handshake".to_string()))?,
            None => connect.await,
        }
        .map_err(map_ws_error)?;

        let (write, read) = ws_stream.split();

        Ok((
            Box::new(WsFrameSink { write }),
            Box::new(WsFrameSource {
                read,
                recv_timeout: self.socket_timeout,
            }),
        ))
    }
}

struct WsFrameSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close(data) => {
                let close = parse_close_payload(&data)
                    .ok()
                    .map(|(code, reason)| CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    });
                Message::Close(close)
            }
        };

        self.write.send(message).await.map_err(map_ws_error)
    }

    async fn close(&mut self, code: u16) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        // The peer may already be gone; flushing the close frame is best effort
        if let Err(e) = self.write.send(Message::Close(Some(frame))).await {
            log::debug!("Close frame not sent: {}", e);
        }
        self.write.close().await.map_err(map_ws_error)
    }
}

struct WsFrameSource {
    read: SplitStream<WsStream>,
    recv_timeout: Option<Duration>,
}

#[async_trait]
impl FrameSource for WsFrameSource {
    async fn recv(&mut self) -> Result<Frame, TransportError> {
        let next = match self.recv_timeout {
            Some(limit) => timeout(limit, self.read.next()).await.map_err(|_| {
                TransportError::Timeout(format!("no frame received within {:?}", limit))
            })?,
            None => self.read.next().await,
        };

        match next {
            Some(Ok(message)) => Ok(message_to_frame(message)),
            Some(Err(e)) => Err(map_ws_error(e)),
            None => Err(TransportError::Connection(
                "connection closed without a close frame".to_string(),
            )),
        }
    }
}

fn message_to_frame(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text),
        Message::Binary(data) => Frame::Binary(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(Some(close)) => {
            Frame::Close(encode_close_payload(u16::from(close.code), &close.reason))
        }
        Message::Close(None) => Frame::Close(Vec::new()),
        // Raw frames are only produced when writing; treat as opaque binary
        Message::Frame(frame) => Frame::Binary(frame.into_data()),
    }
}

/// Classify a tungstenite error at the adapter boundary
fn map_ws_error(err: tungstenite::Error) -> TransportError {
    use tungstenite::Error;

    match err {
        Error::Http(response) => TransportError::Handshake {
            status: response.status().as_u16(),
            body: response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned()),
        },
        Error::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => {
            TransportError::Timeout(e.to_string())
        }
        Error::Io(e) => TransportError::Connection(e.to_string()),
        Error::Url(_) | Error::HttpFormat(_) | Error::Utf8 => TransportError::Other(err.to_string()),
        // Closed, TLS, protocol and capacity failures all mean this socket is done
        _ => TransportError::Connection(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_message_to_frame_keeps_wire_layout() {
        let frame = message_to_frame(Message::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "bye".into(),
        })));
        assert_eq!(frame, Frame::Close(vec![0x03, 0xE9, b'b', b'y', b'e']));

        assert_eq!(message_to_frame(Message::Close(None)), Frame::Close(vec![]));
    }

    #[test]
    fn test_data_messages_to_frame() {
        assert_eq!(
            message_to_frame(Message::Text("hi".to_string())),
            Frame::Text("hi".to_string())
        );
        assert_eq!(
            message_to_frame(Message::Binary(vec![1, 2])),
            Frame::Binary(vec![1, 2])
        );
        assert_eq!(
            message_to_frame(Message::Ping(vec![9])),
            Frame::Ping(vec![9])
        );
    }

    #[test]
    fn test_ws_error_mapping() {
        let io = tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(map_ws_error(io), TransportError::Connection(_)));

        let timed_out = tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "slow",
        ));
        assert!(matches!(map_ws_error(timed_out), TransportError::Timeout(_)));

        assert!(map_ws_error(tungstenite::Error::ConnectionClosed).is_connection_class());
        assert!(!map_ws_error(tungstenite::Error::Utf8).is_retryable());

        let response = tungstenite::http::Response::builder()
            .status(401)
            .body(None)
            .unwrap();
        match map_ws_error(tungstenite::Error::Http(response)) {
            TransportError::Handshake { status, .. } => assert_eq!(status, 401),
            other => panic!("unexpected mapping: {:?}", other),
        }
    }
}
