//! Streaming speech recognition protocol types
//!
//! This module defines the data model shared by the client and the server
//! and the wire formats exchanged over the WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to `<ws_url>&format=..&sample_rate=..&...&get_transcript=..&get_captions=..`
//!    with an `Authorization: Bearer <token>` header
//! 2. Stream raw audio as binary frames
//! 3. Send `{"event": "EOS", "payload": {}}` once the audio is exhausted
//! 4. Receive `{"response": {...}}` text frames until every requested
//!    response type has sent `is_end_of_stream: true`

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::StreamingError;

/// Close status: normal closure (RFC 6455 section 7.4.1)
pub const STATUS_NORMAL: u16 = 1000;

/// Close status: endpoint going away
pub const STATUS_GOING_AWAY: u16 = 1001;

/// Event name marking the end of the client's media
pub const EVENT_EOS: &str = "EOS";

/// Describes the raw audio the client sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Sample encoding, e.g. `S16LE` (signed 16-bit little-endian PCM)
    pub format: String,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Bytes per sample
    pub sample_width: u16,
    pub num_channels: u16,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            format: "S16LE".to_string(),
            sample_rate: 16000,
            sample_width: 2,
            num_channels: 1,
        }
    }
}

impl MediaConfig {
    /// Bytes of audio per second of playback
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.sample_width as usize * self.num_channels as usize
    }
}

/// A single category of server output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    Transcript,
    Captions,
}

impl ResponseType {
    pub const ALL: [ResponseType; 2] = [ResponseType::Transcript, ResponseType::Captions];

    /// Map a `response.type` field to a response type (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(name))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Transcript => "Transcript",
            ResponseType::Captions => "Captions",
        }
    }

    fn bit(self) -> u8 {
        match self {
            ResponseType::Transcript => 1,
            ResponseType::Captions => 2,
        }
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A combinable set of [`ResponseType`] flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ResponseTypes(u8);

impl ResponseTypes {
    pub const EMPTY: ResponseTypes = ResponseTypes(0);
    pub const TRANSCRIPT: ResponseTypes = ResponseTypes(1);
    pub const CAPTIONS: ResponseTypes = ResponseTypes(2);
    pub const ALL: ResponseTypes = ResponseTypes(3);

    pub fn contains(&self, response_type: ResponseType) -> bool {
        self.0 & response_type.bit() != 0
    }

    /// True when every flag of `other` is also set in `self`
    pub fn covers(&self, other: ResponseTypes) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, response_type: ResponseType) {
        self.0 |= response_type.bit();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ResponseType> + '_ {
        ResponseType::ALL.into_iter().filter(|t| self.contains(*t))
    }
}

impl From<ResponseType> for ResponseTypes {
    fn from(response_type: ResponseType) -> Self {
        ResponseTypes(response_type.bit())
    }
}

impl BitOr for ResponseTypes {
    type Output = ResponseTypes;

    fn bitor(self, rhs: Self) -> Self::Output {
        ResponseTypes(self.0 | rhs.0)
    }
}

impl BitOrAssign for ResponseTypes {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ResponseTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|t| t.as_str()).collect();
        if names.is_empty() {
            f.write_str("(none)")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// A speech recognition message sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub response: ResponseBody,
    /// Top-level fields other than `response`
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    /// Response type name, `Transcript` or `Captions`
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub alternatives: Vec<Alternative>,

    #[serde(default)]
    pub is_end_of_stream: bool,

    /// Timing, speaker, id and any other fields the server includes
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    #[serde(default)]
    pub transcript: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Response {
    /// Decode a text frame payload
    pub fn from_json(text: &str) -> Result<Self, StreamingError> {
        serde_json::from_str(text).map_err(|e| StreamingError::Decode(e.to_string()))
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.response.is_end_of_stream
    }

    pub fn response_type(&self) -> Option<ResponseType> {
        ResponseType::from_name(&self.response.kind)
    }

    /// Transcript of the first (best) alternative, if any
    pub fn best_transcript(&self) -> Option<&str> {
        self.response
            .alternatives
            .first()
            .map(|a| a.transcript.as_str())
    }
}

/// `{event, payload}` envelope for client → server control messages
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientEvent {
    pub event: String,
    pub payload: Value,
}

impl ClientEvent {
    /// Build an event; a missing payload is sent as `{}`
    pub fn new(event: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            event: event.into(),
            payload: payload.unwrap_or_else(|| Value::Object(Map::new())),
        }
    }

    pub fn eos() -> Self {
        Self::new(EVENT_EOS, None)
    }

    pub fn to_json(&self) -> Result<String, StreamingError> {
        serde_json::to_string(self).map_err(|e| StreamingError::Decode(e.to_string()))
    }
}

fn python_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Query parameters describing the media and the requested response types
pub fn connect_query_pairs(
    media_config: &MediaConfig,
    response_types: ResponseTypes,
) -> Vec<(&'static str, String)> {
    vec![
        ("format", media_config.format.clone()),
        ("sample_rate", media_config.sample_rate.to_string()),
        ("sample_width", media_config.sample_width.to_string()),
        ("num_channels", media_config.num_channels.to_string()),
        (
            "get_transcript",
            python_bool(response_types.contains(ResponseType::Transcript)).to_string(),
        ),
        (
            "get_captions",
            python_bool(response_types.contains(ResponseType::Captions)).to_string(),
        ),
    ]
}

/// Append the connection query parameters to the base URL, keeping any
/// query parameters it already carries
pub fn build_connect_url(
    ws_url: &str,
    media_config: &MediaConfig,
    response_types: ResponseTypes,
) -> Result<Url, StreamingError> {
    let mut url = Url::parse(ws_url).map_err(|e| StreamingError::InvalidUrl(e.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(StreamingError::InvalidUrl(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }

    url.query_pairs_mut()
        .extend_pairs(connect_query_pairs(media_config, response_types));
    Ok(url)
}

/// Why a close frame payload could not be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosePayloadError {
    /// Fewer than two bytes, so no status code
    MissingCode,
    /// The reason is not valid UTF-8
    InvalidReason,
}

impl fmt::Display for ClosePayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosePayloadError::MissingCode => f.write_str("payload too short for a status code"),
            ClosePayloadError::InvalidReason => f.write_str("reason is not valid UTF-8"),
        }
    }
}

/// Parse a close frame payload: 2-byte big-endian code followed by a UTF-8 reason
pub fn parse_close_payload(data: &[u8]) -> Result<(u16, String), ClosePayloadError> {
    if data.len() < 2 {
        return Err(ClosePayloadError::MissingCode);
    }

    let code = u16::from_be_bytes([data[0], data[1]]);
    let reason =
        String::from_utf8(data[2..].to_vec()).map_err(|_| ClosePayloadError::InvalidReason)?;
    Ok((code, reason))
}

/// Encode a close frame payload (used by transports that hand us parsed frames)
pub fn encode_close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(2 + reason.len());
    data.extend_from_slice(&code.to_be_bytes());
    data.extend_from_slice(reason.as_bytes());
    data
}
