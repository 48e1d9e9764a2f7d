use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::RemoteError;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Outbound `req` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Inbound `res` frame. `error` is only meaningful when `ok` is false.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseFrame {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl ResponseFrame {
    pub fn success(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload,
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: RemoteError) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: Value::Null,
            error: Some(error),
        }
    }

    /// Collapse into the caller-facing result. A failed response without an
    /// error body still fails, with a generic message.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        if self.ok {
            return Ok(self.payload);
        }
        Err(self
            .error
            .unwrap_or_else(|| RemoteError::new("", "request failed")))
    }
}

/// Inbound, unsolicited `event` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    /// Gateway sequence number. Values that are not a non-negative integer
    /// read as absent rather than failing the whole event.
    #[serde(
        default,
        deserialize_with = "deserialize_seq",
        skip_serializing_if = "Option::is_none"
    )]
    pub seq: Option<u64>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            seq: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

/// The frame kinds a client accepts from the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response(ResponseFrame),
    Event(EventFrame),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("unrecognized frame type: {0}")]
    UnknownType(String),
}

pub fn encode_frame(frame: &Frame) -> Result<String, FrameError> {
    serde_json::to_string(frame).map_err(|err| FrameError::Encode(err.to_string()))
}

pub fn encode_request(request: &RequestFrame) -> Result<String, FrameError> {
    #[derive(Serialize)]
    struct Tagged<'a> {
        #[serde(rename = "type")]
        kind: &'static str,
        #[serde(flatten)]
        request: &'a RequestFrame,
    }

    serde_json::to_string(&Tagged {
        kind: "req",
        request,
    })
    .map_err(|err| FrameError::Encode(err.to_string()))
}

/// Parse one inbound text frame. Only `res` and `event` are accepted.
pub fn decode_inbound(text: &str, max_frame_bytes: usize) -> Result<InboundFrame, FrameError> {
    if text.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: text.len(),
            max: max_frame_bytes,
        });
    }
    let value: Value =
        serde_json::from_str(text).map_err(|err| FrameError::Decode(err.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    match kind.as_str() {
        "res" => serde_json::from_value(value)
            .map(InboundFrame::Response)
            .map_err(|err| FrameError::Decode(err.to_string())),
        "event" => serde_json::from_value(value)
            .map(InboundFrame::Event)
            .map_err(|err| FrameError::Decode(err.to_string())),
        _ => Err(FrameError::UnknownType(kind)),
    }
}

/// Parse one `req` frame, as the gateway side sees it.
pub fn decode_request(text: &str) -> Result<RequestFrame, FrameError> {
    match serde_json::from_str::<Frame>(text) {
        Ok(Frame::Request(request)) => Ok(request),
        Ok(Frame::Response(_)) => Err(FrameError::UnknownType("res".to_string())),
        Ok(Frame::Event(_)) => Err(FrameError::UnknownType("event".to_string())),
        Err(err) => Err(FrameError::Decode(err.to_string())),
    }
}

/// Tolerant decode: anything malformed or unrecognized yields `None`.
pub fn decode(text: &str) -> Option<InboundFrame> {
    decode_inbound(text, DEFAULT_MAX_FRAME_BYTES).ok()
}

/// Correlation ids are strings on the wire, but some servers echo them as
/// numbers.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

fn deserialize_seq<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Value>::deserialize(deserializer)?.and_then(|val| val.as_u64()))
}
