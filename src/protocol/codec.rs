//! Tunnel wire format: message types, constructors, and decoding.
//!
//! Every frame exchanged with the agent is a [`TunnelMessage`]:
//!
//! ```json
//! {
//!   "envelope": {"tunnel_id": "T0X...", "client_id": "C0X..."},
//!   "message": {
//!     "metadata": {"id": "M0X...", "message_type": "http_request", ...},
//!     "payload": {"kind": "HTTP", "data": {"kind": "Request", ...}}
//!   }
//! }
//! ```
//!
//! Payloads are tagged unions that fail closed: an unrecognized `kind` or
//! `message_type` is a typed [`DecodeError`], never a silent partial match.
//! Decode errors are non-fatal to the connection — the caller answers with a
//! Control/Error frame and keeps reading.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::ids;

/// Outer routing metadata, distinct from the payload. Derived from the
/// message id at encode time; routing hints, not secrets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub tunnel_id: String,
    pub client_id: String,
}

/// The unit exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelMessage {
    pub envelope: Envelope,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub metadata: Metadata,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Unique per message.
    pub id: String,
    pub message_type: MessageType,
    pub version: String,
    /// Unix milliseconds.
    pub timestamp: u64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    HttpRequest,
    HttpResponse,
    Auth,
    Error,
    Ping,
    Pong,
    StatusQuery,
    StatusResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    FireAndForget,
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Json,
    Binary,
    Compressed,
}

/// Payload envelope: `{"kind": "HTTP"|"Control", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum Payload {
    #[serde(rename = "HTTP")]
    Http(HttpPayload),
    Control(ControlPayload),
}

/// An HTTP request or response carried through the tunnel. `requestId` ties
/// a response back to the request it answers; responses may arrive in any
/// order relative to other in-flight requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum HttpPayload {
    Request {
        method: String,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<Value>,
        #[serde(rename = "requestId")]
        request_id: String,
    },
    Response {
        status: u16,
        #[serde(default)]
        status_text: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<Value>,
        #[serde(rename = "requestId")]
        request_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ControlPayload {
    Authentication {
        status: String,
        message: String,
        timestamp: u64,
    },
    Error {
        error: String,
        code: String,
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        timestamp: u64,
    },
    Ping {
        status: String,
        timestamp: u64,
    },
    StatusQuery,
    StatusReport {
        report: Value,
        timestamp: u64,
    },
}

/// Why a frame could not be decoded. Maps to a wire error code via
/// [`DecodeError::wire_code`]; never terminates the connection by itself.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("message is missing metadata or payload")]
    MalformedEnvelope,
    #[error("unknown payload kind `{0}`")]
    UnknownPayloadKind(String),
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),
}

impl DecodeError {
    /// Error code sent back to the agent in the Control/Error reply.
    pub fn wire_code(&self) -> &'static str {
        match self {
            DecodeError::InvalidJson(_) | DecodeError::MalformedEnvelope => "INVALID_STRUCTURE",
            DecodeError::UnknownPayloadKind(_) | DecodeError::UnknownMessageType(_) => {
                "UNKNOWN_TUNNEL_TYPE"
            }
        }
    }
}

/// Decode a raw text frame into a [`TunnelMessage`].
///
/// Fails with [`DecodeError::MalformedEnvelope`] when `message.metadata` or
/// `message.payload` is absent, [`DecodeError::UnknownPayloadKind`] for a
/// payload kind outside HTTP/Control, and [`DecodeError::UnknownMessageType`]
/// for an unrecognized `message_type`. Bare non-JSON control tokens (like
/// `"PING"`) must be special-cased by the caller before decode.
pub fn decode(raw: &str) -> Result<TunnelMessage, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(DecodeError::InvalidJson)?;

    let message = value.get("message").ok_or(DecodeError::MalformedEnvelope)?;
    let metadata = message
        .get("metadata")
        .filter(|m| m.is_object())
        .ok_or(DecodeError::MalformedEnvelope)?;
    let payload = message
        .get("payload")
        .filter(|p| p.is_object())
        .ok_or(DecodeError::MalformedEnvelope)?;

    let kind = payload.get("kind").and_then(Value::as_str).unwrap_or("");
    if kind != "HTTP" && kind != "Control" {
        return Err(DecodeError::UnknownPayloadKind(kind.to_string()));
    }

    let message_type = metadata.get("message_type").cloned().unwrap_or(Value::Null);
    if serde_json::from_value::<MessageType>(message_type.clone()).is_err() {
        let shown = message_type.as_str().unwrap_or("").to_string();
        return Err(DecodeError::UnknownMessageType(shown));
    }

    serde_json::from_value(value).map_err(|_| DecodeError::MalformedEnvelope)
}

/// Build a message with fresh ids, the current timestamp, and metadata
/// defaults. `tunnel_id`/`client_id` are synthesized from the message id.
pub fn tunnel_message(
    message_type: MessageType,
    payload: Payload,
    version: &str,
    correlation_id: Option<String>,
) -> TunnelMessage {
    let message_id = ids::message();
    TunnelMessage {
        envelope: Envelope {
            tunnel_id: ids::tunnel(),
            client_id: ids::client_for(&message_id),
        },
        message: Message {
            metadata: Metadata {
                id: message_id,
                message_type,
                version: version.to_string(),
                timestamp: ids::now_ms(),
                priority: Priority::default(),
                delivery_mode: DeliveryMode::default(),
                encoding: Encoding::default(),
                correlation_id,
            },
            payload,
        },
    }
}

pub fn http_request_message(
    method: &str,
    url: &str,
    headers: HashMap<String, String>,
    body: Option<Value>,
    request_id: &str,
    version: &str,
) -> TunnelMessage {
    tunnel_message(
        MessageType::HttpRequest,
        Payload::Http(HttpPayload::Request {
            method: method.to_string(),
            url: url.to_string(),
            headers,
            body,
            request_id: request_id.to_string(),
        }),
        version,
        None,
    )
}

pub fn http_response_message(
    status: u16,
    status_text: &str,
    headers: HashMap<String, String>,
    body: Option<Value>,
    request_id: &str,
    correlation_id: Option<String>,
    version: &str,
) -> TunnelMessage {
    tunnel_message(
        MessageType::HttpResponse,
        Payload::Http(HttpPayload::Response {
            status,
            status_text: status_text.to_string(),
            headers,
            body,
            request_id: request_id.to_string(),
        }),
        version,
        correlation_id,
    )
}

pub fn auth_message(status: &str, message: &str, version: &str) -> TunnelMessage {
    tunnel_message(
        MessageType::Auth,
        Payload::Control(ControlPayload::Authentication {
            status: status.to_string(),
            message: message.to_string(),
            timestamp: ids::now_ms(),
        }),
        version,
        None,
    )
}

pub fn error_message(
    error: &str,
    code: &str,
    request_id: Option<&str>,
    version: &str,
) -> TunnelMessage {
    tunnel_message(
        MessageType::Error,
        Payload::Control(ControlPayload::Error {
            error: error.to_string(),
            code: code.to_string(),
            request_id: request_id.map(ToString::to_string),
            timestamp: ids::now_ms(),
        }),
        version,
        None,
    )
}

pub fn pong_message(version: &str) -> TunnelMessage {
    tunnel_message(
        MessageType::Pong,
        Payload::Control(ControlPayload::Ping {
            status: "pong".to_string(),
            timestamp: ids::now_ms(),
        }),
        version,
        None,
    )
}

pub fn status_report_message(
    report: Value,
    correlation_id: Option<String>,
    version: &str,
) -> TunnelMessage {
    tunnel_message(
        MessageType::StatusResponse,
        Payload::Control(ControlPayload::StatusReport {
            report,
            timestamp: ids::now_ms(),
        }),
        version,
        correlation_id,
    )
}
