//! All relay protocol message types.
//!
//! Every frame is a JSON object with a `"type"` discriminator; all other
//! fields sit in the same object and use camelCase names:
//!
//! ```json
//! {"type":"subscribe","topic":"sensor_data"}
//! {"type":"rpc_call","requestId":"7","method":"echo","params":{"a":1}}
//! ```
//!
//! Inbound kinds (client → server) and outbound kinds (server → client) are
//! two distinct enums, so the compiler rejects sending a client-only message
//! to a client. `request` and `response` exist in both directions because
//! either side may initiate a correlated request.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};

use crate::domain::session::{ConnectionId, UNKNOWN_CLIENT_TYPE};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Protocol version advertised in `welcome` and `handshake_response`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Stream type recorded when `stream_start` omits `streamType`.
pub const DEFAULT_STREAM_TYPE: &str = "data";

// ── Correlation ids ───────────────────────────────────────────────────────────

/// A correlation id chosen by the client, either a JSON string or a JSON
/// number.  Replies echo it back as the same JSON value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Text(String),
    Number(Number),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Text(s) => f.write_str(s),
            RequestId::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::Text(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::Text(s.to_owned())
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n.into())
    }
}

// ── Message kinds ─────────────────────────────────────────────────────────────

/// The closed set of inbound message kinds understood by the router.
///
/// The legacy `sensor_data` kind is not listed: the codec normalises it to
/// [`MessageKind::Data`] before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Handshake,
    Auth,
    Data,
    Request,
    Response,
    Subscribe,
    Unsubscribe,
    Publish,
    RpcCall,
    StreamStart,
    StreamData,
    StreamEnd,
    Heartbeat,
    Ping,
}

impl MessageKind {
    /// Every kind, in wire-table order.
    pub const ALL: [MessageKind; 14] = [
        MessageKind::Handshake,
        MessageKind::Auth,
        MessageKind::Data,
        MessageKind::Request,
        MessageKind::Response,
        MessageKind::Subscribe,
        MessageKind::Unsubscribe,
        MessageKind::Publish,
        MessageKind::RpcCall,
        MessageKind::StreamStart,
        MessageKind::StreamData,
        MessageKind::StreamEnd,
        MessageKind::Heartbeat,
        MessageKind::Ping,
    ];

    /// The `type` string used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Handshake => "handshake",
            MessageKind::Auth => "auth",
            MessageKind::Data => "data",
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Subscribe => "subscribe",
            MessageKind::Unsubscribe => "unsubscribe",
            MessageKind::Publish => "publish",
            MessageKind::RpcCall => "rpc_call",
            MessageKind::StreamStart => "stream_start",
            MessageKind::StreamData => "stream_data",
            MessageKind::StreamEnd => "stream_end",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Ping => "ping",
        }
    }

    /// Looks up a kind by its wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Whether an unauthenticated connection is refused this kind when
    /// authentication is enabled.
    ///
    /// Lifecycle kinds stay open so a client can identify itself, log in and
    /// keep the socket alive; every data-plane kind is gated.
    pub fn requires_auth(self) -> bool {
        !matches!(
            self,
            MessageKind::Handshake | MessageKind::Auth | MessageKind::Heartbeat | MessageKind::Ping
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Client → Server messages ──────────────────────────────────────────────────

/// All messages a client can send to the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Handshake(HandshakeMessage),
    Auth(AuthMessage),
    Data(DataMessage),
    Request(RequestMessage),
    Response(ResponseMessage),
    Subscribe(TopicMessage),
    Unsubscribe(TopicMessage),
    Publish(PublishMessage),
    RpcCall(RpcCallMessage),
    StreamStart(StreamStartMessage),
    StreamData(StreamDataMessage),
    StreamEnd(StreamEndMessage),
    Heartbeat,
    Ping,
}

impl InboundMessage {
    /// Returns the kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            InboundMessage::Handshake(_) => MessageKind::Handshake,
            InboundMessage::Auth(_) => MessageKind::Auth,
            InboundMessage::Data(_) => MessageKind::Data,
            InboundMessage::Request(_) => MessageKind::Request,
            InboundMessage::Response(_) => MessageKind::Response,
            InboundMessage::Subscribe(_) => MessageKind::Subscribe,
            InboundMessage::Unsubscribe(_) => MessageKind::Unsubscribe,
            InboundMessage::Publish(_) => MessageKind::Publish,
            InboundMessage::RpcCall(_) => MessageKind::RpcCall,
            InboundMessage::StreamStart(_) => MessageKind::StreamStart,
            InboundMessage::StreamData(_) => MessageKind::StreamData,
            InboundMessage::StreamEnd(_) => MessageKind::StreamEnd,
            InboundMessage::Heartbeat => MessageKind::Heartbeat,
            InboundMessage::Ping => MessageKind::Ping,
        }
    }

    /// The correlation id carried by request-shaped messages, if any.
    ///
    /// Used to attach the id to error frames so the client can match a
    /// rejection to the call it made.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            InboundMessage::Data(m) => m.request_id.as_ref(),
            InboundMessage::Request(m) => Some(&m.request_id),
            InboundMessage::Response(m) => Some(&m.request_id),
            InboundMessage::RpcCall(m) => Some(&m.request_id),
            _ => None,
        }
    }
}

/// Client introduces itself after connecting.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeMessage {
    /// Declared client category, e.g. `"device"`, `"application"`, `"service"`.
    #[serde(default = "default_client_type")]
    pub client_type: String,
    /// Optional features the client supports; recorded, never enforced.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Client protocol or build version.
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub version: Option<String>,
}

/// Shared-secret login.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthMessage {
    pub token: String,
}

/// Data ingestion (`data`, or the legacy `sensor_data`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    /// The payload; older clients send it as `payload`.
    #[serde(default, alias = "payload")]
    pub data: Option<Value>,
    /// Declared data kind; selects validation rules and the storage table.
    #[serde(default)]
    pub data_type: Option<String>,
    /// When present, the `data_response` echoes it back.
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

/// A correlated request. Sent by clients (handled by the application) and by
/// the server (answered by the client).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    pub request_id: RequestId,
    pub endpoint: String,
    #[serde(default)]
    pub data: Value,
}

/// The answer to a correlated request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub request_id: RequestId,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// `subscribe` / `unsubscribe` body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TopicMessage {
    pub topic: String,
}

/// Client publishes to a topic.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PublishMessage {
    pub topic: String,
    #[serde(default)]
    pub data: Value,
}

/// Remote procedure call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcCallMessage {
    pub request_id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStartMessage {
    #[serde(deserialize_with = "string_or_number")]
    pub stream_id: String,
    #[serde(default = "default_stream_type")]
    pub stream_type: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDataMessage {
    #[serde(deserialize_with = "string_or_number")]
    pub stream_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub sequence_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEndMessage {
    #[serde(deserialize_with = "string_or_number")]
    pub stream_id: String,
}

// ── Server → Client messages ──────────────────────────────────────────────────

/// Interaction patterns the server has switched on, advertised to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSet {
    pub request_response: bool,
    pub pubsub: bool,
    pub rpc: bool,
    pub streaming: bool,
    pub binary: bool,
    pub compression: bool,
}

/// Machine-readable category of an `error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The frame was not a well-formed message.
    InvalidFormat,
    /// The `type` field named a kind the router does not know.
    UnknownType,
    /// A gated kind arrived before a successful `auth`.
    AuthenticationRequired,
    /// The interaction pattern is switched off in the server configuration.
    FeatureDisabled,
    /// The frame exceeded the configured payload ceiling.
    PayloadTooLarge,
}

/// All messages the server sends to clients.
///
/// The codec adds a `timestamp` field (unix milliseconds) to every frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutboundMessage {
    /// Sent once, right after the connection is admitted.
    Welcome {
        connection_id: ConnectionId,
        server_version: String,
        auth_required: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        heartbeat_interval_ms: Option<u64>,
        features: FeatureSet,
    },
    HandshakeResponse {
        success: bool,
        connection_id: ConnectionId,
        client_type: String,
        server_version: String,
        auth_required: bool,
        authenticated: bool,
        features: FeatureSet,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AuthResponse {
        success: bool,
        authenticated: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    DataResponse {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        success: bool,
        data_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        insert_id: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Server-initiated correlated request.
    Request {
        request_id: String,
        endpoint: String,
        data: Value,
    },
    /// Answer to a client-initiated request.
    Response {
        request_id: RequestId,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SubscribeResponse {
        topic: String,
        success: bool,
    },
    UnsubscribeResponse {
        topic: String,
        success: bool,
    },
    PublishResponse {
        topic: String,
        success: bool,
        publish_count: usize,
    },
    /// Fan-out of a publish to a subscriber.
    Publish {
        topic: String,
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        publisher: Option<ConnectionId>,
    },
    RpcResponse {
        request_id: RequestId,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StreamStartResponse {
        stream_id: String,
        stream_type: String,
        success: bool,
    },
    StreamEndResponse {
        stream_id: String,
        success: bool,
    },
    HeartbeatResponse {
        server_time: u64,
    },
    Pong,
    /// Server push to every connection, or to one client category.
    Broadcast {
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        category: Option<String>,
    },
    Error {
        code: ErrorCode,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_type: Option<String>,
    },
}

impl OutboundMessage {
    /// Builds an `error` frame.
    pub fn error(code: ErrorCode, error: impl Into<String>) -> Self {
        OutboundMessage::Error {
            code,
            error: error.into(),
            request_id: None,
            message_type: None,
        }
    }

    /// Builds an `error` frame correlated to a request id and naming the
    /// offending message kind.
    pub fn error_for(
        code: ErrorCode,
        error: impl Into<String>,
        request_id: Option<&RequestId>,
        message_type: Option<&str>,
    ) -> Self {
        OutboundMessage::Error {
            code,
            error: error.into(),
            request_id: request_id.cloned(),
            message_type: message_type.map(str::to_owned),
        }
    }

    /// The wire name of this message, for log lines.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::Welcome { .. } => "welcome",
            OutboundMessage::HandshakeResponse { .. } => "handshake_response",
            OutboundMessage::AuthResponse { .. } => "auth_response",
            OutboundMessage::DataResponse { .. } => "data_response",
            OutboundMessage::Request { .. } => "request",
            OutboundMessage::Response { .. } => "response",
            OutboundMessage::SubscribeResponse { .. } => "subscribe_response",
            OutboundMessage::UnsubscribeResponse { .. } => "unsubscribe_response",
            OutboundMessage::PublishResponse { .. } => "publish_response",
            OutboundMessage::Publish { .. } => "publish",
            OutboundMessage::RpcResponse { .. } => "rpc_response",
            OutboundMessage::StreamStartResponse { .. } => "stream_start_response",
            OutboundMessage::StreamEndResponse { .. } => "stream_end_response",
            OutboundMessage::HeartbeatResponse { .. } => "heartbeat_response",
            OutboundMessage::Pong => "pong",
            OutboundMessage::Broadcast { .. } => "broadcast",
            OutboundMessage::Error { .. } => "error",
        }
    }
}

// ── Serde helpers ─────────────────────────────────────────────────────────────

fn default_client_type() -> String {
    UNKNOWN_CLIENT_TYPE.to_string()
}

fn default_stream_type() -> String {
    DEFAULT_STREAM_TYPE.to_string()
}

fn default_true() -> bool {
    true
}

/// Accepts an identifier sent either as a JSON string or a JSON number and
/// keeps it as a string.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
