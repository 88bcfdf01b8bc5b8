//! Frame encoder and decoder for the relay JSON protocol.
//!
//! Decoding happens in two stages so that the router can tell a malformed
//! frame apart from a well-formed frame of a kind it does not know:
//!
//! 1. Parse the text into a JSON value and require an object whose `type`
//!    field is a string.  Anything else is [`ProtocolError::InvalidFormat`].
//! 2. Look the type up in [`MessageKind`].  Unknown names become
//!    [`ProtocolError::UnknownMessageType`]; the legacy `sensor_data` name is
//!    rewritten to `data` with `dataType` defaulted to `"sensor"`.  The value
//!    is then deserialized into [`InboundMessage`]; a missing or mistyped
//!    required field is again `InvalidFormat`.
//!
//! Encoding serializes an [`OutboundMessage`] and stamps it with a
//! `timestamp` field in unix milliseconds.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::protocol::messages::{InboundMessage, MessageKind, OutboundMessage};

/// Legacy alias for `data` still sent by older sensor firmware.
pub const LEGACY_SENSOR_KIND: &str = "sensor_data";

/// `dataType` assigned to legacy `sensor_data` frames that omit one.
pub const LEGACY_SENSOR_DATA_TYPE: &str = "sensor";

/// Errors that can occur while decoding or encoding frames.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The frame is not a JSON object with a string `type`, or its fields do
    /// not match the declared kind.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    /// The `type` field named a kind that is not part of the protocol.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// An outbound message could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Decodes one text frame into an [`InboundMessage`].
///
/// # Errors
///
/// See the module documentation for the two failure classes.
pub fn decode_frame(text: &str) -> Result<InboundMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidFormat(e.to_string()))?;

    let Value::Object(mut object) = value else {
        return Err(ProtocolError::InvalidFormat(
            "frame is not a JSON object".to_string(),
        ));
    };

    let type_name = match object.get("type") {
        Some(Value::String(s)) => s.clone(),
        Some(_) => {
            return Err(ProtocolError::InvalidFormat(
                "`type` is not a string".to_string(),
            ))
        }
        None => return Err(ProtocolError::InvalidFormat("missing `type`".to_string())),
    };

    if type_name == LEGACY_SENSOR_KIND {
        normalise_sensor_frame(&mut object);
    } else if MessageKind::from_wire(&type_name).is_none() {
        return Err(ProtocolError::UnknownMessageType(type_name));
    }

    serde_json::from_value(Value::Object(object))
        .map_err(|e| ProtocolError::InvalidFormat(e.to_string()))
}

/// Rewrites a `sensor_data` frame in place into an equivalent `data` frame.
fn normalise_sensor_frame(object: &mut Map<String, Value>) {
    object.insert(
        "type".to_string(),
        Value::String(MessageKind::Data.as_str().to_string()),
    );
    let has_type = matches!(object.get("dataType"), Some(Value::String(_)));
    if !has_type {
        object.insert(
            "dataType".to_string(),
            Value::String(LEGACY_SENSOR_DATA_TYPE.to_string()),
        );
    }
}

/// Encodes a message, stamping it with the current time.
pub fn encode_frame(msg: &OutboundMessage) -> Result<String, ProtocolError> {
    encode_frame_at(msg, unix_millis())
}

/// Encodes a message with an explicit `timestamp`, for deterministic tests.
pub fn encode_frame_at(msg: &OutboundMessage, timestamp_ms: u64) -> Result<String, ProtocolError> {
    let mut value = serde_json::to_value(msg).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    if let Value::Object(ref mut object) = value {
        object.insert("timestamp".to_string(), Value::from(timestamp_ms));
    }
    serde_json::to_string(&value).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Milliseconds since the Unix epoch.  Returns 0 if the clock is before 1970.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ErrorCode, RequestId, StreamDataMessage};
    use serde_json::json;

    #[test]
    fn test_decode_subscribe_frame() {
        // Arrange
        let text = r#"{"type":"subscribe","topic":"alerts"}"#;

        // Act
        let msg = decode_frame(text).unwrap();

        // Assert
        assert_eq!(msg.kind(), MessageKind::Subscribe);
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let err = decode_frame("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFormat(_)));
    }

    #[test]
    fn test_decode_rejects_non_object() {
        let err = decode_frame("[1,2,3]").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFormat(_)));
    }

    #[test]
    fn test_decode_rejects_missing_type() {
        let err = decode_frame(r#"{"topic":"x"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidFormat("missing `type`".to_string()));
    }

    #[test]
    fn test_decode_rejects_numeric_type() {
        let err = decode_frame(r#"{"type":7}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFormat(_)));
    }

    #[test]
    fn test_decode_reports_unknown_kind_by_name() {
        let err = decode_frame(r#"{"type":"teleport"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownMessageType("teleport".to_string()));
    }

    #[test]
    fn test_decode_known_kind_missing_required_field_is_invalid_format() {
        // `subscribe` without `topic`.
        let err = decode_frame(r#"{"type":"subscribe"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFormat(_)));
    }

    #[test]
    fn test_decode_sensor_data_becomes_data_with_sensor_type() {
        let msg = decode_frame(r#"{"type":"sensor_data","data":{"t":1}}"#).unwrap();
        match msg {
            InboundMessage::Data(d) => {
                assert_eq!(d.data_type.as_deref(), Some(LEGACY_SENSOR_DATA_TYPE));
                assert_eq!(d.data, Some(json!({"t": 1})));
            }
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_sensor_data_keeps_explicit_data_type() {
        let msg =
            decode_frame(r#"{"type":"sensor_data","dataType":"humidity","data":{}}"#).unwrap();
        match msg {
            InboundMessage::Data(d) => assert_eq!(d.data_type.as_deref(), Some("humidity")),
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_stream_data_with_sequence_number() {
        let msg =
            decode_frame(r#"{"type":"stream_data","streamId":"s1","data":[1],"sequenceNumber":4}"#)
                .unwrap();
        assert_eq!(
            msg,
            InboundMessage::StreamData(StreamDataMessage {
                stream_id: "s1".to_string(),
                data: json!([1]),
                sequence_number: Some(4),
            })
        );
    }

    #[test]
    fn test_decode_ignores_extra_fields() {
        let msg = decode_frame(r#"{"type":"ping","timestamp":123,"extra":true}"#).unwrap();
        assert_eq!(msg, InboundMessage::Ping);
    }

    #[test]
    fn test_encode_adds_timestamp() {
        // Arrange
        let msg = OutboundMessage::Pong;

        // Act
        let text = encode_frame_at(&msg, 42).unwrap();

        // Assert
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "pong", "timestamp": 42}));
    }

    #[test]
    fn test_encode_error_frame_carries_code_and_correlation() {
        let msg = OutboundMessage::error_for(
            ErrorCode::AuthenticationRequired,
            "authentication required",
            Some(&RequestId::from("r9")),
            Some("rpc_call"),
        );
        let value: Value = serde_json::from_str(&encode_frame_at(&msg, 1).unwrap()).unwrap();
        assert_eq!(value["code"], "authentication_required");
        assert_eq!(value["requestId"], "r9");
        assert_eq!(value["messageType"], "rpc_call");
    }

    #[test]
    fn test_unix_millis_is_after_2020() {
        assert!(unix_millis() > 1_577_836_800_000);
    }
}
