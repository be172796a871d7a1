//! Protocol definitions for browser-server signaling
//!
//! Messages are JSON objects discriminated by their `id` field and carried
//! as WebSocket text frames.

mod message;

pub use message::{CallDecision, ClientMessage, IceCandidate, ResponseStatus, ServerMessage};

use serde_json::Value;
use thiserror::Error;

/// Discriminants the server understands
pub const CLIENT_MESSAGE_IDS: &[&str] = &[
    "register",
    "call",
    "incomingCallResponse",
    "play",
    "stop",
    "onIceCandidate",
];

/// Maximum inbound message size (SDP blobs are a few KB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid message {0}")]
    UnknownMessage(String),

    #[error("Message has no id field")]
    MissingId,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

/// Decode an inbound text frame
///
/// Unknown discriminants are reported separately from malformed payloads so
/// the sender gets a precise error.
pub fn decode(text: &str) -> Result<ClientMessage, ProtocolError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;

    let id = match value.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) => return Err(ProtocolError::UnknownMessage(other.to_string())),
        None => return Err(ProtocolError::MissingId),
    };

    if !CLIENT_MESSAGE_IDS.contains(&id.as_str()) {
        return Err(ProtocolError::UnknownMessage(id));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::MalformedMessage(format!("{id}: {e}")))
}

/// Encode an outbound message as a text frame
pub fn encode(msg: &ServerMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::Encode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_register() {
        let msg = decode(r#"{"id":"register","name":"alice"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Register { name } if name == "alice"));
    }

    #[test]
    fn test_decode_register_without_name_is_empty() {
        let msg = decode(r#"{"id":"register"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Register { name } if name.is_empty()));
    }

    #[test]
    fn test_decode_unknown_id() {
        let err = decode(r#"{"id":"dance"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessage(id) if id == "dance"));
    }

    #[test]
    fn test_decode_missing_id() {
        assert!(matches!(
            decode(r#"{"name":"alice"}"#),
            Err(ProtocolError::MissingId)
        ));
    }

    #[test]
    fn test_decode_malformed_payload() {
        let err = decode(r#"{"id":"call","to":"bob"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage(_)));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            decode("not json"),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_encode_omits_absent_fields() {
        let text = encode(&ServerMessage::register_accepted()).unwrap();
        assert_eq!(text, r#"{"id":"registerResponse","response":"accepted"}"#);
    }
}
