//! Broker envelopes.
//!
//! Envelopes are the JSON payloads gateway instances exchange through the
//! broker. The `sender` field always holds the publishing connection id and
//! is what every instance uses for sender exclusion.

use crate::codec::ProtocolError;
use crate::ChatId;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A chat message as published on `chat-<chatId>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEnvelope {
    /// Message body, relayed verbatim.
    pub message: Value,
    /// Publishing connection id.
    #[serde(alias = "author")]
    pub sender: String,
}

impl ChatEnvelope {
    /// Create a new chat envelope.
    #[must_use]
    pub fn new(message: Value, sender: impl Into<String>) -> Self {
        Self {
            message,
            sender: sender.into(),
        }
    }
}

/// A typing indicator as published on the typing channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEnvelope {
    /// Chat being typed in.
    pub chat_id: ChatId,
    /// Display name of the typist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Publishing connection id.
    pub sender: String,
}

/// Encode an envelope for publishing.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode<T: Serialize>(envelope: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(envelope)?))
}

/// Decode an envelope received from the broker.
///
/// # Errors
///
/// Returns an error if the payload is not a valid envelope.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_envelope_accepts_author() {
        let payload = br#"{"message":{"content":{"type":"TEXT","value":"hi"}},"author":"conn_1"}"#;
        let envelope: ChatEnvelope = decode(payload).unwrap();
        assert_eq!(envelope.sender, "conn_1");
        assert_eq!(envelope.message["content"]["value"], "hi");
    }

    #[test]
    fn test_typing_envelope_shape() {
        let envelope = TypingEnvelope {
            chat_id: "9".into(),
            name: None,
            sender: "conn_2".into(),
        };
        let encoded = encode(&envelope).unwrap();
        let value: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value, json!({"chatId": "9", "sender": "conn_2"}));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode::<ChatEnvelope>(b"not json").is_err());
        assert!(decode::<ChatEnvelope>(br#"{"message":"hi"}"#).is_err());
    }
}
