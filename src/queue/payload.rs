//! Wire payloads stored in and served from webhook streams
//!
//! The stored form and the served form share field names with the platform's
//! JSON convention (camelCase). Event bodies are kept as opaque JSON: the
//! worker that calls the platform owns their schema.

use crate::store::EntryId;
use serde::{Deserialize, Serialize};

/// What ingress appends to a channel stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookStreamObject {
    pub request_id: String,
    pub signature: String,
    pub destination: String,
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
}

/// A stream entry handed to a worker, with the id needed to acknowledge it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMessage {
    pub message_id: EntryId,
    pub request_id: String,
    pub signature: String,
    pub destination: String,
    pub events: Vec<serde_json::Value>,
}

impl WebhookMessage {
    pub fn from_stream_object(message_id: EntryId, object: WebhookStreamObject) -> Self {
        WebhookMessage {
            message_id,
            request_id: object.request_id,
            signature: object.signature,
            destination: object.destination,
            events: object.events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_object_uses_camel_case() {
        let object = WebhookStreamObject {
            request_id: "req-1".to_string(),
            signature: "sig".to_string(),
            destination: "U123".to_string(),
            events: vec![json!({"type": "message"})],
        };
        let value = serde_json::to_value(&object).unwrap();
        assert_eq!(
            value,
            json!({
                "requestId": "req-1",
                "signature": "sig",
                "destination": "U123",
                "events": [{"type": "message"}],
            })
        );
    }

    #[test]
    fn test_missing_events_default_to_empty() {
        let object: WebhookStreamObject = serde_json::from_str(
            r#"{"requestId":"r","signature":"s","destination":"d"}"#,
        )
        .unwrap();
        assert!(object.events.is_empty());
    }

    #[test]
    fn test_message_serializes_id_as_string() {
        let message = WebhookMessage::from_stream_object(
            EntryId::new(1700000000000, 3),
            WebhookStreamObject {
                request_id: "r".to_string(),
                signature: "s".to_string(),
                destination: "d".to_string(),
                events: Vec::new(),
            },
        );
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["messageId"], json!("1700000000000-3"));
        assert_eq!(value["requestId"], json!("r"));
    }
}
