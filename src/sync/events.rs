// Wire event codec for the live connection.
// Every inbound frame decodes into exactly one variant of a closed enum;
// the dispatcher routes each variant to a single coordinator.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::models::{Attachment, DeliveryStatus, Message};

const KNOWN_TYPES: &[&str] = &[
    "message",
    "file",
    "typing",
    "read_receipt",
    "delivery_status",
    "persistence_status",
    "ping",
];

/// Payload of a `message` or `file` event. Field names follow the wire
/// format of the messaging backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub client_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub img_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_status: Option<DeliveryStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    /// Set on server echoes of the client's own message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_delivery_at: Option<DateTime<Utc>>,
}

impl MessagePayload {
    pub fn from_message(message: &Message) -> Self {
        MessagePayload {
            id: message.id.clone(),
            client_id: message.client_id.clone(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            content: message.content.clone(),
            timestamp: message.created_at,
            img_url: message.attachment.as_ref().map(|a| a.url.clone()),
            file_name: message.attachment.as_ref().and_then(|a| a.name.clone()),
            file_key: message.attachment.as_ref().and_then(|a| a.key.clone()),
            file_type: message
                .attachment
                .as_ref()
                .and_then(|a| a.mime_type.clone()),
            delivery_status: Some(message.delivery_status),
            delivered_at: message.delivered_at,
            confirmed_delivery_at: None,
        }
    }

    pub fn attachment(&self) -> Option<Attachment> {
        self.img_url.as_ref().map(|url| Attachment {
            url: url.clone(),
            name: self.file_name.clone(),
            key: self.file_key.clone(),
            mime_type: self.file_type.clone(),
        })
    }

    /// Attachment-bearing payloads travel as `file` events, plain text as
    /// `message` events.
    pub fn into_event(self) -> WireEvent {
        if self.img_url.is_some() {
            WireEvent::File(self)
        } else {
            WireEvent::Message(self)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub is_typing: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptPayload {
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub message_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Real-time delivery confirmation keyed by `client_id`. The backend sends
/// this as soon as the message reached at least one of the receiver's
/// connected devices; it carries no server id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStatusPayload {
    pub client_id: String,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceOutcome {
    Saved,
    Failed,
}

/// Reported separately from real-time delivery: whether the backend managed
/// to persist the message to the record store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceStatusPayload {
    pub client_id: String,
    pub status: PersistenceOutcome,
    pub timestamp: DateTime<Utc>,
}

/// Heartbeat frame. The backend echoes pings back with a millisecond epoch
/// timestamp, so this one field is not RFC 3339 like the others.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_time: Option<String>,
}

/// The closed set of events that travel over the live connection, in either
/// direction, discriminated by the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    Message(MessagePayload),
    File(MessagePayload),
    Typing(TypingPayload),
    ReadReceipt(ReadReceiptPayload),
    DeliveryStatus(DeliveryStatusPayload),
    PersistenceStatus(PersistenceStatusPayload),
    Ping(PingPayload),
}

impl WireEvent {
    /// Decodes one inbound frame. Unknown event types and malformed frames
    /// are logged and dropped rather than surfaced as errors; the connection
    /// must survive anything the server sends.
    pub fn decode(raw: &str) -> Option<WireEvent> {
        match serde_json::from_str::<WireEvent>(raw) {
            Ok(event) => Some(event),
            Err(err) => {
                match serde_json::from_str::<serde_json::Value>(raw) {
                    Ok(value) => {
                        let kind = value
                            .get("type")
                            .and_then(|t| t.as_str())
                            .unwrap_or("<missing>");
                        if KNOWN_TYPES.contains(&kind) {
                            warn!("Dropping malformed '{}' event: {}", kind, err);
                        } else {
                            debug!("Ignoring event of unknown type '{}'", kind);
                        }
                    }
                    Err(_) => warn!("Dropping undecodable frame: {}", err),
                }
                None
            }
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_message_event() {
        let raw = r#"{
            "type": "message",
            "clientId": "msg_abc",
            "conversationId": "conv_1",
            "senderId": "user_b",
            "receiverId": "user_a",
            "content": "hello",
            "timestamp": "2025-06-01T12:00:00Z"
        }"#;

        match WireEvent::decode(raw) {
            Some(WireEvent::Message(payload)) => {
                assert_eq!(payload.client_id, "msg_abc");
                assert_eq!(payload.conversation_id, "conv_1");
                assert_eq!(payload.content, "hello");
                assert!(payload.id.is_none());
                assert!(payload.attachment().is_none());
            }
            other => panic!("Expected message event, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_delivery_status() {
        let raw = r#"{
            "type": "delivery_status",
            "clientId": "msg_abc",
            "status": "delivered",
            "timestamp": "2025-06-01T12:00:01Z"
        }"#;

        match WireEvent::decode(raw) {
            Some(WireEvent::DeliveryStatus(payload)) => {
                assert_eq!(payload.client_id, "msg_abc");
                assert_eq!(payload.status, DeliveryStatus::Delivered);
            }
            other => panic!("Expected delivery_status event, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_dropped() {
        let raw = r#"{"type": "presence", "userId": "user_b"}"#;
        assert!(WireEvent::decode(raw).is_none());

        let raw = r#"{"no_type_at_all": true}"#;
        assert!(WireEvent::decode(raw).is_none());

        assert!(WireEvent::decode("not json").is_none());
    }

    #[test]
    fn test_file_event_round_trip() {
        let payload = MessagePayload {
            id: None,
            client_id: "msg_f1".to_string(),
            conversation_id: "conv_1".to_string(),
            sender_id: "user_a".to_string(),
            receiver_id: "user_b".to_string(),
            content: String::new(),
            timestamp: Utc::now(),
            img_url: Some("https://files.test/u/1".to_string()),
            file_name: Some("lease.pdf".to_string()),
            file_key: Some("k1".to_string()),
            file_type: Some("application/pdf".to_string()),
            delivery_status: Some(DeliveryStatus::Sending),
            delivered_at: None,
            confirmed_delivery_at: None,
        };

        let event = payload.into_event();
        assert!(matches!(event, WireEvent::File(_)));

        let encoded = event.encode().expect("encode");
        assert!(encoded.contains(r#""type":"file""#));
        assert!(encoded.contains(r#""clientId":"msg_f1""#));

        match WireEvent::decode(&encoded) {
            Some(WireEvent::File(decoded)) => {
                let attachment = decoded.attachment().expect("attachment");
                assert_eq!(attachment.name.as_deref(), Some("lease.pdf"));
            }
            other => panic!("Expected file event, got {:?}", other),
        }
    }

    #[test]
    fn test_ping_uses_epoch_millis() {
        let raw = r#"{"type":"ping","timestamp":1750000000000,"serverTime":"2025-06-15T12:26:40Z"}"#;
        match WireEvent::decode(raw) {
            Some(WireEvent::Ping(payload)) => {
                assert_eq!(payload.timestamp, 1_750_000_000_000);
                assert!(payload.server_time.is_some());
            }
            other => panic!("Expected ping event, got {:?}", other),
        }
    }
}
