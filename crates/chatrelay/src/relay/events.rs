//! Client-facing wire types
//!
//! Every WebSocket frame is a JSON envelope `{"event": <name>, "data": ...}`.
//! Clients send `message` (a [`DeliveryRequest`]) and `stop` (a
//! conversation key); the relay answers with `message` frames carrying an
//! [`OutboundEvent`].

use serde::{Deserialize, Serialize};

use super::prompt::Message;
use super::tracker::ConversationKey;

/// An id as it may appear on the wire: a JSON string or number
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    Text(String),
    Number(serde_json::Number),
}

impl From<WireId> for String {
    fn from(id: WireId) -> Self {
        match id {
            WireId::Text(text) => text,
            WireId::Number(number) => number.to_string(),
        }
    }
}

impl From<WireId> for ConversationKey {
    fn from(id: WireId) -> Self {
        ConversationKey::new(String::from(id))
    }
}

/// Identifies the client-visible event stream of one delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "WireId")]
pub struct DeliveryId(String);

impl DeliveryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<WireId> for DeliveryId {
    fn from(id: WireId) -> Self {
        DeliveryId(String::from(id))
    }
}

impl From<DeliveryId> for String {
    fn from(id: DeliveryId) -> Self {
        id.0
    }
}

impl From<&str> for DeliveryId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One inbound submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRequest {
    #[serde(rename = "id", alias = "deliveryId")]
    pub delivery_id: DeliveryId,
    #[serde(rename = "mid", alias = "conversationKey")]
    pub conversation_key: ConversationKey,
    #[serde(rename = "stream", alias = "streaming", default)]
    pub streaming: bool,
    #[serde(rename = "messages", alias = "history", default)]
    pub history: Vec<Message>,
    #[serde(rename = "system", alias = "systemPrompt", default)]
    pub system_prompt: String,
}

/// Position of an outbound event within a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// First streamed delta
    Start,
    /// Any later streamed delta
    Middle,
    /// End of a stream; content is empty
    End,
    /// A complete, non-streamed reply (or the cap-exceeded apology)
    NonStream,
}

/// An event delivered to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub id: DeliveryId,
}

impl OutboundEvent {
    pub fn new(kind: EventKind, content: impl Into<String>, id: DeliveryId) -> Self {
        Self {
            content: content.into(),
            kind,
            id,
        }
    }
}

/// Frames accepted from clients
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ClientFrame {
    Message(DeliveryRequest),
    Stop(ConversationKey),
}

/// Frames sent to clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ServerFrame {
    Message(OutboundEvent),
}

/// Destination for outbound events
///
/// Implementations must not block; a slow or vanished client may lose
/// events but must never stall the request that produced them.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OutboundEvent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::prompt::Role;

    #[test]
    fn test_parse_message_frame() {
        let raw = r#"{
            "event": "message",
            "data": {
                "id": "d-1",
                "stream": true,
                "messages": [{"role": "user", "content": "hello"}],
                "mid": "conv-1",
                "system": "Be brief."
            }
        }"#;

        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        let ClientFrame::Message(request) = frame else {
            panic!("expected message frame");
        };

        assert_eq!(request.delivery_id.as_str(), "d-1");
        assert_eq!(request.conversation_key.as_str(), "conv-1");
        assert!(request.streaming);
        assert_eq!(request.history.len(), 1);
        assert_eq!(request.history[0].role, Role::User);
        assert_eq!(request.system_prompt, "Be brief.");
    }

    #[test]
    fn test_parse_message_frame_with_camel_case_aliases_and_numbers() {
        let raw = r#"{
            "event": "message",
            "data": {
                "deliveryId": 17,
                "conversationKey": 42,
                "messages": []
            }
        }"#;

        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        let ClientFrame::Message(request) = frame else {
            panic!("expected message frame");
        };

        assert_eq!(request.delivery_id.as_str(), "17");
        assert_eq!(request.conversation_key.as_str(), "42");
        assert!(!request.streaming);
        assert_eq!(request.system_prompt, "");
    }

    #[test]
    fn test_parse_stop_frame() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"event":"stop","data":"conv-1"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Stop(k) if k.as_str() == "conv-1"));

        let frame: ClientFrame = serde_json::from_str(r#"{"event":"stop","data":7}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Stop(k) if k.as_str() == "7"));
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let result = serde_json::from_str::<ClientFrame>(r#"{"event":"typing","data":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_server_frame_shape() {
        let frame = ServerFrame::Message(OutboundEvent::new(
            EventKind::NonStream,
            "hi",
            DeliveryId::from("d-1"),
        ));

        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "event": "message",
                "data": {"content": "hi", "type": "nonstream", "id": "d-1"}
            })
        );
    }

    #[test]
    fn test_event_kind_names() {
        let names: Vec<String> = [
            EventKind::Start,
            EventKind::Middle,
            EventKind::End,
            EventKind::NonStream,
        ]
        .iter()
        .map(|k| serde_json::to_value(k).unwrap().as_str().unwrap().to_string())
        .collect();

        assert_eq!(names, ["start", "middle", "end", "nonstream"]);
    }
}
