use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A frame received from a client. Only `message.send` is recognised for
/// transport; `ping` is an optional application-level keepalive. Any other
/// `type` is answered with an `error` frame and the connection stays open.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "clientMsgId", default)]
    pub client_msg_id: String,
    #[serde(default)]
    pub to: String,
    #[serde(rename = "conversationId", default)]
    pub conversation_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "attachmentUrl", default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
}

pub const MESSAGE_SEND: &str = "message.send";
pub const PING: &str = "ping";

/// Server-internal record of a chat message. Crosses the durable bus and the
/// pubsub hub verbatim as JSON. `event_id` is unique fleet-wide; `from` is
/// always stamped from the authenticated identity, never from the client
/// payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEvent {
    #[serde(rename = "eventId")]
    pub event_id: Uuid,
    #[serde(rename = "clientMsgId")]
    pub client_msg_id: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    pub content: String,
    #[serde(rename = "attachmentUrl", skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(rename = "sentAt")]
    pub sent_at: DateTime<Utc>,
}

impl MessageEvent {
    pub fn from_inbound(from: &str, msg: &InboundMessage) -> Self {
        MessageEvent {
            event_id: Uuid::new_v4(),
            client_msg_id: msg.client_msg_id.clone(),
            from: from.to_string(),
            to: msg.to.clone(),
            conversation_id: msg.conversation_id.clone(),
            content: msg.content.clone(),
            attachment_url: msg.attachment_url.clone(),
            sent_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PresenceStatus {
    Online,
    Offline,
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEvent {
    #[serde(rename = "eventId")]
    pub event_id: Uuid,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "connectionId")]
    pub connection_id: Uuid,
    pub status: PresenceStatus,
    #[serde(rename = "sentAt")]
    pub sent_at: DateTime<Utc>,
}

impl PresenceEvent {
    pub fn new(user_id: &str, connection_id: Uuid, status: PresenceStatus) -> Self {
        PresenceEvent {
            event_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            connection_id,
            status,
            sent_at: Utc::now(),
        }
    }
}

/// Outbound wire envelope: `{"type": <str>, "data": <value>?}`. Every frame
/// the gateway writes is one of these.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub const OUT_MESSAGE_ACK: &str = "message.ack";
pub const OUT_MESSAGE_CREATE: &str = "message.create";
pub const OUT_ERROR: &str = "error";
pub const OUT_PONG: &str = "pong";

impl GatewayEnvelope {
    pub fn new(kind: &str, data: Value) -> Self {
        GatewayEnvelope {
            kind: kind.to_string(),
            data: Some(data),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(OUT_ERROR, serde_json::json!({ "message": message.into() }))
    }

    pub fn message_create(event: &MessageEvent) -> Self {
        Self::new(
            OUT_MESSAGE_CREATE,
            serde_json::to_value(event).expect("MessageEvent always serializes"),
        )
    }

    pub fn message_ack(event: &MessageEvent) -> Self {
        Self::new(
            OUT_MESSAGE_ACK,
            serde_json::json!({
                "clientMsgId": event.client_msg_id,
                "serverMsgId": event.event_id,
                "conversationId": event.conversation_id,
                "sentAt": event.sent_at,
            }),
        )
    }

    pub fn pong() -> Self {
        Self::new(OUT_PONG, serde_json::json!({ "timestamp": Utc::now().timestamp() }))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("GatewayEnvelope always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_inbound_stamps_sender_not_client_supplied() {
        let msg = InboundMessage {
            kind: MESSAGE_SEND.into(),
            client_msg_id: "c1".into(),
            to: "bob".into(),
            conversation_id: "k".into(),
            content: "hi".into(),
            attachment_url: None,
        };
        let event = MessageEvent::from_inbound("alice", &msg);
        assert_eq!(event.from, "alice");
        assert_eq!(event.to, "bob");
        assert_eq!(event.client_msg_id, "c1");
    }

    #[test]
    fn message_create_envelope_wraps_event_under_data() {
        let event = MessageEvent::from_inbound(
            "alice",
            &InboundMessage {
                kind: MESSAGE_SEND.into(),
                client_msg_id: "c1".into(),
                to: "bob".into(),
                conversation_id: "k".into(),
                content: "hi".into(),
                attachment_url: None,
            },
        );
        let envelope = GatewayEnvelope::message_create(&event);
        let json = envelope.to_json();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["type"], "message.create");
        assert_eq!(parsed["data"]["from"], "alice");
        assert_eq!(parsed["data"]["to"], "bob");
    }

    #[test]
    fn ack_envelope_echoes_client_idempotency_id() {
        let event = MessageEvent::from_inbound(
            "alice",
            &InboundMessage {
                kind: MESSAGE_SEND.into(),
                client_msg_id: "c42".into(),
                to: "bob".into(),
                conversation_id: "k".into(),
                content: "hi".into(),
                attachment_url: None,
            },
        );
        let envelope = GatewayEnvelope::message_ack(&event);
        let parsed: Value = serde_json::from_str(&envelope.to_json()).unwrap();
        assert_eq!(parsed["type"], "message.ack");
        assert_eq!(parsed["data"]["clientMsgId"], "c42");
        assert_eq!(parsed["data"]["serverMsgId"], event.event_id.to_string());
    }

    #[test]
    fn error_envelope_carries_message() {
        let envelope = GatewayEnvelope::error("unknown message type: foo");
        let parsed: Value = serde_json::from_str(&envelope.to_json()).unwrap();
        assert_eq!(parsed["type"], "error");
        assert_eq!(parsed["data"]["message"], "unknown message type: foo");
    }
}
