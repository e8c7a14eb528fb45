use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::LocalDeliveryError;
use crate::events::{GatewayEnvelope, MessageEvent, PresenceEvent};
use crate::registry::ConnectionRegistry;

/// The pub/sub-to-registry fan-in bridge: the critical path that gives
/// cross-instance delivery without any change to local fan-out logic.
/// A deliver event that arrived over pub/sub — meaning some sibling instance
/// accepted it from its own client — is handed to this instance's registry
/// exactly the way a locally-originated event is in
/// [`crate::pipeline::MessagePipeline::handle_send`].
///
/// Spawns the forwarding task and returns the channel its caller should wire
/// as the `on_deliver` argument to [`crate::pubsub::PubSubHub::subscribe`].
pub fn spawn_deliver_bridge(registry: Arc<ConnectionRegistry>) -> mpsc::UnboundedSender<MessageEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let envelope = GatewayEnvelope::message_create(&event);
            match registry.deliver_to_user(&event.to, &envelope).await {
                Ok(_) => crate::metrics::record_delivered_local(),
                Err(LocalDeliveryError::NotConnectedLocally) => {
                    tracing::debug!(event_id = %event.event_id, to = %event.to, "fan-in: recipient not connected locally");
                }
                Err(LocalDeliveryError::AllQueuesSaturated) => {
                    tracing::warn!(event_id = %event.event_id, to = %event.to, "fan-in: recipient's local connections were all saturated");
                }
            }
        }
    });
    tx
}

/// Presence events are surfaced for observability only — the core is not
/// required to act on them. This just logs; callers that want a different
/// sink can drop this and consume the channel themselves.
pub fn spawn_presence_observer() -> mpsc::UnboundedSender<PresenceEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            tracing::debug!(
                user_id = %event.user_id,
                status = ?event.status,
                "presence event received from fleet"
            );
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{InboundMessage, PresenceStatus};
    use crate::registry::ConnectionHandle;
    use uuid::Uuid;

    #[tokio::test]
    async fn deliver_bridge_reintegrates_remote_event_into_local_fanout() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        registry
            .register("bob", Uuid::new_v4(), ConnectionHandle::new(tx))
            .await;

        let bridge_tx = spawn_deliver_bridge(registry);
        let msg = InboundMessage {
            kind: "message.send".into(),
            client_msg_id: "c1".into(),
            to: "bob".into(),
            conversation_id: "k".into(),
            content: "hi".into(),
            attachment_url: None,
        };
        let event = MessageEvent::from_inbound("alice", &msg);
        bridge_tx.send(event).unwrap();

        let envelope = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("bridge should deliver within timeout")
            .expect("channel should not be closed");
        assert_eq!(envelope.kind, "message.create");
    }

    #[tokio::test]
    async fn deliver_bridge_drops_event_for_user_with_no_local_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge_tx = spawn_deliver_bridge(registry.clone());

        let msg = InboundMessage {
            kind: "message.send".into(),
            client_msg_id: "c1".into(),
            to: "ghost".into(),
            conversation_id: "k".into(),
            content: "hi".into(),
            attachment_url: None,
        };
        bridge_tx.send(MessageEvent::from_inbound("alice", &msg)).unwrap();

        // No local connection for "ghost" — nothing to assert on delivery,
        // this just proves the bridge doesn't panic or block forever.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!registry.has_any_connection("ghost").await);
    }

    #[tokio::test]
    async fn presence_observer_drains_without_panicking() {
        let tx = spawn_presence_observer();
        tx.send(PresenceEvent::new("alice", Uuid::new_v4(), PresenceStatus::Online))
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
