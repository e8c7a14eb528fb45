use std::sync::Arc;

use crate::durable::DurableProducer;
use crate::error::LocalDeliveryError;
use crate::events::{
    GatewayEnvelope, InboundMessage, MessageEvent, MESSAGE_SEND, PING,
};
use crate::pubsub::PubSubHub;
use crate::registry::ConnectionHandle;
use crate::registry::ConnectionRegistry;

/// Orchestrates the five ordered steps a `message.send` frame goes through:
/// synthesize the canonical event, hand it to the durable bus (gating — a
/// failure here aborts the whole pipeline), fan it out over pubsub and to
/// any local connections (both best-effort), then ack the sender.
/// `ping`/unrecognized frames are handled without touching the bus at all.
pub struct MessagePipeline {
    durable: Arc<dyn DurableProducer>,
    pubsub: Arc<dyn PubSubHub>,
    registry: Arc<ConnectionRegistry>,
}

impl MessagePipeline {
    pub fn new(
        durable: Arc<dyn DurableProducer>,
        pubsub: Arc<dyn PubSubHub>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        MessagePipeline {
            durable,
            pubsub,
            registry,
        }
    }

    /// Entry point wired as the connection module's `on_inbound` callback.
    pub async fn handle(&self, from: String, msg: InboundMessage, reply: ConnectionHandle) {
        match msg.kind.as_str() {
            MESSAGE_SEND => self.handle_send(&from, msg, reply).await,
            PING => {
                let _ = reply.send_direct(GatewayEnvelope::pong()).await;
            }
            other => {
                let _ = reply
                    .send_direct(GatewayEnvelope::error(format!(
                        "unknown message type: {other}"
                    )))
                    .await;
            }
        }
    }

    async fn handle_send(&self, from: &str, msg: InboundMessage, reply: ConnectionHandle) {
        let event = MessageEvent::from_inbound(from, &msg);
        crate::metrics::record_message_received();

        if let Err(e) = self.durable.publish(&event).await {
            tracing::warn!(error = %e, event_id = %event.event_id, "durable publish failed; aborting pipeline");
            crate::metrics::record_durable_publish_failed();
            let _ = reply
                .send_direct(GatewayEnvelope::error("failed to send message"))
                .await;
            return;
        }
        crate::metrics::record_durable_published();

        if let Err(e) = self.pubsub.publish_deliver(&event).await {
            tracing::warn!(error = %e, event_id = %event.event_id, "pubsub publish failed; continuing");
        } else {
            crate::metrics::record_delivered_pubsub();
        }

        match self
            .registry
            .deliver_to_user(&event.to, &GatewayEnvelope::message_create(&event))
            .await
        {
            Ok(_) => crate::metrics::record_delivered_local(),
            Err(LocalDeliveryError::NotConnectedLocally) => {
                tracing::debug!(event_id = %event.event_id, to = %event.to, "recipient not connected locally");
            }
            Err(LocalDeliveryError::AllQueuesSaturated) => {
                tracing::warn!(event_id = %event.event_id, to = %event.to, "recipient's local connections were all saturated");
            }
        }

        let _ = reply.send_direct(GatewayEnvelope::message_ack(&event)).await;
    }
}
