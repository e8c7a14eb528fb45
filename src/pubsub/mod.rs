use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::events::{MessageEvent, PresenceEvent};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Fleet-wide fan-out hub. Every instance publishes deliveries and presence
/// transitions here so that sibling instances can forward them to whichever
/// connections they happen to hold locally.
#[async_trait]
pub trait PubSubHub: Send + Sync {
    async fn publish_deliver(&self, event: &MessageEvent) -> Result<(), GatewayError>;
    async fn publish_presence(&self, event: &PresenceEvent) -> Result<(), GatewayError>;

    /// Start the subscriber loop, invoking `on_deliver`/`on_presence` for
    /// every decoded message. Must not return successfully until the
    /// subscription is confirmed live with the broker — a caller that starts
    /// publishing the instant this returns must not be able to miss a
    /// message still in flight to this instance.
    async fn subscribe(
        &self,
        on_deliver: mpsc::UnboundedSender<MessageEvent>,
        on_presence: mpsc::UnboundedSender<PresenceEvent>,
    ) -> Result<(), GatewayError>;

    /// Cheap reachability probe used by the `/health` endpoint — must not
    /// publish or subscribe to anything observable by other instances.
    async fn ping(&self) -> Result<(), GatewayError>;

    async fn close(&self);
}

/// `redis`-backed implementation. Publishing goes over a multiplexed
/// connection shared by every caller; the subscriber side owns a dedicated
/// connection and pushes decoded payloads onto bounded channels the caller
/// drains.
pub struct RedisPubSubHub {
    conn: MultiplexedConnection,
    client: redis::Client,
    deliver_channel: String,
    presence_channel: String,
    done: Arc<tokio::sync::Notify>,
}

impl RedisPubSubHub {
    pub async fn connect(
        addr: &str,
        password: Option<&str>,
        db: i64,
        deliver_channel: &str,
        presence_channel: &str,
    ) -> Result<Self, String> {
        let url = build_redis_url(addr, password, db);
        let client = redis::Client::open(url).map_err(|e| format!("invalid pubsub address: {e}"))?;

        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| format!("failed to connect to pubsub: {e}"))?;

        Ok(RedisPubSubHub {
            conn,
            client,
            deliver_channel: deliver_channel.to_string(),
            presence_channel: presence_channel.to_string(),
            done: Arc::new(tokio::sync::Notify::new()),
        })
    }
}

fn build_redis_url(addr: &str, password: Option<&str>, db: i64) -> String {
    match password {
        Some(p) if !p.is_empty() => format!("redis://:{p}@{addr}/{db}"),
        _ => format!("redis://{addr}/{db}"),
    }
}

#[async_trait]
impl PubSubHub for RedisPubSubHub {
    async fn publish_deliver(&self, event: &MessageEvent) -> Result<(), GatewayError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| GatewayError::PubSubPublish(e.to_string()))?;
        let mut conn = self.conn.clone();
        tokio::time::timeout(
            PUBLISH_TIMEOUT,
            conn.publish::<_, _, ()>(&self.deliver_channel, payload),
        )
        .await
        .map_err(|_| GatewayError::PubSubPublish("publish timed out".into()))?
        .map_err(|e| GatewayError::PubSubPublish(e.to_string()))
    }

    async fn publish_presence(&self, event: &PresenceEvent) -> Result<(), GatewayError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| GatewayError::PubSubPublish(e.to_string()))?;
        let mut conn = self.conn.clone();
        tokio::time::timeout(
            PUBLISH_TIMEOUT,
            conn.publish::<_, _, ()>(&self.presence_channel, payload),
        )
        .await
        .map_err(|_| GatewayError::PubSubPublish("publish timed out".into()))?
        .map_err(|e| GatewayError::PubSubPublish(e.to_string()))
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| GatewayError::PubSubPublish(e.to_string()))
    }

    async fn subscribe(
        &self,
        on_deliver: mpsc::UnboundedSender<MessageEvent>,
        on_presence: mpsc::UnboundedSender<PresenceEvent>,
    ) -> Result<(), GatewayError> {
        let pubsub_conn = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| GatewayError::PubSubPublish(e.to_string()))?;

        let mut pubsub_conn = pubsub_conn;
        pubsub_conn
            .subscribe(&self.deliver_channel)
            .await
            .map_err(|e| GatewayError::PubSubPublish(e.to_string()))?;
        pubsub_conn
            .subscribe(&self.presence_channel)
            .await
            .map_err(|e| GatewayError::PubSubPublish(e.to_string()))?;

        // Both `subscribe` calls above round-trip with the broker before
        // returning, so by this point the subscription is confirmed live.

        let deliver_channel = self.deliver_channel.clone();
        let presence_channel = self.presence_channel.clone();
        let done = self.done.clone();

        tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = pubsub_conn.on_message();
            loop {
                tokio::select! {
                    _ = done.notified() => {
                        tracing::debug!("pubsub subscriber shutting down");
                        break;
                    }
                    maybe_msg = stream.next() => {
                        let Some(msg) = maybe_msg else {
                            tracing::warn!("pubsub message stream closed");
                            break;
                        };
                        let channel = msg.get_channel_name().to_string();
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping pubsub message with unreadable payload");
                                continue;
                            }
                        };

                        if channel == deliver_channel {
                            match serde_json::from_str::<MessageEvent>(&payload) {
                                Ok(event) => { let _ = on_deliver.send(event); }
                                Err(e) => tracing::warn!(error = %e, "dropping malformed deliver event"),
                            }
                        } else if channel == presence_channel {
                            match serde_json::from_str::<PresenceEvent>(&payload) {
                                Ok(event) => { let _ = on_presence.send(event); }
                                Err(e) => tracing::warn!(error = %e, "dropping malformed presence event"),
                            }
                        } else {
                            tracing::debug!(%channel, "ignoring message on unrecognized pubsub channel");
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn close(&self) {
        self.done.notify_waiters();
    }
}

/// In-memory fakes for the pub/sub hub, used by unit tests in this crate and
/// by the integration test suite under `tests/` (no broker is available in
/// CI, so these stand in for `redis` the same way the durable bus's `mock`
/// module stands in for `rdkafka`).
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// In-memory hub used by pipeline/orchestrator tests. Delivers/presence
    /// published here are recorded, not actually fanned out anywhere — tests
    /// that need cross-instance fan-out semantics feed events through
    /// `on_deliver`/`on_presence` directly.
    #[derive(Default)]
    pub struct MockPubSubHub {
        pub delivered: Mutex<Vec<MessageEvent>>,
        pub presences: Mutex<Vec<PresenceEvent>>,
        pub fail_publishes: std::sync::atomic::AtomicBool,
    }

    impl MockPubSubHub {
        pub fn set_fail_publishes(&self, fail: bool) {
            self.fail_publishes
                .store(fail, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl PubSubHub for MockPubSubHub {
        async fn publish_deliver(&self, event: &MessageEvent) -> Result<(), GatewayError> {
            if self.fail_publishes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(GatewayError::PubSubPublish("mock failure".into()));
            }
            self.delivered.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn publish_presence(&self, event: &PresenceEvent) -> Result<(), GatewayError> {
            if self.fail_publishes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(GatewayError::PubSubPublish("mock failure".into()));
            }
            self.presences.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn subscribe(
            &self,
            _on_deliver: mpsc::UnboundedSender<MessageEvent>,
            _on_presence: mpsc::UnboundedSender<PresenceEvent>,
        ) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn ping(&self) -> Result<(), GatewayError> {
            if self.fail_publishes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(GatewayError::PubSubPublish("mock failure".into()));
            }
            Ok(())
        }

        async fn close(&self) {}
    }
}
