use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::Config;
use crate::events::{PresenceEvent, PresenceStatus};
use crate::pubsub::PubSubHub;
use crate::registry::ConnectionRegistry;

/// Publishes ONLINE/OFFLINE presence transitions and, if enabled, a periodic
/// HEARTBEAT while a connection stays open.
pub struct PresenceEmitter {
    pubsub: Arc<dyn PubSubHub>,
    heartbeat_enabled: bool,
    heartbeat_interval: Duration,
}

impl PresenceEmitter {
    pub fn new(pubsub: Arc<dyn PubSubHub>, config: &Config) -> Self {
        PresenceEmitter {
            pubsub,
            heartbeat_enabled: config.presence_heartbeat_enabled,
            heartbeat_interval: config.presence_heartbeat_interval,
        }
    }

    pub async fn emit(&self, user_id: &str, connection_id: Uuid, status: PresenceStatus) {
        let event = PresenceEvent::new(user_id, connection_id, status);
        match self.pubsub.publish_presence(&event).await {
            Ok(()) => crate::metrics::record_presence_published(status_label(status)),
            Err(e) => tracing::warn!(error = %e, %user_id, ?status, "presence publish failed"),
        }
    }

    /// Spawns a task that periodically re-publishes HEARTBEAT for as long as
    /// `registry` still reports the connection as live. A no-op — returns
    /// immediately without spawning — when heartbeats are disabled.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        registry: Arc<ConnectionRegistry>,
        user_id: String,
        connection_id: Uuid,
        shutdown: tokio_util::sync::CancellationToken,
    ) {
        if !self.heartbeat_enabled {
            return;
        }
        let emitter = self.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if !registry.connected(&user_id, connection_id).await {
                            break;
                        }
                        emitter.emit(&user_id, connection_id, PresenceStatus::Heartbeat).await;
                    }
                }
            }
        });
    }
}

fn status_label(status: PresenceStatus) -> &'static str {
    match status {
        PresenceStatus::Online => "online",
        PresenceStatus::Offline => "offline",
        PresenceStatus::Heartbeat => "heartbeat",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::mock::MockPubSubHub;

    fn test_config() -> Config {
        Config {
            app_name: "test".into(),
            server_host: "127.0.0.1".into(),
            server_port: 7200,
            jwks_url: "http://localhost/jwks.json".into(),
            jwks_refresh_interval: Duration::from_secs(900),
            durable_brokers: vec!["localhost:9092".into()],
            durable_topic: "chat-messages".into(),
            pubsub_addr: "localhost:6379".into(),
            pubsub_password: None,
            pubsub_db: 0,
            deliver_channel: "message-deliver".into(),
            presence_channel: "presence-events".into(),
            log_level: "info".into(),
            presence_heartbeat_enabled: true,
            presence_heartbeat_interval: Duration::from_secs(30),
            shutdown_budget: Duration::from_secs(15),
            connection_close_budget: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn emit_publishes_a_presence_event() {
        let pubsub = Arc::new(MockPubSubHub::default());
        let emitter = PresenceEmitter::new(pubsub.clone(), &test_config());
        emitter.emit("alice", Uuid::new_v4(), PresenceStatus::Online).await;
        let published = pubsub.presences.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].status, PresenceStatus::Online);
    }

    /// User "bob" has two devices, b1 and b2. b1 disconnects while b2 stays
    /// open. b1's heartbeat task must exit promptly — it must not keep
    /// emitting HEARTBEAT events tagged with b1's now-dead connection id just
    /// because bob still has a connection (b2) open somewhere.
    #[tokio::test]
    async fn heartbeat_checks_its_own_connection_not_the_users_connection_count() {
        use crate::registry::{ConnectionHandle, ConnectionRegistry};
        use tokio::sync::mpsc;
        use tokio_util::sync::CancellationToken;

        let mut config = test_config();
        config.presence_heartbeat_interval = Duration::from_millis(10);
        let pubsub = Arc::new(MockPubSubHub::default());
        let emitter = Arc::new(PresenceEmitter::new(pubsub.clone(), &config));
        let registry = Arc::new(ConnectionRegistry::new());

        let b1 = Uuid::new_v4();
        let b2 = Uuid::new_v4();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        registry.register("bob", b1, ConnectionHandle::new(tx1)).await;
        registry.register("bob", b2, ConnectionHandle::new(tx2)).await;

        emitter.spawn_heartbeat(registry.clone(), "bob".into(), b1, CancellationToken::new());
        emitter.spawn_heartbeat(registry.clone(), "bob".into(), b2, CancellationToken::new());

        // Let a couple of heartbeat ticks land for both connections.
        tokio::time::sleep(Duration::from_millis(35)).await;

        // b1 disconnects; bob still has b2 open, so `has_any_connection` would
        // stay true — the heartbeat must key off `connected(user, conn_id)`.
        registry.unregister("bob", b1).await;

        let count_before = pubsub.presences.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let count_after = pubsub.presences.lock().unwrap().len();

        assert!(count_after > count_before, "b2's heartbeat should still be ticking");

        let presences = pubsub.presences.lock().unwrap();
        assert!(
            presences
                .iter()
                .filter(|e| e.connection_id == b1)
                .all(|e| e.status != PresenceStatus::Heartbeat),
            "b1 must not emit any HEARTBEAT after it unregistered"
        );
        assert!(
            presences
                .iter()
                .any(|e| e.connection_id == b2 && e.status == PresenceStatus::Heartbeat),
            "b2 should still be emitting HEARTBEAT"
        );
    }
}
