use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::LocalDeliveryError;
use crate::events::GatewayEnvelope;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// A single connection's outbound queue. Cloning is cheap — it is just a
/// sender handle; the receiving end is owned by that connection's write
/// pump.
#[derive(Clone)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<GatewayEnvelope>,
}

impl ConnectionHandle {
    pub fn new(outbound: mpsc::Sender<GatewayEnvelope>) -> Self {
        ConnectionHandle { outbound }
    }

    /// Best-effort direct send, bypassing the registry — used by a
    /// connection's own read pump to answer protocol-level frames (`pong`,
    /// malformed-frame `error`) without a round trip through delivery.
    pub async fn send_direct(&self, envelope: GatewayEnvelope) -> bool {
        tokio::time::timeout(SEND_TIMEOUT, self.outbound.send(envelope))
            .await
            .ok()
            .and_then(|r| r.ok())
            .is_some()
    }
}

/// The outcome of delivering one envelope to one user's local connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub delivered_to_at_least_one: bool,
}

/// Registry of every connection this instance currently holds open, keyed
/// by user id and then connection id, so a user may hold several devices
/// open concurrently.
pub struct ConnectionRegistry {
    clients: RwLock<HashMap<String, HashMap<Uuid, ConnectionHandle>>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new connection for `user_id`. Returns whether this is the
    /// user's first local connection — callers use that to decide whether to
    /// emit an ONLINE presence transition.
    pub async fn register(&self, user_id: &str, conn_id: Uuid, handle: ConnectionHandle) -> bool {
        let mut clients = self.clients.write().await;
        let entry = clients.entry(user_id.to_string()).or_default();
        let first_connection = entry.is_empty();
        entry.insert(conn_id, handle);
        first_connection
    }

    /// Remove a connection. Idempotent — unregistering a connection id that
    /// is no longer present (or never was) is a no-op. Returns whether this
    /// was the user's last local connection, so callers can emit OFFLINE
    /// exactly once per transition.
    pub async fn unregister(&self, user_id: &str, conn_id: Uuid) -> bool {
        let mut clients = self.clients.write().await;
        let Some(entry) = clients.get_mut(user_id) else {
            return false;
        };
        if entry.remove(&conn_id).is_none() {
            return false;
        }
        let now_empty = entry.is_empty();
        if now_empty {
            clients.remove(user_id);
        }
        now_empty
    }

    /// Point query: is this specific `(user_id, conn_id)` pair still
    /// registered? Used by per-connection tasks (the heartbeat emitter) that
    /// must stop as soon as *this* connection is unregistered, regardless of
    /// whether the user still holds other devices open.
    pub async fn connected(&self, user_id: &str, conn_id: Uuid) -> bool {
        let clients = self.clients.read().await;
        clients
            .get(user_id)
            .is_some_and(|m| m.contains_key(&conn_id))
    }

    /// Whether `user_id` holds any local connection open at all, regardless
    /// of which one. Used for presence-transition bookkeeping, not the
    /// per-connection point query above.
    pub async fn has_any_connection(&self, user_id: &str) -> bool {
        let clients = self.clients.read().await;
        clients.get(user_id).is_some_and(|m| !m.is_empty())
    }

    /// Snapshot of a user's current connection handles. Taken under a read
    /// lock and then released immediately — callers never iterate while
    /// holding the registry lock.
    async fn snapshot(&self, user_id: &str) -> Vec<ConnectionHandle> {
        let clients = self.clients.read().await;
        clients
            .get(user_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver an envelope to every local connection a user holds open.
    /// `NotConnectedLocally` is the expected outcome when the user simply
    /// isn't connected to this instance; `AllQueuesSaturated` means they are
    /// connected but every queue was full even after the per-send timeout.
    pub async fn deliver_to_user(
        &self,
        user_id: &str,
        envelope: &GatewayEnvelope,
    ) -> Result<DeliveryOutcome, LocalDeliveryError> {
        let handles = self.snapshot(user_id).await;
        if handles.is_empty() {
            return Err(LocalDeliveryError::NotConnectedLocally);
        }

        let mut delivered = false;
        for handle in handles {
            let sent = tokio::time::timeout(SEND_TIMEOUT, handle.outbound.send(envelope.clone()))
                .await
                .ok()
                .and_then(|r| r.ok())
                .is_some();
            delivered |= sent;
        }

        if delivered {
            Ok(DeliveryOutcome {
                delivered_to_at_least_one: true,
            })
        } else {
            Err(LocalDeliveryError::AllQueuesSaturated)
        }
    }
}
