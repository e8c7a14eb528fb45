use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::events::{GatewayEnvelope, InboundMessage};
use crate::registry::ConnectionHandle;

/// Keepalive and backpressure bounds for one connection's lifetime.
const WRITE_WAIT: Duration = Duration::from_secs(10);
const PONG_WAIT: Duration = Duration::from_secs(60);
const PING_PERIOD: Duration = Duration::from_secs(54);
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Invoked for every well-formed inbound frame, and awaited to completion
/// before the read pump reads its next frame. `reply` is this connection's
/// own outbound queue — the handler uses it for frames addressed back to the
/// sender alone (ack, pong); anything addressed to other users goes through
/// the registry, which the handler closes over separately.
///
/// Frames are processed strictly one at a time, in the order the read pump
/// decodes them — this is what gives the durable producer its per-conversation
/// submission-order guarantee (spec §5(b)): two `message.send` frames for the
/// same conversation can never race each other into `publish`.
pub type InboundHandler =
    Arc<dyn Fn(String, InboundMessage, ConnectionHandle) -> BoxFuture<'static, ()> + Send + Sync>;

/// Drives one accepted WebSocket through its whole lifetime: a read pump, a
/// write pump and a heartbeat ticker running concurrently, tied together by
/// a shared cancellation token so any one of them finishing (client hangup,
/// server shutdown, protocol violation) unwinds the other two.
///
/// Registration/unregistration and the resulting presence transitions are
/// the caller's responsibility — this module only owns the socket.
pub struct Connection {
    pub id: Uuid,
    pub user_id: String,
}

impl Connection {
    /// Allocates the connection's bounded outbound queue and returns the
    /// handle the caller must register with the [`ConnectionRegistry`]
    /// *before* calling [`Connection::run`] — ordering matters so that a
    /// message addressed to this user can never race the registration.
    ///
    /// [`ConnectionRegistry`]: crate::registry::ConnectionRegistry
    pub fn new(user_id: String) -> (Self, ConnectionHandle, mpsc::Receiver<GatewayEnvelope>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let conn = Connection {
            id: Uuid::new_v4(),
            user_id,
        };
        (conn, ConnectionHandle::new(tx), rx)
    }

    /// Run the connection to completion. `on_inbound` is called for every
    /// decoded client frame; malformed frames get a one-shot `error` reply
    /// and the connection stays open — only a transport-level failure or an
    /// oversized frame ends the connection.
    ///
    /// `reply` is this same connection's own handle (the other end of
    /// `outbound_rx`), handed to `on_inbound` so it can answer the sender
    /// directly without a registry round trip, and used here for the
    /// read pump's own protocol-level replies (decode errors).
    pub async fn run(
        self,
        socket: WebSocket,
        mut outbound_rx: mpsc::Receiver<GatewayEnvelope>,
        reply: ConnectionHandle,
        shutdown: CancellationToken,
        on_inbound: InboundHandler,
    ) {
        let (mut ws_sender, mut ws_receiver) = socket.split();

        let write_shutdown = shutdown.clone();
        let mut write_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_PERIOD);
            ticker.tick().await; // first tick fires immediately; nothing to send yet
            loop {
                tokio::select! {
                    _ = write_shutdown.cancelled() => {
                        let _ = tokio::time::timeout(WRITE_WAIT, ws_sender.send(Message::Close(None))).await;
                        break;
                    }
                    maybe_envelope = outbound_rx.recv() => {
                        let Some(envelope) = maybe_envelope else {
                            let _ = tokio::time::timeout(WRITE_WAIT, ws_sender.send(Message::Close(None))).await;
                            break;
                        };
                        let sent = tokio::time::timeout(
                            WRITE_WAIT,
                            ws_sender.send(Message::Text(envelope.to_json())),
                        ).await;
                        if !matches!(sent, Ok(Ok(()))) {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let sent = tokio::time::timeout(WRITE_WAIT, ws_sender.send(Message::Ping(Vec::new()))).await;
                        if !matches!(sent, Ok(Ok(()))) {
                            break;
                        }
                    }
                }
            }
        });

        let read_shutdown = shutdown.clone();
        let conn_id = self.id;
        let user_id = self.user_id.clone();
        let mut read_task = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = read_shutdown.cancelled() => break,
                    frame = tokio::time::timeout(PONG_WAIT, ws_receiver.next()) => frame,
                };

                let Ok(frame) = next else {
                    tracing::debug!(%user_id, %conn_id, "no activity within the read deadline; closing");
                    break;
                };

                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_MESSAGE_SIZE {
                            tracing::warn!(%user_id, %conn_id, "oversized frame; closing connection");
                            break;
                        }
                        match serde_json::from_str::<InboundMessage>(&text) {
                            Ok(msg) => on_inbound(user_id.clone(), msg, reply.clone()).await,
                            Err(e) => {
                                tracing::debug!(%user_id, %conn_id, error = %e, "malformed frame");
                                let _ = reply
                                    .send_direct(GatewayEnvelope::error("malformed message frame"))
                                    .await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary/Ping/Pong frames: axum answers Ping automatically and
                        // any frame resets the read deadline, so there's nothing else to do.
                    }
                    Some(Err(e)) => {
                        tracing::debug!(%user_id, %conn_id, error = ?e, "read error; closing");
                        break;
                    }
                }
            }
            read_shutdown.cancel();
        });

        tokio::select! {
            _ = &mut write_task => read_task.abort(),
            _ = &mut read_task => write_task.abort(),
        }

        shutdown.cancel();
    }
}
