use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tokio::sync::mpsc;

use crate::error::DurablePublishError;
use crate::events::MessageEvent;

const ACCEPTANCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Fire-and-forget-from-the-caller's-perspective durable event producer.
///
/// `publish` only guarantees the event was handed off into the producer's
/// internal buffer within the acceptance timeout; broker acknowledgement and
/// retry happen in the background, and failures there surface through an
/// out-of-band error channel rather than through `publish`'s return value.
#[async_trait]
pub trait DurableProducer: Send + Sync {
    async fn publish(&self, event: &MessageEvent) -> Result<(), DurablePublishError>;

    /// Drain pending handoffs, then release any underlying client resources.
    async fn close(&self);
}

/// `rdkafka`-backed implementation. The conversation id is the partition
/// key, preserving per-conversation submission order on the bus. Compression
/// and bounded retry are configured on the underlying librdkafka client.
pub struct KafkaDurableProducer {
    producer: FutureProducer,
    topic: String,
    error_tx: mpsc::UnboundedSender<String>,
}

impl KafkaDurableProducer {
    pub fn new(brokers: &[String], topic: &str) -> Result<(Self, mpsc::UnboundedReceiver<String>), String> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("message.send.max.retries", "5")
            .set("retry.backoff.ms", "100")
            .set("compression.type", "gzip")
            .set("acks", "1")
            .create()
            .map_err(|e| format!("failed to create durable-bus producer: {e}"))?;

        let (error_tx, error_rx) = mpsc::unbounded_channel();

        Ok((
            KafkaDurableProducer {
                producer,
                topic: topic.to_string(),
                error_tx,
            },
            error_rx,
        ))
    }
}

#[async_trait]
impl DurableProducer for KafkaDurableProducer {
    async fn publish(&self, event: &MessageEvent) -> Result<(), DurablePublishError> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| DurablePublishError::Rejected(e.to_string()))?;

        let record: FutureRecord<'_, str, [u8]> = FutureRecord::to(&self.topic)
            .key(&event.conversation_id)
            .payload(&payload);

        // `send` enqueues the record and resolves when the broker
        // acknowledges it (or the client gives up after its configured
        // retries); we bound just the handoff+ack round trip here, not an
        // unbounded wait.
        match tokio::time::timeout(ACCEPTANCE_TIMEOUT, self.producer.send(record, Timeout::Never))
            .await
        {
            Ok(Ok(_delivery)) => Ok(()),
            Ok(Err((kafka_err, _owned_msg))) => {
                let message = kafka_err.to_string();
                let _ = self.error_tx.send(message.clone());
                Err(DurablePublishError::Rejected(message))
            }
            Err(_elapsed) => {
                let _ = self.error_tx.send("durable publish acceptance timed out".into());
                Err(DurablePublishError::Timeout)
            }
        }
    }

    async fn close(&self) {
        // `flush` drains librdkafka's internal queue before returning.
        let _ = self.producer.flush(Duration::from_secs(10));
    }
}

/// In-memory fakes for the durable bus, used by unit tests in this crate and
/// by the integration test suite under `tests/` (no broker is available in
/// CI, so these stand in for `rdkafka`).
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory producer used by pipeline/orchestrator tests. Records every
    /// accepted event in submission order and can be told to fail the next
    /// N publishes, to exercise the pipeline's abort-on-durable-failure path.
    #[derive(Default)]
    pub struct MockDurableProducer {
        pub accepted: Mutex<Vec<MessageEvent>>,
        pub fail_next: AtomicUsize,
        pub closed: AtomicUsize,
        /// If set, the *first* publish this producer sees sleeps this long
        /// before recording — used to prove the pipeline serializes frames
        /// from one connection rather than racing them in, since a reordering
        /// regression would let a faster second publish land first.
        pub delay_first_publish: Mutex<Option<Duration>>,
    }

    impl MockDurableProducer {
        pub fn fail_next_n(&self, n: usize) {
            self.fail_next.store(n, Ordering::SeqCst);
        }

        pub fn delay_first_publish_by(&self, delay: Duration) {
            *self.delay_first_publish.lock().unwrap() = Some(delay);
        }
    }

    #[async_trait]
    impl DurableProducer for MockDurableProducer {
        async fn publish(&self, event: &MessageEvent) -> Result<(), DurablePublishError> {
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
                return Err(DurablePublishError::Rejected("mock failure".into()));
            }
            if let Some(delay) = self.delay_first_publish.lock().unwrap().take() {
                tokio::time::sleep(delay).await;
            }
            self.accepted.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
