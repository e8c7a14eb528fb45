//! Prometheus counters and gauges for the connection, delivery and presence
//! paths, exposed through the `/metrics` endpoint.

use metrics::{counter, gauge};

pub fn record_message_received() {
    counter!("messages_received_total").increment(1);
}

pub fn record_durable_published() {
    counter!("messages_durable_published_total").increment(1);
}

pub fn record_durable_publish_failed() {
    counter!("messages_durable_publish_failed_total").increment(1);
}

pub fn record_delivered_local() {
    counter!("messages_delivered_local_total").increment(1);
}

pub fn record_delivered_pubsub() {
    counter!("messages_delivered_pubsub_total").increment(1);
}

pub fn record_presence_published(status: &'static str) {
    counter!("presence_published_total", "status" => status).increment(1);
}

pub fn incr_active_connections() {
    gauge!("active_connections").increment(1.0);
}

pub fn decr_active_connections() {
    gauge!("active_connections").decrement(1.0);
}
