// Each integration test file is a separate binary; helpers not used in every
// binary would otherwise trigger dead_code warnings from clippy.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chat_gateway::auth::mock::StaticTokenValidator;
use chat_gateway::config::Config;
use chat_gateway::durable::mock::MockDurableProducer;
use chat_gateway::pipeline::MessagePipeline;
use chat_gateway::presence::PresenceEmitter;
use chat_gateway::pubsub::mock::MockPubSubHub;
use chat_gateway::registry::ConnectionRegistry;
use chat_gateway::state::AppState;

pub fn test_config() -> Config {
    Config {
        app_name: "chat-gateway-test".into(),
        server_host: "127.0.0.1".into(),
        server_port: 0,
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
        presence_heartbeat_enabled: false,
        presence_heartbeat_interval: Duration::from_secs(30),
        shutdown_budget: Duration::from_secs(15),
        connection_close_budget: Duration::from_secs(10),
    }
}

/// A fully wired `AppState` backed by in-memory fakes for the durable bus
/// and pub/sub hub, and a fixed token→user map instead of a real JWKS
/// endpoint, so the whole upgrade/frame-exchange path can be driven against
/// a real bound `TcpListener` without any external services running.
pub struct TestGateway {
    pub state: AppState,
    pub durable: Arc<MockDurableProducer>,
    pub pubsub: Arc<MockPubSubHub>,
}

pub fn build_test_gateway(tokens: StaticTokenValidator) -> TestGateway {
    let config = test_config();
    let registry = Arc::new(ConnectionRegistry::new());
    let durable = Arc::new(MockDurableProducer::default());
    let pubsub = Arc::new(MockPubSubHub::default());
    let pipeline = Arc::new(MessagePipeline::new(
        durable.clone() as Arc<dyn chat_gateway::durable::DurableProducer>,
        pubsub.clone() as Arc<dyn chat_gateway::pubsub::PubSubHub>,
        registry.clone(),
    ));
    let presence = Arc::new(PresenceEmitter::new(
        pubsub.clone() as Arc<dyn chat_gateway::pubsub::PubSubHub>,
        &config,
    ));

    let state = AppState {
        config,
        auth: Arc::new(tokens),
        registry,
        pipeline,
        presence,
        durable: durable.clone() as Arc<dyn chat_gateway::durable::DurableProducer>,
        pubsub: pubsub.clone() as Arc<dyn chat_gateway::pubsub::PubSubHub>,
        shutdown: tokio_util::sync::CancellationToken::new(),
        connection_tasks: tokio_util::task::TaskTracker::new(),
    };

    TestGateway { state, durable, pubsub }
}

/// Binds a loopback listener, serves the gateway's router on it, and returns
/// the `ws://` base URL clients should connect to. The server task is
/// detached — tests run for the process lifetime of the test binary, so
/// there's nothing to join.
pub async fn spawn_gateway(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let addr = listener.local_addr().expect("listener has no local addr");

    let router = chat_gateway::server::build_router(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .ok();
    });

    format!("ws://{addr}")
}
