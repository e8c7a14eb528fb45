use std::process::ExitCode;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_gateway::auth::AuthValidator;
use chat_gateway::config::Config;
use chat_gateway::durable::KafkaDurableProducer;
use chat_gateway::pipeline::MessagePipeline;
use chat_gateway::presence::PresenceEmitter;
use chat_gateway::pubsub::RedisPubSubHub;
use chat_gateway::registry::ConnectionRegistry;
use chat_gateway::state::AppState;

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("chat_gateway={},tower_http=info", config.log_level).into());

    if std::env::var("APP_ENV").as_deref() == Ok("production") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Waits for either SIGINT or SIGTERM. Only SIGINT is portable to non-Unix
/// targets; SIGTERM is Unix-only, matching the deployment target this
/// orchestrator assumes.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config);
    info!(app = %config.app_name, "chat gateway starting");

    // Break the registry/pipeline circular dependency: the registry and the
    // external collaborators come up first, then the pipeline is built with
    // a handle to the already-live registry, and finally the orchestrator
    // gets both.
    let registry = Arc::new(ConnectionRegistry::new());

    let auth: Arc<dyn chat_gateway::auth::TokenValidator> =
        match AuthValidator::connect(config.jwks_url.clone(), config.jwks_refresh_interval).await {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, "failed to initialize auth validator");
                return ExitCode::FAILURE;
            }
        };

    let (durable, mut durable_errors) =
        match KafkaDurableProducer::new(&config.durable_brokers, &config.durable_topic) {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "failed to initialize durable producer");
                return ExitCode::FAILURE;
            }
        };
    let durable: Arc<dyn chat_gateway::durable::DurableProducer> = Arc::new(durable);

    tokio::spawn(async move {
        while let Some(msg) = durable_errors.recv().await {
            error!(error = %msg, "durable bus reported an asynchronous failure");
        }
    });

    let pubsub = match RedisPubSubHub::connect(
        &config.pubsub_addr,
        config.pubsub_password.as_deref(),
        config.pubsub_db,
        &config.deliver_channel,
        &config.presence_channel,
    )
    .await
    {
        Ok(hub) => Arc::new(hub) as Arc<dyn chat_gateway::pubsub::PubSubHub>,
        Err(e) => {
            error!(error = %e, "failed to initialize pubsub hub");
            return ExitCode::FAILURE;
        }
    };

    // Fan-in bridge: events this instance didn't originate arrive here and
    // are reintegrated into local fan-out with no change to the local
    // delivery path `handle_send` already uses.
    let deliver_tx = chat_gateway::bridge::spawn_deliver_bridge(registry.clone());
    let presence_tx = chat_gateway::bridge::spawn_presence_observer();
    if let Err(e) = pubsub.subscribe(deliver_tx, presence_tx).await {
        error!(error = %e, "failed to subscribe to pubsub channels");
        return ExitCode::FAILURE;
    }
    info!("pubsub subscription confirmed");

    let pipeline = Arc::new(MessagePipeline::new(durable.clone(), pubsub.clone(), registry.clone()));
    let presence = Arc::new(PresenceEmitter::new(pubsub.clone(), &config));

    let state = AppState {
        config: config.clone(),
        auth,
        registry,
        pipeline,
        presence,
        durable: durable.clone(),
        pubsub: pubsub.clone(),
        shutdown: tokio_util::sync::CancellationToken::new(),
        connection_tasks: tokio_util::task::TaskTracker::new(),
    };

    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind listener");
            return ExitCode::FAILURE;
        }
    };
    info!(%addr, "listening");

    if let Err(e) = chat_gateway::server::serve(listener, state, shutdown_signal()).await {
        error!(error = %e, "server exited with an error");
        return ExitCode::FAILURE;
    }

    info!("draining durable producer and closing pubsub");
    durable.close().await;
    pubsub.close().await;

    info!("clean shutdown");
    ExitCode::SUCCESS
}
