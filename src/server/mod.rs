use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use axum_prometheus::PrometheusMetricLayer;
use serde_json::json;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer, trace::TraceLayer};

use crate::auth::extract_token;
use crate::connection::Connection;
use crate::events::PresenceStatus;
use crate::state::AppState;

/// `GET /socket/connect?token=<jwt>` — the gateway's only client-facing
/// surface. The bearer token is validated before the upgrade is accepted;
/// invalid tokens get a plain 401 and no socket is ever opened, no presence
/// event is ever published.
#[derive(Debug, serde::Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

async fn connect_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let token = match extract_token(params.token.as_deref(), auth_header) {
        Some(t) => t,
        None => return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response(),
    };

    let user_id = match state.auth.validate(&token).await {
        Ok(uid) => uid,
        Err(e) => return e.into_response(),
    };

    // Tracked so the orchestrator's shutdown sequence can wait for every
    // open connection to actually finish, not just signal them.
    let tracker = state.connection_tasks.clone();
    ws.max_message_size(crate::connection::MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            tracker.spawn(handle_socket(socket, user_id, state));
        })
}

async fn handle_socket(socket: axum::extract::ws::WebSocket, user_id: String, state: AppState) {
    let (conn, handle, outbound_rx) = Connection::new(user_id.clone());
    let conn_id = conn.id;

    let first_connection = state.registry.register(&user_id, conn_id, handle.clone()).await;
    crate::metrics::incr_active_connections();

    if first_connection {
        state.presence.emit(&user_id, conn_id, PresenceStatus::Online).await;
    }

    // Derived from the orchestrator's token so a single shutdown cancels
    // every open connection at once.
    let shutdown = state.shutdown.child_token();
    state
        .presence
        .spawn_heartbeat(state.registry.clone(), user_id.clone(), conn_id, shutdown.clone());

    // Boxed and awaited in-line by the read pump rather than spawned — frames
    // for one connection must reach the pipeline strictly in the order the
    // read pump decoded them, so the durable producer sees `message.send`
    // frames for the same conversation in submission order (spec §5(b)).
    let pipeline = state.pipeline.clone();
    let on_inbound: crate::connection::InboundHandler = Arc::new(move |from, msg, reply| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            pipeline.handle(from, msg, reply).await;
        })
    });

    conn.run(socket, outbound_rx, handle, shutdown, on_inbound).await;

    let last_connection = state.registry.unregister(&user_id, conn_id).await;
    crate::metrics::decr_active_connections();
    if last_connection {
        state.presence.emit(&user_id, conn_id, PresenceStatus::Offline).await;
    }
}

async fn health_check(State(state): State<AppState>) -> Response {
    let pubsub_ok = state.pubsub.ping().await.is_ok();

    let status = if pubsub_ok { "UP" } else { "DOWN" };
    let code = if pubsub_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(json!({ "status": status }))).into_response()
}

/// Restricts `/prometheus/metrics` to loopback connections.
async fn require_loopback(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match connect_info {
        Some(ConnectInfo(addr)) if addr.ip().is_loopback() => next.run(req).await,
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn build_router(state: AppState) -> Router {
    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/prometheus/metrics",
            get(move || async move { metric_handle.render() })
                .route_layer(middleware::from_fn(require_loopback)),
        )
        .route("/socket/connect", get(connect_handler))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(prometheus_layer)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Runs the gateway until `shutdown_signal` resolves, then drives the
/// graceful-shutdown sequence: cancel every open connection's token the
/// instant the signal arrives (rather than waiting on axum's HTTP-level
/// graceful wait, which does not observe already-upgraded sockets), give
/// them `config.connection_close_budget` to finish closing, and bound the
/// whole sequence by `config.shutdown_budget` before returning regardless
/// of stragglers.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let shutdown_budget = state.config.shutdown_budget;
    let connection_close_budget = state.config.connection_close_budget;
    let conn_shutdown = state.shutdown.clone();
    let tracker = state.connection_tasks.clone();
    let app = build_router(state.clone());

    let (axum_shutdown_tx, axum_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        shutdown_signal.await;
        conn_shutdown.cancel();
        let _ = axum_shutdown_tx.send(());
    });

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = axum_shutdown_rx.await;
    });

    let serve_result = tokio::time::timeout(shutdown_budget + Duration::from_secs(5), server).await;

    tracker.close();
    if tokio::time::timeout(connection_close_budget, tracker.wait())
        .await
        .is_err()
    {
        tracing::warn!("connection close budget exceeded; abandoning remaining sockets");
    }

    match serve_result {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("graceful shutdown budget exceeded; forcing exit");
            Ok(())
        }
    }
}
