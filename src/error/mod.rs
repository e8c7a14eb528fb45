use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy the core must distinguish.
///
/// Only `Auth` and `Protocol` are surfaced as HTTP responses or `error`
/// frames reaching a client directly — the rest are handled internally by
/// the pipeline and registry, but `IntoResponse` is implemented uniformly so
/// the upgrade handler can return `GatewayResult<T>`.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("authentication error: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("durable publish failed: {0}")]
    DurablePublish(#[from] DurablePublishError),

    #[error("pubsub publish failed: {0}")]
    PubSubPublish(String),

    #[error(transparent)]
    LocalDelivery(#[from] LocalDeliveryError),

    #[error("graceful shutdown budget exceeded")]
    ShutdownTimeout,

    #[error("internal error")]
    Internal,
}

#[derive(Error, Debug)]
pub enum DurablePublishError {
    #[error("handoff to durable log timed out")]
    Timeout,
    #[error("producer rejected the event: {0}")]
    Rejected(String),
    #[error("producer is closed")]
    Closed,
}

/// `NotConnectedLocally` is the expected, non-error outcome of delivering to
/// a user with no live connections on this instance — the event still
/// reaches the fleet via the durable bus and pubsub. Callers must never
/// surface it to the sender.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocalDeliveryError {
    #[error("user has no local connections")]
    NotConnectedLocally,
    #[error("all local connections were saturated")]
    AllQueuesSaturated,
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, message): (StatusCode, String) = match self {
            GatewayError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg),
            GatewayError::Protocol(msg) => (StatusCode::BAD_REQUEST, msg),
            other => {
                tracing::error!(error = ?other, "unhandled gateway error reached HTTP boundary");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn auth_error_returns_401() {
        let response = GatewayError::Auth("unauthorized".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn protocol_error_returns_400() {
        let response = GatewayError::Protocol("malformed frame".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn internal_error_returns_500() {
        let response = GatewayError::Internal.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn durable_publish_error_returns_500_not_leaked_detail() {
        let response =
            GatewayError::DurablePublish(DurablePublishError::Timeout).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn auth_error_body_has_error_key() {
        let response = GatewayError::Auth("unauthorized".into()).into_response();
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"], "unauthorized");
    }

    #[test]
    fn local_delivery_not_connected_is_not_displayed_as_an_error_to_users() {
        // NotConnectedLocally must never be escalated — this is a compile-time
        // reminder that callers have to match on it explicitly rather than
        // letting `?` propagate it into a response.
        let err = LocalDeliveryError::NotConnectedLocally;
        assert_eq!(err, LocalDeliveryError::NotConnectedLocally);
    }
}
