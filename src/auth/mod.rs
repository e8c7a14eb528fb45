use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::GatewayError;

/// Claims this gateway cares about. Any other claim the issuer sets is
/// ignored — we only need a stable user identifier.
#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: Option<String>,
}

/// The contract the rest of the gateway depends on: a bearer
/// token goes in, a stable user id comes out. Kept as a trait — same seam as
/// [`crate::durable::DurableProducer`] and [`crate::pubsub::PubSubHub`] — so
/// tests can substitute a fixed token→user map instead of standing up a real
/// JWKS endpoint.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<String, GatewayError>;
}

/// JWKS-backed bearer-token validator.
///
/// Key material is fetched from an external JWKS endpoint and refreshed on a
/// background interval. A refresh failure logs and keeps serving the last
/// good key set — it must never fail validation for tokens signed with keys
/// still in the cache.
pub struct AuthValidator {
    jwks_url: String,
    http: reqwest::Client,
    cache: Arc<RwLock<JwkSet>>,
}

impl AuthValidator {
    /// Performs an initial synchronous fetch so the gateway never starts up
    /// accepting connections against an empty key set, then spawns the
    /// background refresh loop.
    pub async fn connect(jwks_url: String, refresh_interval: Duration) -> Result<Arc<Self>, String> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| format!("failed to build JWKS http client: {e}"))?;

        let initial = fetch_jwks(&http, &jwks_url)
            .await
            .map_err(|e| format!("initial JWKS fetch failed: {e}"))?;

        let validator = Arc::new(AuthValidator {
            jwks_url,
            http,
            cache: Arc::new(RwLock::new(initial)),
        });

        validator.clone().spawn_refresh_loop(refresh_interval);
        Ok(validator)
    }

    fn spawn_refresh_loop(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it, we just fetched
            loop {
                ticker.tick().await;
                match fetch_jwks(&self.http, &self.jwks_url).await {
                    Ok(set) => {
                        *self.cache.write().await = set;
                        tracing::debug!("JWKS cache refreshed");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "JWKS refresh failed; serving cached keys");
                    }
                }
            }
        });
    }
}

#[async_trait]
impl TokenValidator for AuthValidator {
    /// Validate a bearer token and return the authenticated user id (the
    /// `sub` claim). Every failure mode collapses to a single `Auth` error —
    /// empty token, parse failure, unknown key id, bad signature, expiry,
    /// missing or empty `sub`.
    async fn validate(&self, token: &str) -> Result<String, GatewayError> {
        if token.is_empty() {
            return Err(GatewayError::Auth("missing token".into()));
        }

        let header = decode_header(token)
            .map_err(|_| GatewayError::Auth("malformed token".into()))?;
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| GatewayError::Auth("token has no key id".into()))?;

        let jwks = self.cache.read().await;
        let jwk = jwks
            .find(kid)
            .ok_or_else(|| GatewayError::Auth("unknown signing key".into()))?;

        let decoding_key = DecodingKey::from_jwk(jwk)
            .map_err(|_| GatewayError::Auth("unusable signing key".into()))?;

        let mut validation = Validation::new(header.alg);
        validation.validate_exp = true;

        let token_data = decode::<RawClaims>(token, &decoding_key, &validation)
            .map_err(|_| GatewayError::Auth("invalid or expired token".into()))?;

        match token_data.claims.sub {
            Some(sub) if !sub.is_empty() => Ok(sub),
            _ => Err(GatewayError::Auth("missing sub claim".into())),
        }
    }
}

async fn fetch_jwks(http: &reqwest::Client, url: &str) -> Result<JwkSet, String> {
    http.get(url)
        .send()
        .await
        .map_err(|e| e.to_string())?
        .json::<JwkSet>()
        .await
        .map_err(|e| e.to_string())
}

/// Extract a bearer token from a WebSocket upgrade request: `token` query
/// parameter first, then `Authorization: Bearer <...>` header.
pub fn extract_token(query_token: Option<&str>, auth_header: Option<&str>) -> Option<String> {
    if let Some(t) = query_token {
        if !t.is_empty() {
            return Some(t.to_string());
        }
    }
    auth_header
        .and_then(|h| h.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// A fixed token→user map, standing in for a real JWKS round trip in tests
/// the same way [`crate::durable::mock`] and [`crate::pubsub::mock`] stand
/// in for the durable bus and pub/sub hub.
pub mod mock {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct StaticTokenValidator {
        tokens: HashMap<String, String>,
    }

    impl StaticTokenValidator {
        pub fn new() -> Self {
            StaticTokenValidator::default()
        }

        pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
            self.tokens.insert(token.into(), user_id.into());
            self
        }
    }

    #[async_trait]
    impl TokenValidator for StaticTokenValidator {
        async fn validate(&self, token: &str) -> Result<String, GatewayError> {
            self.tokens
                .get(token)
                .cloned()
                .ok_or_else(|| GatewayError::Auth("invalid or expired token".into()))
        }
    }
}
