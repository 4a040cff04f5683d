//! Dispatch gate: rate limiting middleware in front of every route.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::error::ThrottleError;
use crate::ratelimit::{Decision, IdentityResolver, RateLimiter};
use crate::store::CounterStore;

/// Message returned to callers that exhausted their window.
pub const RATE_LIMITED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Shared state for the gate middleware.
pub struct GateState<S> {
    pub limiter: Arc<RateLimiter<S>>,
    pub resolver: Arc<IdentityResolver>,
}

impl<S> Clone for GateState<S> {
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            resolver: Arc::clone(&self.resolver),
        }
    }
}

/// Resolve the caller, ask the limiter, then forward or reject.
pub async fn dispatch_gate<S>(
    State(state): State<GateState<S>>,
    request: Request,
    next: Next,
) -> Response
where
    S: CounterStore + 'static,
{
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    let key = match state.resolver.resolve(request.headers(), &peer) {
        Ok(key) => key,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Rejecting request without a usable identity");
            return e.into_response();
        }
    };

    match state.limiter.decide_key(&key).await {
        Ok(Decision::Admit) => {
            debug!(key = %key, "Request admitted");
            next.run(request).await
        }
        Ok(Decision::Deny) => {
            debug!(key = %key, "Rate limit exceeded");
            rate_limited_response()
        }
        Err(e) => {
            log_failure(&key.to_string(), &e);
            e.into_response()
        }
    }
}

fn log_failure(key: &str, err: &ThrottleError) {
    match err {
        ThrottleError::CorruptRecord { .. } => {
            error!(key = %key, error = %err, "Counter record is corrupt")
        }
        _ => error!(key = %key, error = %err, "Rate decision failed"),
    }
}

fn rate_limited_response() -> Response {
    let body = Json(json!({
        "error": {
            "code": "RATE_LIMITED",
            "message": RATE_LIMITED_MESSAGE,
        }
    }));
    (StatusCode::TOO_MANY_REQUESTS, body).into_response()
}
