//! HTTP server hosting the gated routes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::gate::{dispatch_gate, GateState};
use crate::error::{Result, ThrottleError};
use crate::ratelimit::{IdentityResolver, RateLimiter};
use crate::store::CounterStore;

/// HTTP server that rate limits every route it serves.
pub struct HttpServer<S: CounterStore + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared gate state
    state: GateState<S>,
}

impl<S: CounterStore + 'static> HttpServer<S> {
    pub fn new(addr: SocketAddr, limiter: Arc<RateLimiter<S>>, resolver: IdentityResolver) -> Self {
        Self {
            addr,
            state: GateState {
                limiter,
                resolver: Arc::new(resolver),
            },
        }
    }

    /// Build the router with the gate applied to every route.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(root))
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                dispatch_gate::<S>,
            ))
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            ThrottleError::Io(e)
        })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            ThrottleError::Io(e)
        })
    }
}

async fn root() -> &'static str {
    "Service is running"
}
