use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use throttlegate::config::{StoreBackend, ThrottleConfig};
use throttlegate::http::HttpServer;
use throttlegate::ratelimit::{IdentityResolver, LimitConfig, RateLimiter};
use throttlegate::store::{CounterStore, MemoryStore};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "throttlegate")]
#[command(about = "Rate limiting HTTP gate", version)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Throttlegate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => ThrottleConfig::from_file(path)?,
        None => ThrottleConfig::default(),
    };
    config.apply_env()?;
    if let Some(addr) = args.addr {
        config.server.http_addr = addr;
    }
    config.validate()?;

    info!(
        http_addr = %config.server.http_addr,
        max_address_requests = config.rate_limiting.max_address_requests,
        max_token_requests = config.rate_limiting.max_token_requests,
        window_secs = config.rate_limiting.window_secs,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let limits = LimitConfig::from_config(&config.rate_limiting)?;
    let resolver = IdentityResolver::from_config(&config.identity)?;

    match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            spawn_purge_task(
                Arc::clone(&store),
                Duration::from_secs(config.store.purge_interval_secs.max(1)),
            );
            run(config.server.http_addr, store, limits, resolver).await
        }
        StoreBackend::Redis => run_redis(&config, limits, resolver).await,
    }
}

async fn run<S: CounterStore + 'static>(
    addr: SocketAddr,
    store: Arc<S>,
    limits: LimitConfig,
    resolver: IdentityResolver,
) -> anyhow::Result<()> {
    let rate_limiter = Arc::new(RateLimiter::new(store, limits));
    info!("Rate limiter initialized");

    HttpServer::new(addr, rate_limiter, resolver)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Throttlegate stopped");
    Ok(())
}

#[cfg(feature = "redis-store")]
async fn run_redis(
    config: &ThrottleConfig,
    limits: LimitConfig,
    resolver: IdentityResolver,
) -> anyhow::Result<()> {
    use throttlegate::store::{RedisStore, RedisStoreConfig};

    let store_config = RedisStoreConfig {
        key_prefix: config.store.key_prefix.clone(),
    };
    let store = RedisStore::connect(&config.store.redis_url(), store_config).await?;
    run(config.server.http_addr, Arc::new(store), limits, resolver).await
}

#[cfg(not(feature = "redis-store"))]
async fn run_redis(
    _config: &ThrottleConfig,
    _limits: LimitConfig,
    _resolver: IdentityResolver,
) -> anyhow::Result<()> {
    anyhow::bail!("redis backend requested but throttlegate was built without the `redis-store` feature")
}

/// Periodically drop expired counters from the in-memory store.
fn spawn_purge_task(store: Arc<MemoryStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                info!(purged, remaining = store.len(), "Purged expired counters");
            }
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
