//! KAIKU - Mention-Driven Bot Backend
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (Redis on localhost)
//! cargo run
//!
//! # Run with debug output
//! KAIKU_LOG_LEVEL=debug cargo run
//! ```
//!
//! ## Environment Variables
//!
//! - `KAIKU_REDIS_URL`: Redis connection URL (default: "redis://127.0.0.1:6379")
//! - `KAIKU_SOURCE_URL`: Notification feed URL
//! - `KAIKU_METRICS_ADDR`: Admin server address (default: "0.0.0.0:9090")
//! - `KAIKU_POLL_INTERVAL_MS`: Delay between poll cycles (default: 30000)
//! - `KAIKU_RATE_LIMIT` / `KAIKU_RATE_WINDOW_SECS`: Per-author admission quota
//! - `KAIKU_LOG_LEVEL` / `KAIKU_LOG_FORMAT`: Logging (default: "info", pretty)

use kaiku::breaker::CircuitBreakerConfig;
use kaiku::bus::{EventBus, RedisEventBus};
use kaiku::classify::{Classification, ClassificationSource, Classifier, Intent};
use kaiku::config::{Config, LogFormat};
use kaiku::error::KaikuError;
use kaiku::event::EventKind;
use kaiku::idempotency::IdempotencyGuard;
use kaiku::ingest::HttpNotificationSource;
use kaiku::limiter::SlidingWindowLimiter;
use kaiku::metrics::Metrics;
use kaiku::metrics_server::MetricsServer;
use kaiku::poller::{Poller, PollerConfig};
use kaiku::router::{ROUTER_GROUP, Router, RouterConfig};
use kaiku::store::RedisStore;
use kaiku::worker::{ActionWorker, StdoutActionHandler, WORKER_GROUP};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pass-through classifier used until a real model client is wired in
///
/// Reports `Unknown` at mid confidence, which never triggers the router's
/// conservative Summary default — heuristic matches still route normally.
struct NoopClassifier;

#[async_trait::async_trait]
impl Classifier for NoopClassifier {
    async fn classify(&self, _content: &str) -> Result<Classification, KaikuError> {
        Ok(Classification {
            intent: Intent::Unknown,
            confidence: 0.5,
            reason: "no classifier configured".to_string(),
            source: ClassificationSource::Classifier,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    info!(
        redis_url = %config.redis_url,
        source_url = %config.source_url,
        metrics_addr = %config.metrics_addr,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "starting KAIKU"
    );

    Metrics::init()?;

    // Shared store and bus
    let store = Arc::new(RedisStore::connect(&config.redis_url, config.stream_prefix.clone()).await?);
    let bus: Arc<dyn EventBus> = Arc::new(
        RedisEventBus::connect(&config.redis_url, config.stream_prefix.clone()).await?,
    );
    bus.initialize_streams().await?;

    let guard = IdempotencyGuard::new(store.clone());
    let limiter = SlidingWindowLimiter::new(store.clone(), config.rate_limit, config.rate_window);

    let shutdown = CancellationToken::new();

    // Router subscription
    let router = Arc::new(Router::new(
        store.clone(),
        bus.clone(),
        limiter,
        store.clone(),
        Arc::new(NoopClassifier),
        guard.clone(),
        RouterConfig::default(),
    ));
    let _router_task = bus
        .subscribe(
            EventKind::MentionReceived,
            ROUTER_GROUP,
            &format!("{}-router", config.poller_id),
            router,
            shutdown.clone(),
        )
        .await?;

    // Action worker subscription. Real reply-publishing handlers are
    // registered based on deployment; the stdout handler covers debugging.
    let worker = Arc::new(
        ActionWorker::new(
            store.clone(),
            bus.clone(),
            guard,
            Duration::from_secs(24 * 60 * 60),
        )
        .handler(Intent::Summary, Arc::new(StdoutActionHandler))
        .handler(Intent::FactCheck, Arc::new(StdoutActionHandler)),
    );
    let _worker_task = bus
        .subscribe(
            EventKind::ActionRequested,
            WORKER_GROUP,
            &format!("{}-worker", config.poller_id),
            worker,
            shutdown.clone(),
        )
        .await?;
    info!("registered stdout action handlers (debug mode)");

    // Ingestion poller
    let mut source = HttpNotificationSource::new(config.source_url.as_str())?;
    if let Some(token) = &config.source_token {
        source = source.bearer_token(token.clone());
    }
    let poller = Poller::new(
        Arc::new(source),
        store,
        bus,
        CircuitBreakerConfig::default(),
        PollerConfig {
            poller_id: config.poller_id.clone(),
            poll_interval: config.poll_interval,
            batch_size: config.batch_size,
            fan_out: config.fan_out,
        },
    );

    // Admin surface
    let metrics_handle = MetricsServer::start(config.metrics_addr, poller.health());

    // Run until a shutdown signal arrives
    tokio::select! {
        _ = poller.run(shutdown.clone()) => {}
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    }

    metrics_handle.abort();
    info!("KAIKU shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
