//! Skyfeed - feed generator for the AT Protocol firehose.
//!
//! This binary runs the whole service in one process:
//!
//! 1. Loads every feed log from the data directory
//! 2. Starts the ingest worker (firehose + router) on its own thread
//! 3. Runs the supervisor, which appends the worker's matches to the logs
//! 4. Serves skeleton pages, the generator description and stats over HTTP
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 0.0.0.0:3333, ./data, wss://bsky.network
//! skyfeed
//!
//! # With a specific env file
//! skyfeed --dotenv /etc/skyfeed/skyfeed.env
//! ```
//!
//! # Shutdown
//!
//! SIGINT and SIGTERM stop the worker, apply the matches it already queued,
//! sync every feed log and exit 0. If the worker dies on its own the process
//! exits non-zero.

use anyhow::Context;
use axum::http::Request;
use clap::Parser;
use parking_lot::RwLock;
use skyfeed_core::metrics::{start_metrics_server, try_init_metrics};
use skyfeed_core::{FeedLog, Registry, RelevanceRouter};
use skyfeed_ingest::{FirehoseStream, IngestStats, IngestWorker, Supervisor};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use skyfeed_serve::{AppState, Config, router};

/// Feed generator for the AT Protocol firehose.
#[derive(Parser, Debug)]
#[command(name = "skyfeed")]
#[command(about = "Feed generator: firehose ingestion, feed logs and skeleton API", long_about = None)]
#[command(version)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load .env file if it exists
    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)
            .with_context(|| format!("Failed to load {}", args.dotenv))?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // The firehose client uses rustls; pick the provider explicitly.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let config = Config::from_env()?;

    if config.metrics_port > 0 {
        match try_init_metrics() {
            Some(handle) => start_metrics_server(config.metrics_port, handle)
                .await
                .with_context(|| format!("Failed to bind metrics port {}", config.metrics_port))?,
            None => tracing::warn!("Metrics recorder already installed"),
        }
    }

    // Feed logs
    let registry = Arc::new(Registry::builtin());
    let log = FeedLog::initialize(config.feed_log_config(), registry.keys())
        .with_context(|| format!("Failed to load feed logs from {}", config.data_dir.display()))?;
    for stats in log.stats() {
        tracing::info!(
            feed = %stats.key,
            entries = stats.entries,
            bytes = stats.file_size_bytes,
            "feed log loaded"
        );
    }
    let log = Arc::new(RwLock::new(log));

    // Ingest worker + supervisor
    let stats = Arc::new(IngestStats::new());
    let worker = IngestWorker::new(
        FirehoseStream::new(config.firehose_config()),
        RelevanceRouter::new(Arc::clone(&registry)),
        config.worker_config(),
    )
    .spawn()
    .context("Failed to start ingest worker")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, stopping gracefully...");
            shutdown_tx.send_replace(true);
        }
    });

    let supervisor = Supervisor::new(Arc::clone(&log), Arc::clone(&stats));
    let supervisor_task = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            let result = supervisor.run(worker, wait_for_shutdown(shutdown_rx)).await;
            // Take the HTTP server down with the worker.
            shutdown_tx.send_replace(true);
            result
        }
    });

    // HTTP
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, registry, log, stats);
    let app = router(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                tracing::span!(
                    Level::INFO,
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    query = request.uri().query().unwrap_or("")
                )
            }),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!(addr = %bind_addr, "starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await
        .context("HTTP server failed")?;

    supervisor_task
        .await
        .context("Supervisor task panicked")?
        .context("Ingest pipeline failed")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves once the shutdown flag is set (or its sender is gone).
async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
