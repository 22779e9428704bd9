//! Prometheus metrics helpers.
//!
//! # Usage
//!
//! ```rust,ignore
//! use skyfeed_core::metrics::{start_metrics_server, try_init_metrics};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     if let Some(handle) = try_init_metrics() {
//!         start_metrics_server(9090, handle).await?;
//!     }
//!
//!     metrics::counter!("firehose_events_total").increment(1);
//!     Ok(())
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component (`firehose_`, `worker_`, `supervisor_`, `feedlog_`, `api_`)
//! - Suffix: unit or type (`_total`, `_bytes`, `_seconds`)
//! - Labels: only `feed` and `type`, both low cardinality

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the Prometheus recorder and describe every metric.
///
/// Call once at startup, before anything is recorded. Returns `None` if a
/// recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_metrics();
    Some(handle)
}

/// Serve `/metrics` on `port` from a background task.
///
/// Binding happens before this returns, so a port conflict is reported to
/// the caller instead of being lost in the spawned task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for every metric the service records.
fn register_metrics() {
    // =========================================================================
    // Firehose
    // =========================================================================

    describe_counter!(
        "firehose_events_total",
        "Upstream events received, including non-post and ignored events"
    );
    describe_counter!(
        "firehose_posts_total",
        "Post-creation records decoded and handed to the router"
    );
    describe_counter!(
        "firehose_decode_errors_total",
        "Frames or records skipped because they could not be decoded"
    );
    describe_counter!(
        "firehose_reconnects_total",
        "Times the firehose connection was dropped and re-established"
    );
    describe_gauge!(
        "firehose_connected",
        "Whether the firehose is currently streaming (1=yes, 0=no)"
    );

    // =========================================================================
    // Worker / supervisor
    // =========================================================================

    describe_counter!(
        "worker_matches_total",
        "Posts routed to a feed (label: feed)"
    );
    describe_counter!(
        "supervisor_messages_total",
        "Worker messages applied by the supervisor (label: type)"
    );
    describe_gauge!(
        "ingest_running",
        "Whether the ingest worker is running (1=yes, 0=no)"
    );

    // =========================================================================
    // Feed log
    // =========================================================================

    describe_counter!(
        "feedlog_appends_total",
        "Posts appended to a feed log (label: feed)"
    );
    describe_counter!(
        "feedlog_bytes_written_total",
        "Bytes appended across all feed logs"
    );

    // =========================================================================
    // API
    // =========================================================================

    describe_counter!(
        "api_skeleton_requests_total",
        "Feed skeleton requests served (label: feed)"
    );
}
