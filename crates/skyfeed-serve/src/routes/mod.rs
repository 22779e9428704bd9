//! API route definitions.

mod feed;
mod health;
mod stats;
mod well_known;

use axum::Router;
use axum::http::Uri;
use axum::routing::get;

use crate::error::ApiError;
use crate::state::AppState;

/// Build the complete API router.
///
/// # Route Structure
///
/// - `GET /health` - Health check
/// - `GET /.well-known/did.json` - Service DID document
/// - `GET /xrpc/app.bsky.feed.describeFeedGenerator` - Feeds served here
/// - `GET /xrpc/app.bsky.feed.getFeedSkeleton` - One page of a feed
/// - `GET /api/stats` - Ingest counters and feed sizes
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/.well-known/did.json", get(well_known::did_document))
        .route(
            "/xrpc/app.bsky.feed.describeFeedGenerator",
            get(feed::describe_feed_generator),
        )
        .route(
            "/xrpc/app.bsky.feed.getFeedSkeleton",
            get(feed::get_feed_skeleton),
        )
        .route("/api/stats", get(stats::stats))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(uri.path().to_string())
}
