//! Feed generator XRPC endpoints.

use axum::Json;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

// ═══════════════════════════════════════════════════════════════════════════
// Skeleton
// ═══════════════════════════════════════════════════════════════════════════

/// Query parameters for a skeleton page.
#[derive(Debug, Clone, Deserialize)]
pub struct SkeletonQuery {
    /// Feed AT-URI; only its last path segment (the feed key) is used.
    pub feed: Option<String>,
    /// Cursor from the previous page.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkeletonResponse {
    pub feed: Vec<SkeletonItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkeletonItem {
    /// AT-URI of the post.
    pub post: String,
}

/// `GET /xrpc/app.bsky.feed.getFeedSkeleton`
///
/// Returns one page of post URIs, newest first. Unknown feeds and
/// out-of-range cursors produce an empty page rather than an error.
pub async fn get_feed_skeleton(
    State(state): State<AppState>,
    Query(params): Query<SkeletonQuery>,
) -> Result<Json<SkeletonResponse>, ApiError> {
    let feed_uri = params
        .feed
        .filter(|feed| !feed.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing feed parameter".to_string()))?;
    let key = feed_key(&feed_uri);

    tracing::debug!(feed = key, cursor = ?params.cursor, "feed requested");

    let label = if state.registry.contains(key) {
        key.to_string()
    } else {
        "unknown".to_string()
    };
    metrics::counter!("api_skeleton_requests_total", "feed" => label).increment(1);

    let page = state
        .log
        .read()
        .get_page(key, state.config.page_size, params.cursor.as_deref());

    Ok(Json(SkeletonResponse {
        feed: page
            .posts
            .into_iter()
            .map(|post| SkeletonItem { post: post.uri })
            .collect(),
        cursor: page.cursor,
    }))
}

/// The last `/`-separated segment of a feed URI.
fn feed_key(feed_uri: &str) -> &str {
    feed_uri.rsplit('/').next().unwrap_or(feed_uri)
}

// ═══════════════════════════════════════════════════════════════════════════
// Generator description
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
pub struct DescribeResponse {
    pub did: String,
    pub feeds: Vec<FeedDescription>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedDescription {
    pub uri: String,
    pub created_at: String,
    pub name: String,
    pub description: String,
}

/// `GET /xrpc/app.bsky.feed.describeFeedGenerator`
pub async fn describe_feed_generator(State(state): State<AppState>) -> Json<DescribeResponse> {
    let created_at = state.created_at();
    let feeds = state
        .registry
        .iter()
        .map(|feed| FeedDescription {
            uri: feed.generator_uri(&state.config.publisher_did),
            created_at: created_at.clone(),
            name: feed.display_name().to_string(),
            description: feed.description().to_string(),
        })
        .collect();

    Json(DescribeResponse {
        did: state.config.service_did.clone(),
        feeds,
    })
}
