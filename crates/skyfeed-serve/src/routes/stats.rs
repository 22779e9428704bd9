//! Ingest statistics endpoint.

use axum::Json;
use axum::extract::State;
use skyfeed_ingest::StatsSnapshot;

use crate::state::AppState;

/// `GET /api/stats`
///
/// Counters from the worker's latest report, rates averaged since the worker
/// started, process memory, and per-feed entry counts and file sizes.
pub async fn stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    let log = state.log.read();
    Json(state.stats.snapshot(&log))
}
