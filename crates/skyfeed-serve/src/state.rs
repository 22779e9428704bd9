//! Shared application state.

use crate::config::Config;
use chrono::{DateTime, SecondsFormat, Utc};
use skyfeed_core::{Registry, SharedFeedLog};
use skyfeed_ingest::IngestStats;
use std::sync::Arc;

/// Shared application state available to all request handlers.
///
/// Handlers only read the feed log; the supervisor is its single writer.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,

    /// Feeds served by this generator.
    pub registry: Arc<Registry>,

    pub log: SharedFeedLog,

    /// Latest counters reported by the ingest worker.
    pub stats: Arc<IngestStats>,

    /// Reported as the `createdAt` of every feed in the generator description.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: Config,
        registry: Arc<Registry>,
        log: SharedFeedLog,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            log,
            stats,
            started_at: Utc::now(),
        }
    }

    /// `started_at` as an RFC 3339 timestamp with millisecond precision.
    pub fn created_at(&self) -> String {
        self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}
