//! Read-only ingest statistics.
//!
//! [`IngestStats`] holds the counters from the worker's latest `stats`
//! message. [`IngestStats::snapshot`] projects them, together with process
//! memory and per-feed sizes from the [`FeedLog`], into the flat object the
//! stats endpoint returns.

use serde::Serialize;
use skyfeed_core::FeedLog;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters reported by the ingest worker.
#[derive(Debug)]
pub struct IngestStats {
    started_at: Instant,
    processed_posts: AtomicU64,
    processed_events: AtomicU64,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    /// Start the clock. Create this when the worker is spawned.
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            processed_posts: AtomicU64::new(0),
            processed_events: AtomicU64::new(0),
        }
    }

    /// Store the latest counters. Counters never move backwards.
    pub fn record(&self, processed_posts: u64, processed_events: u64) {
        self.processed_posts
            .fetch_max(processed_posts, Ordering::Relaxed);
        self.processed_events
            .fetch_max(processed_events, Ordering::Relaxed);
    }

    pub fn processed_posts(&self) -> u64 {
        self.processed_posts.load(Ordering::Relaxed)
    }

    pub fn processed_events(&self) -> u64 {
        self.processed_events.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Build the stats object for `log`.
    pub fn snapshot(&self, log: &FeedLog) -> StatsSnapshot {
        self.snapshot_at(log, self.uptime())
    }

    fn snapshot_at(&self, log: &FeedLog, uptime: Duration) -> StatsSnapshot {
        let processed_posts = self.processed_posts();
        let processed_events = self.processed_events();
        let seconds = uptime.as_secs_f64();

        StatsSnapshot {
            processed_posts,
            processed_events,
            posts_per_second: rate(processed_posts, seconds),
            events_per_second: rate(processed_events, seconds),
            uptime_seconds: seconds,
            memory: MemoryUsage::current(),
            feeds: log
                .stats()
                .into_iter()
                .map(|s| {
                    (
                        s.key,
                        FeedSize {
                            entries: s.entries,
                            file_size_bytes: s.file_size_bytes,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Running average since start; zero before any time has passed.
fn rate(count: u64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        count as f64 / seconds
    } else {
        0.0
    }
}

/// Flat statistics object.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub processed_posts: u64,
    pub processed_events: u64,
    pub posts_per_second: f64,
    pub events_per_second: f64,
    pub uptime_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryUsage>,
    pub feeds: BTreeMap<String, FeedSize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSize {
    pub entries: usize,
    pub file_size_bytes: u64,
}

/// Process memory in megabytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub rss_mb: f64,
    pub virtual_mb: f64,
}

impl MemoryUsage {
    /// Current usage from `/proc/self/status`; `None` where that is unavailable.
    pub fn current() -> Option<Self> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        Self::parse_status(&status)
    }

    /// Parse the `VmRSS` and `VmSize` lines (reported in kB).
    fn parse_status(status: &str) -> Option<Self> {
        let mut rss_kb = None;
        let mut virtual_kb = None;

        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                rss_kb = parse_kb(rest);
            } else if let Some(rest) = line.strip_prefix("VmSize:") {
                virtual_kb = parse_kb(rest);
            }
        }

        Some(Self {
            rss_mb: rss_kb? / 1024.0,
            virtual_mb: virtual_kb? / 1024.0,
        })
    }
}

fn parse_kb(field: &str) -> Option<f64> {
    field.split_whitespace().next()?.parse().ok()
}
