//! Core types and storage for the skyfeed feed generator.
//!
//! This crate provides:
//! - The [`Post`] model produced by the firehose decoder
//! - The feed [`Registry`] and the [`RelevanceRouter`] that maps posts to feeds
//! - The per-feed append-only [`FeedLog`] with cursor pagination
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod feed;
pub mod metrics;
mod post;
mod router;
mod storage;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Record collection holding post records.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Record collection holding feed generator declarations.
pub const FEED_GENERATOR_COLLECTION: &str = "app.bsky.feed.generator";

pub use error::{Error, Result};
pub use feed::{Feed, Predicate, Registry, RegistryBuilder};
pub use post::Post;
pub use router::RelevanceRouter;
pub use storage::{FeedLog, FeedLogConfig, FeedLogStats, Page, SharedFeedLog};
