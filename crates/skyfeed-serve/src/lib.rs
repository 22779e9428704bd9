//! Skyfeed Serve - feed generator HTTP service
//!
//! Serves the feeds built by the ingest pipeline to AT Protocol clients:
//! skeleton pages read from the feed log, the generator description, the
//! `did:web` document, and ingest statistics.
//!
//! # Architecture
//!
//! - **Config**: Environment-driven settings for the whole process
//! - **AppState**: Registry, shared feed log and ingest stats
//! - **Routes**: Endpoint handlers; all of them are read-only

mod config;
mod error;
mod routes;
mod state;

pub use self::config::Config;
pub use self::error::ApiError;
pub use self::routes::router;
pub use self::state::AppState;
