//! Skyfeed ingestion: firehose subscription, routing and the worker/supervisor
//! split.
//!
//! # Modules
//!
//! - [`firehose`] - Reconnecting commit-stream subscriber and frame decoding
//! - [`source`] - The [`PostSource`] trait the worker consumes
//! - [`worker`] - Source + router on an isolated thread, talking over a channel
//! - [`supervisor`] - Sole writer of the feed log
//! - [`stats`] - Read-only projection of ingest counters
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ FirehoseStream  │  websocket, DAG-CBOR frames, CAR blocks
//! └────────┬────────┘
//!          │ Post
//!          ▼
//! ┌─────────────────┐
//! │ RelevanceRouter │  feed predicates (inside the worker thread)
//! └────────┬────────┘
//!          │ WorkerMessage::Post { feeds, post }
//!          ▼
//! ┌─────────────────┐
//! │   Supervisor    │  appends to FeedLog, records stats
//! └─────────────────┘
//! ```

pub mod error;
pub mod firehose;
pub mod source;
pub mod stats;
pub mod supervisor;
pub mod worker;

pub use error::{Error, Result};

pub use firehose::{ConnectionState, FirehoseConfig, FirehoseStream};
pub use source::PostSource;
pub use stats::{FeedSize, IngestStats, MemoryUsage, StatsSnapshot};
pub use supervisor::Supervisor;
pub use worker::{
    IngestWorker, WorkerConfig, WorkerControl, WorkerExit, WorkerHandle, WorkerMessage,
};
