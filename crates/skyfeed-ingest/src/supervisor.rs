//! The supervisor: sole writer of the feed log.
//!
//! The supervisor receives [`WorkerMessage`]s one at a time and applies them:
//! `post` appends to every listed feed in order, `stats` updates
//! [`IngestStats`], `error` is logged, anything else is ignored. Because it is
//! the only task that mutates the log, appends to a feed never interleave.
//!
//! # Exit semantics
//!
//! - The shutdown future resolves: the worker is told to stop, the messages
//!   it already queued are applied, every feed file is synced, `Ok(())`.
//! - The worker exits on its own (error or otherwise): fatal,
//!   [`Error::WorkerFailed`].
//! - An append fails: fatal, the storage error is returned.

use crate::error::{Error, Result};
use crate::stats::IngestStats;
use crate::worker::{WorkerExit, WorkerHandle, WorkerMessage};
use skyfeed_core::SharedFeedLog;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Applies worker output to the feed log.
pub struct Supervisor {
    log: SharedFeedLog,
    stats: Arc<IngestStats>,
}

impl Supervisor {
    pub fn new(log: SharedFeedLog, stats: Arc<IngestStats>) -> Self {
        Self { log, stats }
    }

    pub fn log(&self) -> &SharedFeedLog {
        &self.log
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    /// Apply one worker message.
    pub fn apply(&self, message: WorkerMessage) -> Result<()> {
        metrics::counter!("supervisor_messages_total", "type" => message.kind()).increment(1);

        match message {
            WorkerMessage::Post { feeds, post } => {
                let mut log = self.log.write();
                for key in &feeds {
                    log.append(key, post.clone())?;
                }
            }
            WorkerMessage::Stats {
                processed_posts,
                processed_events,
            } => self.stats.record(processed_posts, processed_events),
            WorkerMessage::Error { message } => {
                error!("Ingest worker reported an error: {}", message);
            }
            WorkerMessage::Unknown => debug!("Ignoring unknown worker message"),
        }

        Ok(())
    }

    /// Apply messages from `worker` until `shutdown` resolves or the worker
    /// exits.
    pub async fn run<F>(&self, mut worker: WorkerHandle, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        metrics::gauge!("ingest_running").set(1.0);

        let requested = loop {
            tokio::select! {
                _ = &mut shutdown => break true,
                message = worker.recv() => match message {
                    Some(message) => {
                        if let Err(e) = self.apply(message) {
                            error!("Failed to apply worker message: {}", e);
                            worker.shutdown();
                            worker.join().await;
                            metrics::gauge!("ingest_running").set(0.0);
                            self.flush_log();
                            return Err(e);
                        }
                    }
                    None => break false,
                },
            }
        };

        if requested {
            info!("Stopping ingest worker");
            worker.shutdown();
        }

        let exit = worker.join().await;
        metrics::gauge!("ingest_running").set(0.0);

        // The worker has exited, so this drains the queue and then ends.
        let mut drained = 0usize;
        while let Some(message) = worker.recv().await {
            if let Err(e) = self.apply(message) {
                error!("Failed to apply queued worker message: {}", e);
                self.flush_log();
                return Err(e);
            }
            drained += 1;
        }
        if drained > 0 {
            debug!("Applied {} queued worker messages", drained);
        }

        self.log.write().flush()?;
        info!("Feed logs synced");

        match (requested, exit) {
            (true, exit) => exit.into_result(),
            (false, WorkerExit::Failed(reason)) => {
                error!("Ingest worker failed: {}", reason);
                Err(Error::WorkerFailed(reason))
            }
            (false, WorkerExit::Shutdown) => {
                error!("Ingest worker exited without a shutdown request");
                Err(Error::WorkerFailed(
                    "worker exited without a shutdown request".to_string(),
                ))
            }
        }
    }

    fn flush_log(&self) {
        if let Err(e) = self.log.write().flush() {
            warn!("Failed to sync feed logs: {}", e);
        }
    }
}
