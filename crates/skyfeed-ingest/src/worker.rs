//! The ingest worker: post source + relevance router on an isolated thread.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────── worker thread (own runtime) ────────────────┐
//! │  PostSource ──post──▶ RelevanceRouter ──(feeds, post)──┐     │
//! │                                                        ▼     │
//! │                                          WorkerMessage channel ──▶ Supervisor
//! │  control channel ◀── WorkerControl::Shutdown ◀──────────────────── Supervisor
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The worker never touches the feed log. Everything it produces crosses the
//! message channel, so a stalled or failing upstream cannot block request
//! serving on the supervisor side.

use crate::error::{Error, Result};
use crate::source::PostSource;
use serde::{Deserialize, Serialize};
use skyfeed_core::{Post, RelevanceRouter};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Messages from the worker to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    /// A post that matched at least one feed, with the matching keys in
    /// registration order.
    Post { feeds: Vec<String>, post: Post },

    /// Cumulative counters, sent at most once per stats interval.
    Stats {
        processed_posts: u64,
        processed_events: u64,
    },

    /// The source failed; the worker exits shortly after sending this.
    Error { message: String },

    /// Any other message type. Ignored by the supervisor.
    #[serde(other)]
    Unknown,
}

impl WorkerMessage {
    /// Message type as it appears in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Post { .. } => "post",
            Self::Stats { .. } => "stats",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// Messages from the supervisor to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerControl {
    /// Stop immediately without draining in-flight events.
    Shutdown,
}

/// How the worker thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stopped on request.
    Shutdown,
    /// The source failed or the thread panicked.
    Failed(String),
}

impl WorkerExit {
    /// Process-style exit code: 0 for a requested shutdown, 1 otherwise.
    pub fn code(&self) -> i32 {
        match self {
            Self::Shutdown => 0,
            Self::Failed(_) => 1,
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Shutdown => Ok(()),
            Self::Failed(reason) => Err(Error::WorkerFailed(reason)),
        }
    }
}

/// Configuration for the ingest worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Minimum time between two `stats` messages.
    /// Default: 1 second
    pub stats_interval: Duration,

    /// Delay between sending an `error` message and exiting.
    /// Default: 1 second
    pub failure_grace: Duration,

    /// Drop replies before routing.
    /// Default: false
    pub top_level_only: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stats_interval: Duration::from_secs(1),
            failure_grace: Duration::from_secs(1),
            top_level_only: false,
        }
    }
}

/// Routes posts from a source and forwards matches to the supervisor.
pub struct IngestWorker<S> {
    source: Arc<S>,
    router: RelevanceRouter,
    config: WorkerConfig,
}

impl<S> IngestWorker<S>
where
    S: PostSource + Send + Sync + 'static,
{
    pub fn new(source: S, router: RelevanceRouter, config: WorkerConfig) -> Self {
        Self {
            source: Arc::new(source),
            router,
            config,
        }
    }

    /// Start the worker on a dedicated OS thread with its own runtime.
    pub fn spawn(self) -> Result<WorkerHandle> {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let thread = std::thread::Builder::new()
            .name("ingest-worker".to_string())
            .spawn(move || self.run_thread(message_tx, control_rx))?;

        Ok(WorkerHandle {
            messages: message_rx,
            control: control_tx,
            thread: Some(thread),
        })
    }

    fn run_thread(
        self,
        messages: mpsc::UnboundedSender<WorkerMessage>,
        control: mpsc::UnboundedReceiver<WorkerControl>,
    ) -> WorkerExit {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                let message = format!("failed to start worker runtime: {}", e);
                let _ = messages.send(WorkerMessage::Error {
                    message: message.clone(),
                });
                return WorkerExit::Failed(message);
            }
        };

        runtime.block_on(self.run(messages, control))
    }

    async fn run(
        self,
        messages: mpsc::UnboundedSender<WorkerMessage>,
        mut control: mpsc::UnboundedReceiver<WorkerControl>,
    ) -> WorkerExit {
        info!(
            "Ingest worker started (source: {}, feeds: {}, top_level_only: {})",
            self.source.name(),
            self.router.registry().len(),
            self.config.top_level_only
        );

        let source = &self.source;
        let router = &self.router;
        let stats_interval = self.config.stats_interval;

        let mut processed_posts = 0u64;
        let mut last_stats = Instant::now();

        let on_post = |post: Post| {
            processed_posts += 1;

            let feeds = router.route(&post);
            if !feeds.is_empty() {
                for feed in &feeds {
                    metrics::counter!("worker_matches_total", "feed" => feed.clone()).increment(1);
                }
                debug!("Post {} matched {:?}", post.uri, feeds);
                let _ = messages.send(WorkerMessage::Post { feeds, post });
            }

            if last_stats.elapsed() >= stats_interval {
                let _ = messages.send(WorkerMessage::Stats {
                    processed_posts,
                    processed_events: source.events_seen(),
                });
                last_stats = Instant::now();
            }
        };

        let finished = tokio::select! {
            result = source.run(on_post, self.config.top_level_only) => Some(result),
            _ = control.recv() => None,
        };

        match finished {
            // Shutdown requested, or the supervisor dropped its handle.
            None => {
                source.stop();
                info!("Ingest worker shutting down");
                WorkerExit::Shutdown
            }
            Some(Ok(())) => {
                info!("Post source {} stopped", source.name());
                WorkerExit::Shutdown
            }
            Some(Err(e)) => {
                error!("Post source {} failed: {}", source.name(), e);
                let message = e.to_string();
                let _ = messages.send(WorkerMessage::Error {
                    message: message.clone(),
                });
                tokio::time::sleep(self.config.failure_grace).await;
                WorkerExit::Failed(message)
            }
        }
    }
}

/// Supervisor-side end of a running worker.
pub struct WorkerHandle {
    messages: mpsc::UnboundedReceiver<WorkerMessage>,
    control: mpsc::UnboundedSender<WorkerControl>,
    thread: Option<JoinHandle<WorkerExit>>,
}

impl WorkerHandle {
    /// Next message from the worker; `None` once the worker has exited and
    /// every queued message has been received.
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        self.messages.recv().await
    }

    /// Ask the worker to stop. A worker that already exited is not an error.
    pub fn shutdown(&self) {
        let _ = self.control.send(WorkerControl::Shutdown);
    }

    /// Wait for the worker thread to finish.
    pub async fn join(&mut self) -> WorkerExit {
        let Some(thread) = self.thread.take() else {
            return WorkerExit::Failed("worker already joined".to_string());
        };

        let joined = tokio::task::spawn_blocking(move || thread.join()).await;
        match joined {
            Ok(Ok(exit)) => exit,
            Ok(Err(_)) => WorkerExit::Failed("worker thread panicked".to_string()),
            Err(e) => WorkerExit::Failed(format!("failed to join worker: {}", e)),
        }
    }
}
