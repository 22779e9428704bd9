//! Post source abstraction.
//!
//! The ingest worker consumes posts through [`PostSource`] so the live
//! firehose and scripted test sources are interchangeable.
//!
//! # Available Sources
//!
//! - [`FirehoseStream`](crate::FirehoseStream) - live commit firehose with reconnects

use crate::Result;
use skyfeed_core::Post;
use std::future::Future;

/// A source of newly created posts.
pub trait PostSource {
    /// Human-readable name for this source (used in logs).
    fn name(&self) -> &'static str;

    /// Raw upstream events seen so far, including ones that produced no post.
    fn events_seen(&self) -> u64;

    /// Deliver posts to `on_post`, one at a time in arrival order.
    ///
    /// With `top_level_only`, posts that reply to another post are not
    /// delivered. Resolves with `Ok(())` once [`stop`](Self::stop) takes
    /// effect; an `Err` means the source cannot continue.
    fn run<F>(&self, on_post: F, top_level_only: bool) -> impl Future<Output = Result<()>>
    where
        F: FnMut(Post);

    /// Ask a running [`run`](Self::run) to finish.
    fn stop(&self);
}
