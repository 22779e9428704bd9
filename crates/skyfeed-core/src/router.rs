//! Relevance routing: which feeds does a post belong to?

use crate::feed::Registry;
use crate::post::Post;
use std::sync::Arc;

/// Maps a post to the keys of every feed whose predicate accepts it.
///
/// Routing is pure. Every registered predicate is evaluated once per post;
/// keys come back in registration order so a post matching several feeds is
/// appended to them in a stable order.
#[derive(Debug, Clone)]
pub struct RelevanceRouter {
    registry: Arc<Registry>,
}

impl RelevanceRouter {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Keys of the feeds matching `post`. Empty when nothing matches.
    pub fn route(&self, post: &Post) -> Vec<String> {
        self.registry
            .iter()
            .filter(|feed| feed.matches(post))
            .map(|feed| feed.key().to_string())
            .collect()
    }
}
