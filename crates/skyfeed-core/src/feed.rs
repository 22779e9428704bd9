//! Feed definitions and the feed registry.
//!
//! A [`Feed`] is a stable key plus a predicate over [`Post`]s. The
//! [`Registry`] is built once at startup and is immutable afterwards; it is
//! shared by reference (`Arc<Registry>`) with the router, the feed log and
//! the HTTP layer.

use crate::error::{Error, Result};
use crate::post::Post;
use crate::FEED_GENERATOR_COLLECTION;
use std::fmt;

/// Predicate deciding whether a post belongs in a feed.
///
/// Must be total: a panicking predicate is a feed configuration bug.
pub type Predicate = Box<dyn Fn(&Post) -> bool + Send + Sync>;

/// A named, predicate-defined feed.
pub struct Feed {
    key: String,
    display_name: String,
    description: String,
    predicate: Predicate,
}

impl Feed {
    /// Create a feed.
    pub fn new<F>(
        key: impl Into<String>,
        display_name: impl Into<String>,
        description: impl Into<String>,
        predicate: F,
    ) -> Self
    where
        F: Fn(&Post) -> bool + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            display_name: display_name.into(),
            description: description.into(),
            predicate: Box::new(predicate),
        }
    }

    /// Stable identifier, also used as the record key and the log file name.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Evaluate the feed's predicate.
    pub fn matches(&self, post: &Post) -> bool {
        (self.predicate)(post)
    }

    /// The `at://` URI of the generator record published by `publisher_did`.
    pub fn generator_uri(&self, publisher_did: &str) -> String {
        format!(
            "at://{}/{}/{}",
            publisher_did, FEED_GENERATOR_COLLECTION, self.key
        )
    }
}

impl fmt::Debug for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feed")
            .field("key", &self.key)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

/// Check that a feed key is usable as a record key and a file name.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidFeedKey(key.to_string()))
    }
}

/// The set of feeds served by this process, in registration order.
#[derive(Debug, Default)]
pub struct Registry {
    feeds: Vec<Feed>,
}

impl Registry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// The feeds this deployment serves.
    pub fn builtin() -> Self {
        Self {
            feeds: vec![Feed::new(
                "githubrepos",
                "GitHub Repos",
                "Skeets with URLs to GitHub repos, sorted chronologically.",
                |post| post.text.contains("github.com"),
            )],
        }
    }

    /// Iterate feeds in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Feed> {
        self.feeds.iter()
    }

    /// Feed keys in registration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.feeds.iter().map(Feed::key)
    }

    pub fn get(&self, key: &str) -> Option<&Feed> {
        self.feeds.iter().find(|feed| feed.key == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }
}

/// Builder for [`Registry`]. Rejects invalid and duplicate keys.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    feeds: Vec<Feed>,
}

impl RegistryBuilder {
    /// Register a feed.
    pub fn register(mut self, feed: Feed) -> Result<Self> {
        validate_key(&feed.key)?;
        if self.feeds.iter().any(|f| f.key == feed.key) {
            return Err(Error::DuplicateFeed(feed.key));
        }
        self.feeds.push(feed);
        Ok(self)
    }

    pub fn build(self) -> Registry {
        Registry { feeds: self.feeds }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(text: &str) -> Post {
        Post {
            author: "did:plc:abc".to_string(),
            text: text.to_string(),
            created_at: "2024-11-20T10:00:00Z".to_string(),
            uri: "at://did:plc:abc/app.bsky.feed.post/1".to_string(),
            cid: "bafy".to_string(),
            is_reply: false,
        }
    }

    #[test]
    fn test_builtin_github_feed() {
        let registry = Registry::builtin();
        let feed = registry.get("githubrepos").unwrap();
        assert_eq!(feed.display_name(), "GitHub Repos");
        assert!(feed.matches(&post("check out https://github.com/rust-lang/rust")));
        assert!(!feed.matches(&post("nothing to see here")));
    }

    #[test]
    fn test_builder_preserves_registration_order() {
        let registry = Registry::builder()
            .register(Feed::new("b", "B", "", |_| true))
            .unwrap()
            .register(Feed::new("a", "A", "", |_| true))
            .unwrap()
            .build();
        assert_eq!(registry.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_builder_rejects_duplicate_key() {
        let err = Registry::builder()
            .register(Feed::new("rust", "Rust", "", |_| true))
            .unwrap()
            .register(Feed::new("rust", "Rust again", "", |_| false))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateFeed(key) if key == "rust"));
    }

    #[test]
    fn test_builder_rejects_unsafe_keys() {
        for key in ["", "../x", "a/b", "has space", "dot.json"] {
            let result = Registry::builder().register(Feed::new(key, "", "", |_| true));
            assert!(
                matches!(result, Err(Error::InvalidFeedKey(_))),
                "key {key:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_generator_uri() {
        let feed = Feed::new("githubrepos", "", "", |_| true);
        assert_eq!(
            feed.generator_uri("did:plc:publisher"),
            "at://did:plc:publisher/app.bsky.feed.generator/githubrepos"
        );
    }

    #[test]
    fn test_debug_omits_predicate() {
        let feed = Feed::new("k", "K", "d", |_| true);
        let debug = format!("{:?}", feed);
        assert!(debug.contains("\"k\""));
        assert!(debug.contains(".."));
    }
}
