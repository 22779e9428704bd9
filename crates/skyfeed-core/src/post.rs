//! The post model emitted by the firehose decoder and persisted in feed logs.

use serde::{Deserialize, Serialize};

/// A newly created post, as seen on the firehose.
///
/// Serialized as one JSON object per line in the feed log files, using the
/// camelCase field names of the upstream lexicon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    /// DID of the author's repository.
    pub author: String,

    /// Post body.
    pub text: String,

    /// Client-supplied creation timestamp (RFC 3339, not validated).
    pub created_at: String,

    /// `at://<did>/app.bsky.feed.post/<rkey>`
    pub uri: String,

    /// Content hash of the record block, base32 multibase.
    pub cid: String,

    /// Whether the record references a reply parent.
    /// Older logs were written without this field.
    #[serde(default)]
    pub is_reply: bool,
}

impl Post {
    /// The `(uri, cid)` pair identifying this post.
    pub fn id(&self) -> (&str, &str) {
        (&self.uri, &self.cid)
    }
}
