//! Per-feed append-only log with cursor pagination.
//!
//! This module provides the [`FeedLog`], the durable record of every post
//! routed to a feed. Each feed owns one file under the data directory:
//!
//! ```text
//! <data_dir>/<feed_key>.json
//! {"author":"did:plc:..","text":"..","createdAt":"..","uri":"at://..","cid":"..","isReply":false}
//! {"author":"did:plc:..", ...}
//! ...
//! ```
//!
//! One JSON record per line, in append order. The file is both the durable
//! log and the only bootstrap source on restart: [`FeedLog::initialize`]
//! loads every line into an in-memory mirror, and reads are served from
//! that mirror without touching the disk.
//!
//! # Pagination
//!
//! Pages are returned newest-first. A cursor is the absolute offset one past
//! the oldest entry that has not been returned yet, so repeatedly following
//! the returned cursor walks the whole history backwards exactly once.
//!
//! # Ownership
//!
//! The log has a single writer (the supervisor). Readers share it through
//! [`SharedFeedLog`].

use crate::error::{Error, Result};
use crate::feed::validate_key;
use crate::post::Post;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A feed log shared between the supervisor (writer) and request handlers.
pub type SharedFeedLog = Arc<RwLock<FeedLog>>;

/// Configuration for the feed log.
#[derive(Debug, Clone)]
pub struct FeedLogConfig {
    /// Directory holding one log file per feed.
    /// Default: `./data`
    pub data_dir: PathBuf,

    /// Call `sync_data` after every append.
    /// Default: false (the write reaches the OS before `append` returns, but
    /// is not forced to stable storage)
    pub fsync: bool,
}

impl Default for FeedLogConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync: false,
        }
    }
}

/// One page of a feed, newest entry first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub posts: Vec<Post>,

    /// Cursor for the next (older) page; `None` when pagination ends.
    pub cursor: Option<String>,
}

/// Size information about one feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedLogStats {
    pub key: String,
    pub entries: usize,
    pub file_size_bytes: u64,
}

/// In-memory mirror and open writer for one feed.
struct FeedEntries {
    posts: Vec<Post>,
    /// Opened lazily on first append.
    writer: Option<File>,
    size_bytes: u64,
}

impl FeedEntries {
    fn empty() -> Self {
        Self {
            posts: Vec::new(),
            writer: None,
            size_bytes: 0,
        }
    }
}

/// Durable, ordered, per-feed record of matched posts.
pub struct FeedLog {
    config: FeedLogConfig,
    feeds: HashMap<String, FeedEntries>,
}

impl FeedLog {
    /// Create the data directory and load the log of every feed in `keys`.
    ///
    /// A missing file is an empty feed. Any other I/O error, or a record that
    /// cannot be parsed, is returned and should abort startup.
    ///
    /// A final line without its terminating newline is the remains of an
    /// interrupted append; it is truncated away with a warning.
    pub fn initialize<'a, I>(config: FeedLogConfig, keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        fs::create_dir_all(&config.data_dir)?;

        let mut log = Self {
            config,
            feeds: HashMap::new(),
        };

        for key in keys {
            validate_key(key)?;
            let entries = log.load_feed(key)?;
            info!(
                "Loaded feed {}: {} entries, {} bytes",
                key,
                entries.posts.len(),
                entries.size_bytes
            );
            log.feeds.insert(key.to_string(), entries);
        }

        info!(
            "FeedLog initialized: data_dir={}, feeds={}",
            log.config.data_dir.display(),
            log.feeds.len()
        );

        Ok(log)
    }

    /// Path of the log file for `key`.
    pub fn path(&self, key: &str) -> PathBuf {
        self.config.data_dir.join(format!("{}.json", key))
    }

    fn load_feed(&self, key: &str) -> Result<FeedEntries> {
        let path = self.path(key);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No log file for feed {}, starting empty", key);
                return Ok(FeedEntries::empty());
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let mut posts = Vec::new();
        let mut offset = 0usize;

        for (index, line) in content.split_inclusive('\n').enumerate() {
            let complete = line.ends_with('\n');
            let record = line.trim();

            if !record.is_empty() {
                match serde_json::from_str::<Post>(record) {
                    Ok(post) => posts.push(post),
                    Err(e) if !complete => {
                        warn!(
                            "Truncating torn record at end of {} (line {}): {}",
                            path.display(),
                            index + 1,
                            e
                        );
                        truncate(&path, offset as u64)?;
                        return Ok(FeedEntries {
                            posts,
                            writer: None,
                            size_bytes: offset as u64,
                        });
                    }
                    Err(source) => {
                        return Err(Error::CorruptLog {
                            path,
                            line: index + 1,
                            source,
                        });
                    }
                }
            }

            if !complete {
                // Record parsed but lost its newline; restore it so the next
                // append starts on a fresh line.
                let mut file = OpenOptions::new().append(true).open(&path)?;
                file.write_all(b"\n")?;
                offset += line.len() + 1;
                break;
            }

            offset += line.len();
        }

        Ok(FeedEntries {
            posts,
            writer: None,
            size_bytes: offset as u64,
        })
    }

    /// Append `post` to the feed `key`, creating the feed if it is new.
    ///
    /// The post is added to the in-memory mirror and then written as one line
    /// to the feed's file. If the write fails the mirror is rolled back and
    /// the error is returned, so memory and disk never disagree on length.
    pub fn append(&mut self, key: &str, post: Post) -> Result<()> {
        validate_key(key)?;

        let mut line = serde_json::to_vec(&post)?;
        line.push(b'\n');

        let path = self.path(key);
        let fsync = self.config.fsync;
        let entries = self
            .feeds
            .entry(key.to_string())
            .or_insert_with(FeedEntries::empty);

        entries.posts.push(post);

        if let Err(e) = write_line(entries, &path, &line, fsync) {
            entries.posts.pop();
            // Drop the handle so the next attempt reopens the file.
            entries.writer = None;
            return Err(Error::Io(e));
        }

        entries.size_bytes += line.len() as u64;

        metrics::counter!("feedlog_appends_total", "feed" => key.to_string()).increment(1);
        metrics::counter!("feedlog_bytes_written_total").increment(line.len() as u64);

        Ok(())
    }

    /// Read one page of `key`, newest first.
    ///
    /// - Without a cursor: the last `limit` entries. The next cursor is
    ///   `len - limit`, set only when a full page was returned.
    /// - With cursor `c` in `[0, len)`: entries `[max(0, c - limit), c)`. The
    ///   next cursor is `c - limit`, again only for a full page.
    /// - A cursor that does not parse, or falls outside `[0, len)`, yields an
    ///   empty page with no cursor. Unknown feeds are empty.
    pub fn get_page(&self, key: &str, limit: usize, cursor: Option<&str>) -> Page {
        let posts = match self.feeds.get(key) {
            Some(entries) => &entries.posts,
            None => return Page::default(),
        };
        if limit == 0 {
            return Page::default();
        }

        let len = posts.len();
        let end = match cursor {
            None => len,
            Some(raw) => match raw.parse::<usize>() {
                Ok(c) if c < len => c,
                _ => return Page::default(),
            },
        };
        let start = end.saturating_sub(limit);

        let page: Vec<Post> = posts[start..end].iter().rev().cloned().collect();
        let cursor = (page.len() == limit).then(|| (end - limit).to_string());

        Page {
            posts: page,
            cursor,
        }
    }

    /// Number of entries in `key` (0 for unknown feeds).
    pub fn len(&self, key: &str) -> usize {
        self.feeds.get(key).map_or(0, |entries| entries.posts.len())
    }

    /// Whether `key` has no entries.
    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }

    /// The full in-memory sequence of `key`, oldest first.
    pub fn entries(&self, key: &str) -> &[Post] {
        self.feeds
            .get(key)
            .map_or(&[][..], |entries| entries.posts.as_slice())
    }

    /// Bytes in the on-disk log of `key`.
    pub fn file_size(&self, key: &str) -> u64 {
        self.feeds.get(key).map_or(0, |entries| entries.size_bytes)
    }

    /// Keys of every loaded or appended feed.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.feeds.keys().map(String::as_str)
    }

    /// Per-feed sizes, sorted by key.
    pub fn stats(&self) -> Vec<FeedLogStats> {
        let mut stats: Vec<FeedLogStats> = self
            .feeds
            .iter()
            .map(|(key, entries)| FeedLogStats {
                key: key.clone(),
                entries: entries.posts.len(),
                file_size_bytes: entries.size_bytes,
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    /// Force every open log file to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        for (key, entries) in &mut self.feeds {
            if let Some(writer) = entries.writer.as_mut() {
                writer.flush()?;
                writer.sync_all()?;
                debug!("Synced feed log {}", key);
            }
        }
        Ok(())
    }
}

/// Write one serialized line, opening the feed file on first use.
fn write_line(
    entries: &mut FeedEntries,
    path: &Path,
    line: &[u8],
    fsync: bool,
) -> std::io::Result<()> {
    if entries.writer.is_none() {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        entries.writer = Some(file);
    }
    let Some(writer) = entries.writer.as_mut() else {
        return Err(std::io::Error::other("feed log writer unavailable"));
    };

    // Unbuffered: a single write_all per record, nothing held in user space.
    writer.write_all(line)?;
    if fsync {
        writer.sync_data()?;
    }
    Ok(())
}

fn truncate(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}
