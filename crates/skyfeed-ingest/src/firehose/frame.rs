//! Decoding of `com.atproto.sync.subscribeRepos` frames.
//!
//! Every binary websocket message is two DAG-CBOR values back to back:
//!
//! ```text
//! [header {op: 1, t: "#commit"}][body {repo, ops: [{action, path, cid}], blocks, ..}]
//! [header {op: -1}]             [body {error, message}]
//! ```
//!
//! Only `#commit` bodies matter here. Their `blocks` field is a CAR archive
//! from which the records created by the commit's ops are read.

use super::car::{CarBlocks, Cid};
use crate::error::{Error, Result};
use ciborium::Value;
use skyfeed_core::{POST_COLLECTION, Post};
use tracing::debug;

/// Frame header op for a regular message.
const OP_MESSAGE: i128 = 1;

/// Frame header op for an error frame.
const OP_ERROR: i128 = -1;

/// CBOR tag for a CID link in DAG-CBOR.
const TAG_CID: u64 = 42;

/// A decoded subscription frame.
#[derive(Debug)]
pub enum Frame {
    /// A repository commit.
    Commit(Commit),

    /// Any other message type (`#identity`, `#account`, `#info`, ...).
    Other(String),

    /// The upstream reported an error and will close the stream.
    Error { error: String, message: String },
}

/// The parts of a commit body needed to extract posts.
#[derive(Debug)]
pub struct Commit {
    /// DID of the repository that changed.
    pub repo: String,

    pub ops: Vec<RepoOp>,

    /// CAR archive with the blocks touched by the commit.
    pub blocks: Vec<u8>,
}

/// One record operation within a commit.
#[derive(Debug)]
pub struct RepoOp {
    /// `create`, `update` or `delete`.
    pub action: String,

    /// `<collection>/<rkey>`
    pub path: String,

    /// CID of the new record; absent for deletes.
    pub cid: Option<Cid>,
}

impl RepoOp {
    fn is_post_create(&self) -> bool {
        self.action == "create"
            && self
                .path
                .strip_prefix(POST_COLLECTION)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Posts recovered from one commit.
#[derive(Debug, Default)]
pub struct CommitPosts {
    pub posts: Vec<Post>,

    /// Post-creation ops that were skipped because their record was missing
    /// from the CAR or failed to decode.
    pub malformed: usize,
}

/// Decode one binary websocket message.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    let mut reader = bytes;
    let header = read_value(&mut reader, "frame header")?;
    let body = read_value(&mut reader, "frame body")?;

    let header = as_map(&header, "frame header")?;
    let op = match field(header, "op") {
        Some(Value::Integer(op)) => i128::from(*op),
        _ => return Err(Error::Decode("frame header missing op".to_string())),
    };

    match op {
        OP_ERROR => {
            let body = as_map(&body, "error body")?;
            Ok(Frame::Error {
                error: text_field(body, "error").unwrap_or("Unknown").to_string(),
                message: text_field(body, "message").unwrap_or_default().to_string(),
            })
        }
        OP_MESSAGE => {
            let kind = text_field(header, "t")
                .ok_or_else(|| Error::Decode("frame header missing t".to_string()))?;
            if kind == "#commit" {
                Ok(Frame::Commit(decode_commit(&body)?))
            } else {
                Ok(Frame::Other(kind.to_string()))
            }
        }
        other => Err(Error::Decode(format!("unknown frame op {}", other))),
    }
}

fn decode_commit(body: &Value) -> Result<Commit> {
    let body = as_map(body, "commit body")?;

    let repo = text_field(body, "repo")
        .ok_or_else(|| Error::Decode("commit missing repo".to_string()))?
        .to_string();

    let blocks = match field(body, "blocks") {
        Some(Value::Bytes(bytes)) => bytes.clone(),
        _ => return Err(Error::Decode("commit missing blocks".to_string())),
    };

    let ops = match field(body, "ops") {
        Some(Value::Array(ops)) => ops
            .iter()
            .map(decode_op)
            .collect::<Result<Vec<_>>>()?,
        _ => return Err(Error::Decode("commit missing ops".to_string())),
    };

    Ok(Commit { repo, ops, blocks })
}

fn decode_op(op: &Value) -> Result<RepoOp> {
    let op = as_map(op, "repo op")?;
    let action = text_field(op, "action")
        .ok_or_else(|| Error::Decode("op missing action".to_string()))?;
    let path =
        text_field(op, "path").ok_or_else(|| Error::Decode("op missing path".to_string()))?;
    let cid = match field(op, "cid") {
        None | Some(Value::Null) => None,
        Some(value) => Some(as_cid(value)?),
    };

    Ok(RepoOp {
        action: action.to_string(),
        path: path.to_string(),
        cid,
    })
}

/// Extract every post created by `commit`.
///
/// A CAR archive that cannot be parsed fails the whole commit. Individual
/// records that are missing or malformed are skipped and counted. Records
/// without text are ignored.
pub fn extract_posts(commit: &Commit) -> Result<CommitPosts> {
    let mut out = CommitPosts::default();
    if !commit.ops.iter().any(RepoOp::is_post_create) {
        return Ok(out);
    }

    let car = CarBlocks::read(&commit.blocks)?;

    for op in commit.ops.iter().filter(|op| op.is_post_create()) {
        let Some(cid) = &op.cid else {
            out.malformed += 1;
            continue;
        };
        let Some(block) = car.get(cid) else {
            debug!("Record {} missing from commit blocks", op.path);
            out.malformed += 1;
            continue;
        };

        match decode_post_record(block) {
            Ok(Some(record)) => out.posts.push(Post {
                author: commit.repo.clone(),
                text: record.text,
                created_at: record.created_at,
                uri: format!("at://{}/{}", commit.repo, op.path),
                cid: cid.to_string(),
                is_reply: record.is_reply,
            }),
            Ok(None) => {}
            Err(e) => {
                debug!("Skipping malformed record {}: {}", op.path, e);
                out.malformed += 1;
            }
        }
    }

    Ok(out)
}

struct PostRecord {
    text: String,
    created_at: String,
    is_reply: bool,
}

/// Decode an `app.bsky.feed.post` record block. `None` when it has no text.
fn decode_post_record(block: &[u8]) -> Result<Option<PostRecord>> {
    let mut reader = block;
    let record = read_value(&mut reader, "post record")?;
    let record = as_map(&record, "post record")?;

    let text = match text_field(record, "text") {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => return Ok(None),
    };

    Ok(Some(PostRecord {
        text,
        created_at: text_field(record, "createdAt")
            .unwrap_or_default()
            .to_string(),
        is_reply: !matches!(field(record, "reply"), None | Some(Value::Null)),
    }))
}

// ═══════════════════════════════════════════════════════════════════════════
// CBOR value helpers
// ═══════════════════════════════════════════════════════════════════════════

fn read_value(reader: &mut &[u8], what: &str) -> Result<Value> {
    ciborium::de::from_reader(reader).map_err(|e| Error::Decode(format!("{}: {}", what, e)))
}

fn as_map<'a>(value: &'a Value, what: &str) -> Result<&'a [(Value, Value)]> {
    match value {
        Value::Map(entries) => Ok(entries),
        _ => Err(Error::Decode(format!("{} is not a map", what))),
    }
}

fn field<'a>(map: &'a [(Value, Value)], name: &str) -> Option<&'a Value> {
    map.iter().find_map(|(key, value)| match key {
        Value::Text(key) if key == name => Some(value),
        _ => None,
    })
}

fn text_field<'a>(map: &'a [(Value, Value)], name: &str) -> Option<&'a str> {
    match field(map, name) {
        Some(Value::Text(text)) => Some(text),
        _ => None,
    }
}

fn as_cid(value: &Value) -> Result<Cid> {
    match value {
        Value::Tag(TAG_CID, inner) => match inner.as_ref() {
            Value::Bytes(bytes) => Cid::from_tag_bytes(bytes),
            _ => Err(Error::Decode("CID tag does not wrap bytes".to_string())),
        },
        _ => Err(Error::Decode("expected CID link".to_string())),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::firehose::car::tests::{build_car, test_cid};

    pub(crate) fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    pub(crate) fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(entries.into_iter().map(|(k, v)| (text(k), v)).collect())
    }

    pub(crate) fn link(cid: &Cid) -> Value {
        let mut bytes = vec![0x00];
        bytes.extend_from_slice(cid.as_bytes());
        Value::Tag(TAG_CID, Box::new(Value::Bytes(bytes)))
    }

    pub(crate) fn cbor(value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(value, &mut out).unwrap();
        out
    }

    pub(crate) fn frame(header: Value, body: Value) -> Vec<u8> {
        let mut out = cbor(&header);
        out.extend(cbor(&body));
        out
    }

    pub(crate) fn post_record(text_value: &str, reply: bool) -> Vec<u8> {
        let mut entries = vec![
            ("$type", text("app.bsky.feed.post")),
            ("text", text(text_value)),
            ("createdAt", text("2024-11-20T10:00:00.000Z")),
        ];
        if reply {
            entries.push((
                "reply",
                map(vec![
                    ("parent", map(vec![("uri", text("at://parent"))])),
                    ("root", map(vec![("uri", text("at://root"))])),
                ]),
            ));
        }
        cbor(&map(entries))
    }

    /// A commit frame creating one post per `(rkey, text, is_reply)`.
    pub(crate) fn commit_frame(repo: &str, posts: &[(&str, &str, bool)]) -> Vec<u8> {
        let mut blocks = Vec::new();
        let mut ops = Vec::new();
        for (i, (rkey, body, reply)) in posts.iter().enumerate() {
            let cid = test_cid(i as u8 * 3 + 1);
            blocks.push((cid.clone(), post_record(body, *reply)));
            ops.push(map(vec![
                ("action", text("create")),
                ("path", text(&format!("app.bsky.feed.post/{rkey}"))),
                ("cid", link(&cid)),
            ]));
        }

        frame(
            map(vec![("op", Value::Integer(1.into())), ("t", text("#commit"))]),
            map(vec![
                ("repo", text(repo)),
                ("seq", Value::Integer(42.into())),
                ("ops", Value::Array(ops)),
                ("blocks", Value::Bytes(build_car(&blocks))),
            ]),
        )
    }

    fn decode_commit_frame(bytes: &[u8]) -> Commit {
        match decode_frame(bytes).unwrap() {
            Frame::Commit(commit) => commit,
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_commit_extracts_posts() {
        let bytes = commit_frame(
            "did:plc:alice",
            &[("3kaaa", "see github.com/x", false), ("3kbbb", "a reply", true)],
        );
        let commit = decode_commit_frame(&bytes);
        assert_eq!(commit.repo, "did:plc:alice");
        assert_eq!(commit.ops.len(), 2);

        let extracted = extract_posts(&commit).unwrap();
        assert_eq!(extracted.malformed, 0);
        assert_eq!(extracted.posts.len(), 2);

        let first = &extracted.posts[0];
        assert_eq!(first.author, "did:plc:alice");
        assert_eq!(first.text, "see github.com/x");
        assert_eq!(first.created_at, "2024-11-20T10:00:00.000Z");
        assert_eq!(first.uri, "at://did:plc:alice/app.bsky.feed.post/3kaaa");
        assert_eq!(first.cid, test_cid(1).to_string());
        assert!(!first.is_reply);
        assert!(extracted.posts[1].is_reply);
    }

    #[test]
    fn test_non_commit_frames() {
        let bytes = frame(
            map(vec![("op", Value::Integer(1.into())), ("t", text("#identity"))]),
            map(vec![("did", text("did:plc:alice"))]),
        );
        assert!(matches!(decode_frame(&bytes).unwrap(), Frame::Other(t) if t == "#identity"));
    }

    #[test]
    fn test_error_frame() {
        let bytes = frame(
            map(vec![("op", Value::Integer((-1).into()))]),
            map(vec![
                ("error", text("ConsumerTooSlow")),
                ("message", text("too slow")),
            ]),
        );
        match decode_frame(&bytes).unwrap() {
            Frame::Error { error, message } => {
                assert_eq!(error, "ConsumerTooSlow");
                assert_eq!(message, "too slow");
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_frame_is_decode_error() {
        let bytes = commit_frame("did:plc:alice", &[("3k", "hello", false)]);
        let err = decode_frame(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_ignores_other_collections_and_actions() {
        let cid = test_cid(9);
        let bytes = frame(
            map(vec![("op", Value::Integer(1.into())), ("t", text("#commit"))]),
            map(vec![
                ("repo", text("did:plc:bob")),
                (
                    "ops",
                    Value::Array(vec![
                        map(vec![
                            ("action", text("create")),
                            ("path", text("app.bsky.feed.like/3k")),
                            ("cid", link(&cid)),
                        ]),
                        map(vec![
                            ("action", text("delete")),
                            ("path", text("app.bsky.feed.post/3k")),
                            ("cid", Value::Null),
                        ]),
                        map(vec![
                            ("action", text("create")),
                            ("path", text("app.bsky.feed.postgate/3k")),
                            ("cid", link(&cid)),
                        ]),
                    ]),
                ),
                // Not a CAR at all: must not be parsed when no post is created.
                ("blocks", Value::Bytes(vec![0xFF])),
            ]),
        );
        let commit = decode_commit_frame(&bytes);
        let extracted = extract_posts(&commit).unwrap();
        assert!(extracted.posts.is_empty());
        assert_eq!(extracted.malformed, 0);
    }

    #[test]
    fn test_missing_block_and_bad_record_are_counted() {
        let present = test_cid(1);
        let absent = test_cid(2);
        let car = build_car(&[(present.clone(), vec![0xFF, 0x00])]);
        let bytes = frame(
            map(vec![("op", Value::Integer(1.into())), ("t", text("#commit"))]),
            map(vec![
                ("repo", text("did:plc:bob")),
                (
                    "ops",
                    Value::Array(vec![
                        map(vec![
                            ("action", text("create")),
                            ("path", text("app.bsky.feed.post/a")),
                            ("cid", link(&present)),
                        ]),
                        map(vec![
                            ("action", text("create")),
                            ("path", text("app.bsky.feed.post/b")),
                            ("cid", link(&absent)),
                        ]),
                    ]),
                ),
                ("blocks", Value::Bytes(car)),
            ]),
        );
        let extracted = extract_posts(&decode_commit_frame(&bytes)).unwrap();
        assert!(extracted.posts.is_empty());
        assert_eq!(extracted.malformed, 2);
    }

    #[test]
    fn test_record_without_text_is_ignored() {
        let bytes = commit_frame("did:plc:carol", &[("3k", "", false)]);
        let extracted = extract_posts(&decode_commit_frame(&bytes)).unwrap();
        assert!(extracted.posts.is_empty());
        assert_eq!(extracted.malformed, 0);
    }

    #[test]
    fn test_corrupt_car_fails_commit() {
        let cid = test_cid(1);
        let bytes = frame(
            map(vec![("op", Value::Integer(1.into())), ("t", text("#commit"))]),
            map(vec![
                ("repo", text("did:plc:bob")),
                (
                    "ops",
                    Value::Array(vec![map(vec![
                        ("action", text("create")),
                        ("path", text("app.bsky.feed.post/a")),
                        ("cid", link(&cid)),
                    ])]),
                ),
                ("blocks", Value::Bytes(vec![0x05, 0x01])),
            ]),
        );
        assert!(extract_posts(&decode_commit_frame(&bytes)).is_err());
    }
}
