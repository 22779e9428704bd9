//! Reconnecting subscriber for the repository commit firehose.
//!
//! # Architecture
//!
//! [`FirehoseStream`] holds one websocket connection at a time. Each binary
//! message is decoded with [`frame::decode_frame`]; commits are turned into
//! posts with [`frame::extract_posts`] and handed to the caller's callback in
//! delivery order.
//!
//! Any stream-level failure (socket error, close frame, upstream error frame)
//! drops the connection. A new one is opened after a fixed delay, forever.
//! No cursor is kept, so events published during an outage are lost.
//!
//! ```text
//! Disconnected → Connecting → Streaming ─(error)→ Reconnecting → Connecting → ...
//!                                  └─(stop)→ ShuttingDown
//! ```

pub mod car;
pub mod frame;

use crate::error::{Error, Result};
use crate::source::PostSource;
use frame::Frame;
use futures_util::{Stream, StreamExt};
use skyfeed_core::Post;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

/// XRPC method path appended to the configured firehose URL.
const SUBSCRIBE_REPOS_PATH: &str = "/xrpc/com.atproto.sync.subscribeRepos";

/// Configuration for the firehose subscriber.
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    /// Base websocket URL of the relay (`ws://` or `wss://`).
    pub url: String,

    /// Fixed wait between a dropped connection and the next attempt.
    pub reconnect_delay: Duration,

    /// Upper bound on the websocket handshake.
    pub connect_timeout: Duration,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            url: "wss://bsky.network".to_string(),
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Lifecycle of the firehose connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Streaming = 2,
    Reconnecting = 3,
    /// Terminal; reached only through [`FirehoseStream::stop`].
    ShuttingDown = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Streaming,
            3 => Self::Reconnecting,
            4 => Self::ShuttingDown,
            _ => Self::Disconnected,
        }
    }
}

/// Live post source backed by the commit firehose.
pub struct FirehoseStream {
    config: FirehoseConfig,
    state: AtomicU8,
    /// Every upstream event seen, whether or not it produced a post.
    num_events: AtomicU64,
    stop_tx: watch::Sender<bool>,
}

impl FirehoseStream {
    pub fn new(config: FirehoseConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            num_events: AtomicU64::new(0),
            stop_tx,
        }
    }

    pub fn config(&self) -> &FirehoseConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Total upstream events seen since creation.
    pub fn num_events(&self) -> u64 {
        self.num_events.load(Ordering::Relaxed)
    }

    /// Ask [`run`](Self::run) to return. Takes effect at the next frame or
    /// during the reconnect wait. Irreversible.
    pub fn stop(&self) {
        self.set_state(ConnectionState::ShuttingDown);
        self.stop_tx.send_replace(true);
    }

    fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        // ShuttingDown is terminal.
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != ConnectionState::ShuttingDown as u8).then_some(state as u8)
            });
        metrics::gauge!("firehose_connected")
            .set(if self.state() == ConnectionState::Streaming { 1.0 } else { 0.0 });
    }

    /// Full subscription URL, or a configuration error.
    pub fn endpoint(&self) -> Result<String> {
        let url = self.config.url.trim().trim_end_matches('/');
        let host = url
            .strip_prefix("wss://")
            .or_else(|| url.strip_prefix("ws://"))
            .ok_or_else(|| {
                Error::Config(format!(
                    "firehose URL must start with ws:// or wss://: {}",
                    self.config.url
                ))
            })?;
        if host.is_empty() || host.starts_with('/') || host.contains(char::is_whitespace) {
            return Err(Error::Config(format!(
                "firehose URL has no valid host: {}",
                self.config.url
            )));
        }

        if url.ends_with(SUBSCRIBE_REPOS_PATH) {
            Ok(url.to_string())
        } else {
            Ok(format!("{}{}", url, SUBSCRIBE_REPOS_PATH))
        }
    }

    /// Subscribe and deliver posts until [`stop`](Self::stop) is called.
    ///
    /// With `top_level_only`, replies are dropped before reaching `on_post`.
    /// Returns `Ok(())` after a stop and `Err` only for an unusable
    /// configuration; connection failures are retried indefinitely.
    pub async fn run<F>(&self, mut on_post: F, top_level_only: bool) -> Result<()>
    where
        F: FnMut(Post),
    {
        let endpoint = self.endpoint()?;
        let mut stop_rx = self.stop_tx.subscribe();

        info!("Subscribing to firehose at {}", endpoint);

        while !self.is_stopped() {
            self.set_state(ConnectionState::Connecting);

            let session = tokio::select! {
                _ = stopped(&mut stop_rx) => break,
                result = self.session(&endpoint, &mut on_post, top_level_only) => result,
            };

            match session {
                Ok(()) => info!("Firehose connection closed"),
                Err(e) => warn!("Firehose connection lost: {}", e),
            }

            if self.is_stopped() {
                break;
            }

            self.set_state(ConnectionState::Reconnecting);
            metrics::counter!("firehose_reconnects_total").increment(1);
            info!(
                "Reconnecting to firehose in {}s",
                self.config.reconnect_delay.as_secs_f64()
            );

            tokio::select! {
                _ = stopped(&mut stop_rx) => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        self.set_state(ConnectionState::ShuttingDown);
        info!("Firehose subscription stopped after {} events", self.num_events());
        Ok(())
    }

    /// One connection from handshake to close.
    async fn session<F>(&self, endpoint: &str, on_post: &mut F, top_level_only: bool) -> Result<()>
    where
        F: FnMut(Post),
    {
        let connect = tokio_tungstenite::connect_async(endpoint);
        let (ws, _response) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "firehose handshake timed out",
                ))
            })??;

        self.set_state(ConnectionState::Streaming);
        info!("Connected to firehose");

        self.consume(ws, on_post, top_level_only).await
    }

    /// Drive an already-open message stream until it ends or fails.
    pub(crate) async fn consume<S, F>(
        &self,
        mut messages: S,
        on_post: &mut F,
        top_level_only: bool,
    ) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
        F: FnMut(Post),
    {
        while let Some(message) = messages.next().await {
            match message? {
                Message::Binary(bytes) => self.handle_frame(&bytes, on_post, top_level_only)?,
                Message::Close(frame) => {
                    debug!("Firehose sent close frame: {:?}", frame);
                    return Ok(());
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Decode and dispatch one binary message.
    ///
    /// Undecodable frames and records are skipped. Only an upstream error
    /// frame ends the connection.
    fn handle_frame<F>(&self, bytes: &[u8], on_post: &mut F, top_level_only: bool) -> Result<()>
    where
        F: FnMut(Post),
    {
        self.num_events.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("firehose_events_total").increment(1);

        let frame = match frame::decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Skipping undecodable frame: {}", e);
                metrics::counter!("firehose_decode_errors_total").increment(1);
                return Ok(());
            }
        };

        let commit = match frame {
            Frame::Commit(commit) => commit,
            Frame::Other(_) => return Ok(()),
            Frame::Error { error, message } => return Err(Error::Upstream { error, message }),
        };

        let extracted = match frame::extract_posts(&commit) {
            Ok(extracted) => extracted,
            Err(e) => {
                warn!("Skipping commit from {}: {}", commit.repo, e);
                metrics::counter!("firehose_decode_errors_total").increment(1);
                return Ok(());
            }
        };
        if extracted.malformed > 0 {
            metrics::counter!("firehose_decode_errors_total").increment(extracted.malformed as u64);
        }

        for post in extracted.posts {
            if top_level_only && post.is_reply {
                continue;
            }
            metrics::counter!("firehose_posts_total").increment(1);
            on_post(post);
        }

        Ok(())
    }
}

impl PostSource for FirehoseStream {
    fn name(&self) -> &'static str {
        "firehose"
    }

    fn events_seen(&self) -> u64 {
        self.num_events()
    }

    async fn run<F>(&self, on_post: F, top_level_only: bool) -> Result<()>
    where
        F: FnMut(Post),
    {
        FirehoseStream::run(self, on_post, top_level_only).await
    }

    fn stop(&self) {
        FirehoseStream::stop(self);
    }
}

/// Resolves once the stop flag is set.
async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}

#[cfg(test)]
mod tests {
    use super::frame::tests::{commit_frame, frame as raw_frame, map, text};
    use super::*;
    use ciborium::Value;
    use futures_util::stream;

    fn stream_with(config: FirehoseConfig) -> FirehoseStream {
        FirehoseStream::new(config)
    }

    fn binary(bytes: Vec<u8>) -> std::result::Result<Message, tungstenite::Error> {
        Ok(Message::binary(bytes))
    }

    #[test]
    fn test_endpoint() {
        let s = stream_with(FirehoseConfig::default());
        assert_eq!(
            s.endpoint().unwrap(),
            "wss://bsky.network/xrpc/com.atproto.sync.subscribeRepos"
        );

        let s = stream_with(FirehoseConfig {
            url: "ws://localhost:2470/".to_string(),
            ..Default::default()
        });
        assert_eq!(
            s.endpoint().unwrap(),
            "ws://localhost:2470/xrpc/com.atproto.sync.subscribeRepos"
        );

        let s = stream_with(FirehoseConfig {
            url: "wss://relay.example/xrpc/com.atproto.sync.subscribeRepos".to_string(),
            ..Default::default()
        });
        assert_eq!(
            s.endpoint().unwrap(),
            "wss://relay.example/xrpc/com.atproto.sync.subscribeRepos"
        );
    }

    #[test]
    fn test_endpoint_rejects_bad_urls() {
        for url in ["https://bsky.network", "bsky.network", "wss://", "wss:///path"] {
            let s = stream_with(FirehoseConfig {
                url: url.to_string(),
                ..Default::default()
            });
            assert!(matches!(s.endpoint(), Err(Error::Config(_))), "{url}");
        }
    }

    #[tokio::test]
    async fn test_run_with_invalid_url_is_unrecoverable() {
        let s = stream_with(FirehoseConfig {
            url: "not a url".to_string(),
            ..Default::default()
        });
        let result = s.run(|_| {}, false).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_consume_delivers_posts_in_order() {
        let s = stream_with(FirehoseConfig::default());
        let messages = stream::iter(vec![
            binary(commit_frame(
                "did:plc:a",
                &[("1", "first", false), ("2", "second", true)],
            )),
            Ok(Message::text("ignored")),
            binary(commit_frame("did:plc:b", &[("3", "third", false)])),
        ]);

        let mut seen = Vec::new();
        let mut on_post = |post: Post| seen.push(post.text);
        s.consume(messages, &mut on_post, false).await.unwrap();

        assert_eq!(seen, vec!["first", "second", "third"]);
        assert_eq!(s.num_events(), 2);
    }

    #[tokio::test]
    async fn test_consume_top_level_only_drops_replies() {
        let s = stream_with(FirehoseConfig::default());
        let messages = stream::iter(vec![binary(commit_frame(
            "did:plc:a",
            &[("1", "root post", false), ("2", "a reply", true)],
        ))]);

        let mut seen = Vec::new();
        let mut on_post = |post: Post| seen.push(post.text);
        s.consume(messages, &mut on_post, true).await.unwrap();

        assert_eq!(seen, vec!["root post"]);
    }

    #[tokio::test]
    async fn test_consume_skips_garbage_and_counts_other_events() {
        let s = stream_with(FirehoseConfig::default());
        let identity = raw_frame(
            map(vec![("op", Value::Integer(1.into())), ("t", text("#identity"))]),
            map(vec![("did", text("did:plc:a"))]),
        );
        let messages = stream::iter(vec![
            binary(vec![0xFF, 0xFF, 0xFF]),
            binary(identity),
            binary(commit_frame("did:plc:a", &[("1", "after garbage", false)])),
        ]);

        let mut count = 0;
        let mut on_post = |_: Post| count += 1;
        s.consume(messages, &mut on_post, false).await.unwrap();

        assert_eq!(count, 1);
        // Every binary frame is an event, decodable or not.
        assert_eq!(s.num_events(), 3);
    }

    #[tokio::test]
    async fn test_consume_error_frame_ends_connection() {
        let s = stream_with(FirehoseConfig::default());
        let error = raw_frame(
            map(vec![("op", Value::Integer((-1).into()))]),
            map(vec![("error", text("FutureCursor"))]),
        );
        let messages = stream::iter(vec![
            binary(error),
            binary(commit_frame("did:plc:a", &[("1", "never seen", false)])),
        ]);

        let mut count = 0;
        let mut on_post = |_: Post| count += 1;
        let result = s.consume(messages, &mut on_post, false).await;

        assert!(matches!(result, Err(Error::Upstream { .. })));
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_consume_close_frame_ends_connection() {
        let s = stream_with(FirehoseConfig::default());
        let messages = stream::iter(vec![
            Ok(Message::Close(None)),
            binary(commit_frame("did:plc:a", &[("1", "after close", false)])),
        ]);

        let mut count = 0;
        let mut on_post = |_: Post| count += 1;
        s.consume(messages, &mut on_post, false).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_stop_during_reconnect_wait() {
        // Nothing listens on port 9; every attempt fails and the loop waits.
        let s = stream_with(FirehoseConfig {
            url: "ws://127.0.0.1:9".to_string(),
            reconnect_delay: Duration::from_secs(3600),
            connect_timeout: Duration::from_secs(1),
        });

        let stopper = async {
            while s.state() != ConnectionState::Reconnecting {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            s.stop();
        };

        let (result, ()) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(s.run(|_| {}, false), stopper)
        })
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(s.state(), ConnectionState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_reconnect_resumes_streaming() {
        use futures_util::SinkExt;
        use tokio::net::TcpListener;

        // Each connection delivers one commit and then closes.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            for (rkey, body) in [("1", "first"), ("2", "second")] {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                ws.send(Message::binary(commit_frame("did:plc:a", &[(rkey, body, false)])))
                    .await
                    .unwrap();
                // The client may already be gone once it has stopped.
                let _ = ws.close(None).await;
                while let Some(Ok(_)) = ws.next().await {}
            }
        });

        let s = stream_with(FirehoseConfig {
            url: format!("ws://{addr}"),
            reconnect_delay: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(5),
        });

        let mut seen = Vec::new();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            s.run(
                |post: Post| {
                    seen.push(post.text);
                    if seen.len() == 2 {
                        s.stop();
                    }
                },
                false,
            ),
        )
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(seen, vec!["first", "second"]);
        assert_eq!(s.num_events(), 2);
        assert_eq!(s.state(), ConnectionState::ShuttingDown);
        server.await.unwrap();
    }

    #[test]
    fn test_shutting_down_is_terminal() {
        let s = stream_with(FirehoseConfig::default());
        assert_eq!(s.state(), ConnectionState::Disconnected);
        s.stop();
        s.set_state(ConnectionState::Connecting);
        assert_eq!(s.state(), ConnectionState::ShuttingDown);
    }
}
