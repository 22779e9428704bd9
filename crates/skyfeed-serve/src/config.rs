//! Application configuration loaded from environment variables.

use anyhow::Context;
use skyfeed_core::FeedLogConfig;
use skyfeed_ingest::{FirehoseConfig, WorkerConfig};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:3333").
    pub bind_addr: String,

    /// Directory holding one log file per feed.
    pub data_dir: PathBuf,

    /// Public hostname of this service, used for the DID document.
    pub hostname: String,

    /// `did:web:<hostname>`
    pub service_did: String,

    /// DID of the account that publishes the feed generator records.
    pub publisher_did: String,

    /// Websocket URL of the commit firehose.
    pub firehose_url: String,

    /// Wait between a dropped firehose connection and the next attempt.
    pub reconnect_delay: Duration,

    /// Drop replies before routing.
    pub top_level_only: bool,

    /// Entries per skeleton page.
    pub page_size: usize,

    /// Prometheus exporter port; 0 disables it.
    pub metrics_port: u16,

    /// `sync_data` after every append.
    pub fsync: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - None (all have defaults for local development)
    ///
    /// Optional:
    /// - `SKYFEED_BIND_ADDR`: Server bind address (default: "0.0.0.0:3333")
    /// - `PORT`: Replaces the port of the bind address
    /// - `SKYFEED_DATA_DIR`: Feed log directory (default: "./data")
    /// - `SKYFEED_HOSTNAME`: Public hostname (default: "localhost")
    /// - `SKYFEED_PUBLISHER_DID`: Feed publisher DID (default: the service DID)
    /// - `SKYFEED_FIREHOSE_URL`: Firehose URL (default: "wss://bsky.network")
    /// - `SKYFEED_RECONNECT_DELAY_SECS`: Reconnect delay (default: 5)
    /// - `SKYFEED_TOP_LEVEL_ONLY`: Ignore replies (default: false)
    /// - `SKYFEED_PAGE_SIZE`: Skeleton page size (default: 5)
    /// - `SKYFEED_METRICS_PORT`: Prometheus port, 0 to disable (default: 9090)
    /// - `SKYFEED_FSYNC`: Sync every append to disk (default: false)
    pub fn from_env() -> anyhow::Result<Self> {
        let mut bind_addr =
            std::env::var("SKYFEED_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3333".to_string());
        if let Some(port) = env_parse::<u16>("PORT")? {
            let host = bind_addr
                .rsplit_once(':')
                .map_or(bind_addr.as_str(), |(host, _)| host);
            bind_addr = format!("{}:{}", host, port);
        }

        let data_dir = PathBuf::from(
            std::env::var("SKYFEED_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
        );

        let hostname = std::env::var("SKYFEED_HOSTNAME")
            .unwrap_or_else(|_| "localhost".to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();
        if hostname.is_empty() {
            anyhow::bail!("SKYFEED_HOSTNAME must not be empty");
        }
        let service_did = format!("did:web:{}", hostname);

        let publisher_did = std::env::var("SKYFEED_PUBLISHER_DID")
            .ok()
            .map(|did| did.trim().to_string())
            .filter(|did| !did.is_empty())
            .unwrap_or_else(|| service_did.clone());
        if !publisher_did.starts_with("did:") {
            anyhow::bail!("SKYFEED_PUBLISHER_DID must be a DID, got {}", publisher_did);
        }

        let firehose_url = std::env::var("SKYFEED_FIREHOSE_URL")
            .unwrap_or_else(|_| "wss://bsky.network".to_string());

        let reconnect_delay =
            Duration::from_secs(env_parse::<u64>("SKYFEED_RECONNECT_DELAY_SECS")?.unwrap_or(5));

        let top_level_only = env_bool("SKYFEED_TOP_LEVEL_ONLY")?.unwrap_or(false);

        let page_size = env_parse::<usize>("SKYFEED_PAGE_SIZE")?.unwrap_or(5);
        if page_size == 0 {
            anyhow::bail!("SKYFEED_PAGE_SIZE must be at least 1");
        }

        let metrics_port = env_parse::<u16>("SKYFEED_METRICS_PORT")?.unwrap_or(9090);

        let fsync = env_bool("SKYFEED_FSYNC")?.unwrap_or(false);

        tracing::info!(
            bind_addr = %bind_addr,
            data_dir = %data_dir.display(),
            service_did = %service_did,
            publisher_did = %publisher_did,
            firehose_url = %firehose_url,
            page_size,
            "configuration loaded"
        );

        Ok(Self {
            bind_addr,
            data_dir,
            hostname,
            service_did,
            publisher_did,
            firehose_url,
            reconnect_delay,
            top_level_only,
            page_size,
            metrics_port,
            fsync,
        })
    }

    pub fn feed_log_config(&self) -> FeedLogConfig {
        FeedLogConfig {
            data_dir: self.data_dir.clone(),
            fsync: self.fsync,
        }
    }

    pub fn firehose_config(&self) -> FirehoseConfig {
        FirehoseConfig {
            url: self.firehose_url.clone(),
            reconnect_delay: self.reconnect_delay,
            ..Default::default()
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            top_level_only: self.top_level_only,
            ..Default::default()
        }
    }
}

/// Parse an optional variable; unset or blank is `None`.
fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        _ => Ok(None),
    }
}

fn env_bool(key: &str) -> anyhow::Result<Option<bool>> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => anyhow::bail!("invalid value for {}: {:?} (expected true/false)", key, raw),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize config tests that manipulate env vars.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "SKYFEED_BIND_ADDR",
        "PORT",
        "SKYFEED_DATA_DIR",
        "SKYFEED_HOSTNAME",
        "SKYFEED_PUBLISHER_DID",
        "SKYFEED_FIREHOSE_URL",
        "SKYFEED_RECONNECT_DELAY_SECS",
        "SKYFEED_TOP_LEVEL_ONLY",
        "SKYFEED_PAGE_SIZE",
        "SKYFEED_METRICS_PORT",
        "SKYFEED_FSYNC",
    ];

    /// Run `f` with only `vars` set among [`ENV_KEYS`].
    fn with_env_vars<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

        let saved: Vec<_> = ENV_KEYS
            .iter()
            .map(|k| (*k, std::env::var(k).ok()))
            .collect();

        // SAFETY: Serialized by mutex; only test code touches these vars.
        unsafe {
            for k in ENV_KEYS {
                std::env::remove_var(k);
            }
            for (k, v) in vars {
                std::env::set_var(k, v);
            }
        }

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));

        // SAFETY: Restoring original env state.
        unsafe {
            for (k, v) in &saved {
                match v {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }

        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
    }

    #[test]
    fn config_defaults() {
        with_env_vars(&[], || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.bind_addr, "0.0.0.0:3333");
            assert_eq!(config.data_dir, PathBuf::from("./data"));
            assert_eq!(config.hostname, "localhost");
            assert_eq!(config.service_did, "did:web:localhost");
            assert_eq!(config.publisher_did, "did:web:localhost");
            assert_eq!(config.firehose_url, "wss://bsky.network");
            assert_eq!(config.reconnect_delay, Duration::from_secs(5));
            assert!(!config.top_level_only);
            assert_eq!(config.page_size, 5);
            assert_eq!(config.metrics_port, 9090);
            assert!(!config.fsync);
        });
    }

    #[test]
    fn config_custom_values() {
        with_env_vars(
            &[
                ("SKYFEED_BIND_ADDR", "127.0.0.1:8000"),
                ("SKYFEED_DATA_DIR", "/var/lib/skyfeed"),
                ("SKYFEED_HOSTNAME", "feeds.example.com"),
                ("SKYFEED_PUBLISHER_DID", "did:plc:publisher"),
                ("SKYFEED_FIREHOSE_URL", "ws://localhost:2470"),
                ("SKYFEED_RECONNECT_DELAY_SECS", "10"),
                ("SKYFEED_TOP_LEVEL_ONLY", "true"),
                ("SKYFEED_PAGE_SIZE", "30"),
                ("SKYFEED_METRICS_PORT", "0"),
                ("SKYFEED_FSYNC", "1"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.bind_addr, "127.0.0.1:8000");
                assert_eq!(config.data_dir, PathBuf::from("/var/lib/skyfeed"));
                assert_eq!(config.service_did, "did:web:feeds.example.com");
                assert_eq!(config.publisher_did, "did:plc:publisher");
                assert_eq!(config.firehose_url, "ws://localhost:2470");
                assert_eq!(config.reconnect_delay, Duration::from_secs(10));
                assert!(config.top_level_only);
                assert_eq!(config.page_size, 30);
                assert_eq!(config.metrics_port, 0);
                assert!(config.fsync);

                assert_eq!(config.firehose_config().reconnect_delay, Duration::from_secs(10));
                assert!(config.worker_config().top_level_only);
                assert!(config.feed_log_config().fsync);
            },
        );
    }

    #[test]
    fn config_port_overrides_bind_port() {
        with_env_vars(
            &[("SKYFEED_BIND_ADDR", "127.0.0.1:8000"), ("PORT", "4000")],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.bind_addr, "127.0.0.1:4000");
            },
        );
    }

    #[test]
    fn config_rejects_invalid_numbers() {
        with_env_vars(&[("SKYFEED_PAGE_SIZE", "many")], || {
            assert!(Config::from_env().is_err());
        });
        with_env_vars(&[("SKYFEED_PAGE_SIZE", "0")], || {
            assert!(Config::from_env().is_err());
        });
        with_env_vars(&[("PORT", "99999")], || {
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn config_rejects_invalid_bool() {
        with_env_vars(&[("SKYFEED_FSYNC", "maybe")], || {
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn config_rejects_non_did_publisher() {
        with_env_vars(&[("SKYFEED_PUBLISHER_DID", "alice.bsky.social")], || {
            assert!(Config::from_env().is_err());
        });
    }
}
