use crate::error::{Result, SyncdexError};
use crate::types::FederationMode;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables for event draining, flush-waits and query federation.
///
/// Build one with [`SyncConfig::default`], [`SyncConfig::from_env`]
/// (`SYNCDEX_*` variables) or [`SyncConfig::load`] (a JSON file). Missing
/// keys in the file fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Bounded buffer size of each partition's event log.
    pub queue_capacity: usize,
    /// Max events a drain worker commits in one batch.
    pub batch_size: usize,
    pub max_apply_retries: u32,
    /// Initial retry delay; doubled on every attempt.
    pub retry_backoff_ms: u64,
    pub writer_heap_bytes: usize,
    pub query_timeout_ms: u64,
    /// Fallback re-check period for flush-waits.
    pub flush_poll_interval_ms: u64,
    pub federation_mode: FederationMode,
    pub default_limit: usize,
    /// 0 returns every row in a single page.
    pub default_page_size: usize,
    /// Root for on-disk repositories and event journals. RAM only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            queue_capacity: 1000,
            batch_size: 64,
            max_apply_retries: 3,
            retry_backoff_ms: 50,
            writer_heap_bytes: 15_000_000,
            query_timeout_ms: 30_000,
            flush_poll_interval_ms: 250,
            federation_mode: FederationMode::FailFast,
            default_limit: 100,
            default_page_size: 0,
            data_dir: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(fallback)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let d = SyncConfig::default();
        let federation_mode = match env::var("SYNCDEX_FEDERATION_MODE").ok().as_deref() {
            Some("partial") => FederationMode::Partial,
            Some("fail_fast") => FederationMode::FailFast,
            Some(other) => {
                tracing::warn!(
                    "Unknown SYNCDEX_FEDERATION_MODE '{}', using fail_fast",
                    other
                );
                FederationMode::FailFast
            }
            None => d.federation_mode,
        };
        SyncConfig {
            queue_capacity: env_parse("SYNCDEX_QUEUE_CAPACITY", d.queue_capacity),
            batch_size: env_parse("SYNCDEX_BATCH_SIZE", d.batch_size),
            max_apply_retries: env_parse("SYNCDEX_MAX_APPLY_RETRIES", d.max_apply_retries),
            retry_backoff_ms: env_parse("SYNCDEX_RETRY_BACKOFF_MS", d.retry_backoff_ms),
            writer_heap_bytes: env_parse("SYNCDEX_WRITER_HEAP_BYTES", d.writer_heap_bytes),
            query_timeout_ms: env_parse("SYNCDEX_QUERY_TIMEOUT_MS", d.query_timeout_ms),
            flush_poll_interval_ms: env_parse(
                "SYNCDEX_FLUSH_POLL_INTERVAL_MS",
                d.flush_poll_interval_ms,
            ),
            federation_mode,
            default_limit: env_parse("SYNCDEX_DEFAULT_LIMIT", d.default_limit),
            default_page_size: env_parse("SYNCDEX_DEFAULT_PAGE_SIZE", d.default_page_size),
            data_dir: env::var("SYNCDEX_DATA_DIR").ok().map(PathBuf::from),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SyncConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(SyncdexError::Config(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(SyncdexError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.default_limit == 0 {
            return Err(SyncdexError::Config(
                "default_limit must be at least 1".to_string(),
            ));
        }
        if self.flush_poll_interval_ms == 0 {
            return Err(SyncdexError::Config(
                "flush_poll_interval_ms must be at least 1".to_string(),
            ));
        }
        // tantivy refuses smaller per-thread arenas
        if self.writer_heap_bytes < 15_000_000 {
            return Err(SyncdexError::Config(format!(
                "writer_heap_bytes {} is below the 15000000 byte minimum",
                self.writer_heap_bytes
            )));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn flush_poll_interval(&self) -> Duration {
        Duration::from_millis(self.flush_poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
