//! Process-level configuration.
//!
//! Handles loading tuning knobs from environment variables with sensible
//! defaults. The per-run index layout lives in
//! [`IndexSpecification`](crate::spec::IndexSpecification), not here.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default file name of the consolidated index inside the root directory.
pub const DEFAULT_INDEX_FILE_NAME: &str = "consolidated.vidx";

/// Configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// How long an append waits for the index lock (default: 10s)
    pub lock_timeout: Duration,
    /// Poll interval while waiting for the lock (default: 50ms)
    pub lock_poll_interval: Duration,
    /// File name of the consolidated index under the root path
    pub index_file_name: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(10_000),
            lock_poll_interval: Duration::from_millis(50),
            index_file_name: DEFAULT_INDEX_FILE_NAME.to_string(),
        }
    }
}

impl IndexConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let lock_timeout = std::env::var("VOLIDX_LOCK_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.lock_timeout);

        let lock_poll_interval = std::env::var("VOLIDX_LOCK_POLL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|ms: &u64| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.lock_poll_interval);

        let index_file_name = std::env::var("VOLIDX_INDEX_FILE")
            .ok()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(defaults.index_file_name);

        Self {
            lock_timeout,
            lock_poll_interval,
            index_file_name,
        }
    }

    /// Path of the consolidated index file under `root`.
    pub fn index_path(&self, root: &Path) -> PathBuf {
        root.join(&self.index_file_name)
    }
}
