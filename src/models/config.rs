//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Polling and diffing behavior
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Persistence backend selection
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.watcher.board.trim().is_empty() {
            return Err(AppError::validation("watcher.board is empty"));
        }
        if self.watcher.board.contains('/') {
            return Err(AppError::validation(
                "watcher.board must be a bare board code, e.g. \"g\"",
            ));
        }
        if self.watcher.interval_secs == 0 {
            return Err(AppError::validation("watcher.interval_secs must be > 0"));
        }
        if self.watcher.concurrency == 0 {
            return Err(AppError::validation("watcher.concurrency must be > 0"));
        }
        if self.watcher.catalog_attempts == 0 || self.watcher.thread_attempts == 0 {
            return Err(AppError::validation(
                "watcher retry attempts must be at least 1",
            ));
        }
        if self.watcher.prune_after_misses == 0 {
            return Err(AppError::validation(
                "watcher.prune_after_misses must be > 0",
            ));
        }
        if self.http.user_agent.trim().is_empty() {
            return Err(AppError::validation("http.user_agent is empty"));
        }
        if self.http.timeout_secs == 0 {
            return Err(AppError::validation("http.timeout_secs must be > 0"));
        }
        url::Url::parse(&self.http.api_base)?;
        url::Url::parse(&self.http.image_base)?;
        Ok(())
    }
}

/// Polling loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Board code, e.g. "g"
    #[serde(default)]
    pub board: String,

    /// Seconds to sleep between polling cycles
    #[serde(default = "defaults::interval")]
    pub interval_secs: u64,

    /// Maximum concurrent thread and image fetches
    #[serde(default = "defaults::concurrency")]
    pub concurrency: usize,

    /// Attempts per catalog fetch before the cycle is skipped
    #[serde(default = "defaults::catalog_attempts")]
    pub catalog_attempts: u32,

    /// Attempts per thread or image fetch before it is skipped for the cycle
    #[serde(default = "defaults::thread_attempts")]
    pub thread_attempts: u32,

    /// First retry delay in milliseconds, doubled after each failure
    #[serde(default = "defaults::retry_delay")]
    pub retry_delay_ms: u64,

    /// Upper bound for the retry delay in milliseconds
    #[serde(default = "defaults::max_retry_delay")]
    pub max_retry_delay_ms: u64,

    /// Consecutive catalog absences after which a thread counts as pruned
    #[serde(default = "defaults::prune_after_misses")]
    pub prune_after_misses: u32,

    /// Whether to download attached images
    #[serde(default)]
    pub images: bool,
}

impl WatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            board: String::new(),
            interval_secs: defaults::interval(),
            concurrency: defaults::concurrency(),
            catalog_attempts: defaults::catalog_attempts(),
            thread_attempts: defaults::thread_attempts(),
            retry_delay_ms: defaults::retry_delay(),
            max_retry_delay_ms: defaults::max_retry_delay(),
            prune_after_misses: defaults::prune_after_misses(),
            images: false,
        }
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Base URL of the JSON API
    #[serde(default = "defaults::api_base")]
    pub api_base: String,

    /// Base URL of the media host
    #[serde(default = "defaults::image_base")]
    pub image_base: String,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            api_base: defaults::api_base(),
            image_base: defaults::image_base(),
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
        }
    }
}

/// Available persistence backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// `root/YYYYMMDD/thread/thread.json` documents
    #[default]
    Files,
    /// `root/YYYYMMDD.db` databases
    Sqlite,
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Output root directory
    #[serde(default = "defaults::root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            root: defaults::root(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    // Watcher defaults
    pub fn interval() -> u64 {
        60
    }
    pub fn concurrency() -> usize {
        4
    }
    pub fn catalog_attempts() -> u32 {
        3
    }
    pub fn thread_attempts() -> u32 {
        2
    }
    pub fn retry_delay() -> u64 {
        2_000
    }
    pub fn max_retry_delay() -> u64 {
        30_000
    }
    pub fn prune_after_misses() -> u32 {
        2
    }

    // HTTP defaults
    pub fn api_base() -> String {
        "https://a.4cdn.org".into()
    }
    pub fn image_base() -> String {
        "https://i.4cdn.org".into()
    }
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; chanwatch/0.1)".into()
    }
    pub fn timeout() -> u64 {
        30
    }

    // Storage defaults
    pub fn root() -> PathBuf {
        PathBuf::from("data")
    }
}
