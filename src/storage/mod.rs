//! Handler contract and persistence backends.
//!
//! The watcher reports everything it learns through [`Handler`]. Two
//! backends ship with the crate:
//!
//! ```text
//! files:                              sqlite:
//! {root}/                             {root}/
//! └── 20240301/                       ├── 20240301.db
//!     └── 1234567/                    └── 20240302.db
//!         ├── 1234567.json
//!         └── 1709251200123.jpg
//! ```
//!
//! The file tree is easy to inspect but creates one directory per thread per
//! day, which eats inodes on long-running deployments. The per-date
//! databases keep the same data in one file per day with transactional
//! inserts.

pub mod local;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, NaiveDate};

use crate::error::Result;
#[cfg(not(feature = "sqlite"))]
use crate::error::AppError;
use crate::models::{BackendKind, Post, ThreadId};

// Re-export for convenience
pub use local::FileHandler;
#[cfg(feature = "sqlite")]
pub use sqlite::{RotatingStore, SqliteHandler, SqliteStore};

/// Sink for watcher events.
///
/// Calls for one thread arrive in post order. Implementations must tolerate
/// the same post being delivered again after a process restart.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Persist a newly observed post.
    ///
    /// The watcher only considers the post seen once this returns `Ok`.
    async fn post(&self, thread_id: ThreadId, post: &Post) -> Result<()>;

    /// Record that a thread was pruned. Must be idempotent.
    async fn pruned(&self, thread_id: ThreadId) -> Result<()>;

    /// Decide whether an image should be fetched. Must be cheap.
    fn download_img(&self, thread_id: ThreadId, filename: &str) -> bool;

    /// Persist image bytes for a post that was already delivered.
    async fn img(&self, thread_id: ThreadId, filename: &str, data: &[u8]) -> Result<()>;

    /// Make buffered writes durable. Called when the watcher stops.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn post(&self, thread_id: ThreadId, post: &Post) -> Result<()> {
        (**self).post(thread_id, post).await
    }

    async fn pruned(&self, thread_id: ThreadId) -> Result<()> {
        (**self).pruned(thread_id).await
    }

    fn download_img(&self, thread_id: ThreadId, filename: &str) -> bool {
        (**self).download_img(thread_id, filename)
    }

    async fn img(&self, thread_id: ThreadId, filename: &str, data: &[u8]) -> Result<()> {
        (**self).img(thread_id, filename, data).await
    }

    async fn flush(&self) -> Result<()> {
        (**self).flush().await
    }
}

/// Source of the current calendar date, swappable in tests.
pub type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// Clock reading the local date.
pub fn local_clock() -> Clock {
    Arc::new(|| Local::now().date_naive())
}

/// Directory / database name for a date, `YYYYMMDD`.
pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Built-in backends, selected by [`BackendKind`].
pub enum Backend {
    Files(FileHandler),
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteHandler),
}

impl Backend {
    /// Open the configured backend rooted at `root`.
    pub async fn open(kind: BackendKind, root: &Path) -> Result<Self> {
        match kind {
            BackendKind::Files => Ok(Self::Files(FileHandler::new(root).await?)),
            #[cfg(feature = "sqlite")]
            BackendKind::Sqlite => Ok(Self::Sqlite(SqliteHandler::new(root).await?)),
            #[cfg(not(feature = "sqlite"))]
            BackendKind::Sqlite => Err(AppError::config(
                "sqlite backend requested but the `sqlite` feature is disabled",
            )),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Files(_) => BackendKind::Files,
            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => BackendKind::Sqlite,
        }
    }

    fn handler(&self) -> &dyn Handler {
        match self {
            Self::Files(h) => h,
            #[cfg(feature = "sqlite")]
            Self::Sqlite(h) => h,
        }
    }
}

#[async_trait]
impl Handler for Backend {
    async fn post(&self, thread_id: ThreadId, post: &Post) -> Result<()> {
        self.handler().post(thread_id, post).await
    }

    async fn pruned(&self, thread_id: ThreadId) -> Result<()> {
        self.handler().pruned(thread_id).await
    }

    fn download_img(&self, thread_id: ThreadId, filename: &str) -> bool {
        self.handler().download_img(thread_id, filename)
    }

    async fn img(&self, thread_id: ThreadId, filename: &str, data: &[u8]) -> Result<()> {
        self.handler().img(thread_id, filename, data).await
    }

    async fn flush(&self) -> Result<()> {
        self.handler().flush().await
    }
}
