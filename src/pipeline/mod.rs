//! Watcher pipeline.
//!
//! - `watch`: Poll a board and report new posts, pruned threads and images
//! - `migrate`: Convert a file tree into per-date databases

pub mod diff;
#[cfg(feature = "sqlite")]
pub mod migrate;
pub mod retry;
pub mod state;
pub mod watch;

pub use diff::{Committed, DiffEngine, ImageJob, ThreadDiff};
#[cfg(feature = "sqlite")]
pub use migrate::{MigrationReport, run_migrate};
pub use retry::{RetryPolicy, with_retry};
pub use state::{WatchState, WatchStore};
pub use watch::{CycleReport, WatchPhase, Watcher};
