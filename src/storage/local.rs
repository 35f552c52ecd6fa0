//! File-tree backend.
//!
//! ## Storage Layout
//!
//! ```text
//! {root}/
//! └── YYYYMMDD/              # date the thread was first written
//!     └── {thread}/
//!         ├── {thread}.json  # { "posts": [...] }
//!         └── {tim}{ext}     # downloaded images
//! ```
//!
//! Every `post` call reads the thread document, appends the post and
//! rewrites the file in place. There is no transactional guarantee: a crash
//! or a full disk during the write leaves a truncated document, and the next
//! `post` for that thread fails with a JSON error until the file is repaired
//! by hand. Use the SQLite backend where that matters.
//!
//! ## Recycled thread ids
//!
//! `pruned` only unpins the thread; its document stays where it is. If the
//! board hands the same id to a new thread on the same date, the new posts
//! land in the old `{thread}.json` after the old ones. Post numbers are
//! board-wide, so nothing is overwritten or deduplicated away, but the
//! document then holds two threads. A recycled id on a later date gets a
//! fresh document under that date.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{AppError, Result};
use crate::models::{Post, ThreadDocument, ThreadId};
use crate::storage::{Clock, Handler, date_key, local_clock};

/// Handler writing one JSON document per thread per day.
pub struct FileHandler {
    root_dir: PathBuf,
    clock: Clock,
    /// Date directory each active thread writes to.
    pinned: Mutex<HashMap<ThreadId, String>>,
    /// Serializes read-modify-write cycles.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileHandler {
    /// Create a handler rooted at the given directory, creating it if needed.
    pub async fn new(root_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_clock(root_dir, local_clock()).await
    }

    /// Create a handler with a custom date source.
    pub async fn with_clock(root_dir: impl Into<PathBuf>, clock: Clock) -> Result<Self> {
        let root_dir = root_dir.into();
        tokio::fs::create_dir_all(&root_dir).await?;
        Ok(Self {
            root_dir,
            clock,
            pinned: Mutex::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// Directory of a thread, pinning it to today's date on first use.
    fn pin_thread(&self, thread_id: ThreadId) -> PathBuf {
        let mut pinned = self.pinned.lock().unwrap_or_else(|e| e.into_inner());
        let date = pinned
            .entry(thread_id)
            .or_insert_with(|| date_key((self.clock)()))
            .clone();
        self.root_dir.join(date).join(thread_id.to_string())
    }

    /// Directory of a thread without pinning it.
    pub fn thread_dir(&self, thread_id: ThreadId) -> PathBuf {
        let pinned = self.pinned.lock().unwrap_or_else(|e| e.into_inner());
        let date = pinned
            .get(&thread_id)
            .cloned()
            .unwrap_or_else(|| date_key((self.clock)()));
        self.root_dir.join(date).join(thread_id.to_string())
    }

    /// Path of a thread's JSON document.
    pub fn document_path(&self, thread_id: ThreadId) -> PathBuf {
        self.thread_dir(thread_id)
            .join(format!("{thread_id}.json"))
    }

    /// Read a thread's document, if it has been written.
    pub async fn load_thread(&self, thread_id: ThreadId) -> Result<Option<ThreadDocument>> {
        read_json(&self.document_path(thread_id)).await
    }
}

#[async_trait]
impl Handler for FileHandler {
    async fn post(&self, thread_id: ThreadId, post: &Post) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let dir = self.pin_thread(thread_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{thread_id}.json"));

        let mut document: ThreadDocument = read_json(&path).await?.unwrap_or_default();
        if document.posts.iter().any(|p| p.no == post.no) {
            log::debug!("Post {} already in {}", post.no, path.display());
            return Ok(());
        }
        document.posts.push(post.clone());

        write_json(&path, &document).await?;
        log::debug!(
            "Thread {}: {} posts written to {}",
            thread_id,
            document.posts.len(),
            path.display()
        );
        Ok(())
    }

    async fn pruned(&self, thread_id: ThreadId) -> Result<()> {
        let released = self
            .pinned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&thread_id);
        if released.is_some() {
            log::info!("Thread {} pruned, document closed", thread_id);
        }
        Ok(())
    }

    fn download_img(&self, thread_id: ThreadId, filename: &str) -> bool {
        !self.thread_dir(thread_id).join(filename).exists()
    }

    async fn img(&self, thread_id: ThreadId, filename: &str, data: &[u8]) -> Result<()> {
        check_filename(filename)?;
        let _guard = self.write_lock.lock().await;

        let dir = self.pin_thread(thread_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(filename);
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| AppError::persistence(path.display().to_string(), e))?;
        log::debug!("Image {} ({} bytes) written", path.display(), data.len());
        Ok(())
    }
}

/// Reject names that would escape the thread directory.
fn check_filename(filename: &str) -> Result<()> {
    if filename.is_empty()
        || filename.contains('/')
        || filename.contains('\\')
        || filename.starts_with('.')
    {
        return Err(AppError::persistence(
            "image filename",
            format!("refusing to write {filename:?}"),
        ));
    }
    Ok(())
}

/// Read JSON data, returning None if the file doesn't exist.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| AppError::persistence(path.display().to_string(), e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AppError::Io(e)),
    }
}

/// Write JSON data in place.
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| AppError::persistence(path.display().to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn fixed_clock(y: i32, m: u32, d: u32) -> Clock {
        let date = NaiveDate::from_ymd_opt(y, m, d).unwrap();
        Arc::new(move || date)
    }

    async fn handler(tmp: &TempDir) -> FileHandler {
        FileHandler::with_clock(tmp.path(), fixed_clock(2024, 3, 1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sequential_posts_share_one_document() {
        let tmp = TempDir::new().unwrap();
        let files = handler(&tmp).await;

        files.post(111, &Post::new(1, "first")).await.unwrap();
        files.post(111, &Post::new(2, "second")).await.unwrap();

        let path = tmp.path().join("20240301/111/111.json");
        assert_eq!(files.document_path(111), path);

        let raw = std::fs::read(&path).unwrap();
        let document: ThreadDocument = serde_json::from_slice(&raw).unwrap();
        let ids: Vec<_> = document.posts.iter().map(|p| p.no).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(document.posts[1].com.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_replayed_post_is_not_duplicated() {
        let tmp = TempDir::new().unwrap();
        let files = handler(&tmp).await;

        files.post(5, &Post::new(10, "op")).await.unwrap();
        files.post(5, &Post::new(10, "op")).await.unwrap();

        let document = files.load_thread(5).await.unwrap().unwrap();
        assert_eq!(document.posts.len(), 1);
    }

    #[tokio::test]
    async fn test_document_survives_handler_restart() {
        let tmp = TempDir::new().unwrap();
        {
            let files = handler(&tmp).await;
            files.post(7, &Post::new(1, "a")).await.unwrap();
        }
        let files = handler(&tmp).await;
        files.post(7, &Post::new(1, "a")).await.unwrap();
        files.post(7, &Post::new(2, "b")).await.unwrap();

        let document = files.load_thread(7).await.unwrap().unwrap();
        assert_eq!(document.posts.len(), 2);
    }

    #[tokio::test]
    async fn test_thread_stays_in_first_date_directory() {
        let tmp = TempDir::new().unwrap();
        let day = Arc::new(Mutex::new(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()));
        let clock_day = Arc::clone(&day);
        let clock: Clock = Arc::new(move || *clock_day.lock().unwrap());
        let files = FileHandler::with_clock(tmp.path(), clock).await.unwrap();

        files.post(9, &Post::new(1, "before midnight")).await.unwrap();
        *day.lock().unwrap() = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        files.post(9, &Post::new(2, "after midnight")).await.unwrap();
        files.post(10, &Post::new(3, "new thread")).await.unwrap();

        let document = files.load_thread(9).await.unwrap().unwrap();
        assert_eq!(document.posts.len(), 2);
        assert!(tmp.path().join("20240301/9/9.json").exists());
        assert!(tmp.path().join("20240302/10/10.json").exists());

        // After pruning, the id starts over under the current date.
        files.pruned(9).await.unwrap();
        files.pruned(9).await.unwrap();
        assert_eq!(files.document_path(9), tmp.path().join("20240302/9/9.json"));
    }

    #[tokio::test]
    async fn test_recycled_id_same_day_appends_to_old_document() {
        let tmp = TempDir::new().unwrap();
        let files = handler(&tmp).await;

        files.post(12, &Post::new(100, "old op")).await.unwrap();
        files.pruned(12).await.unwrap();
        files.post(12, &Post::new(250, "new op")).await.unwrap();

        let document = files.load_thread(12).await.unwrap().unwrap();
        let ids: Vec<_> = document.posts.iter().map(|p| p.no).collect();
        assert_eq!(ids, vec![100, 250]);
        assert_eq!(files.document_path(12), tmp.path().join("20240301/12/12.json"));
    }

    #[tokio::test]
    async fn test_images_written_next_to_document() {
        let tmp = TempDir::new().unwrap();
        let files = handler(&tmp).await;

        assert!(files.download_img(3, "123.png"));
        files.post(3, &Post::new(1, "pic").with_image(123, ".png", None)).await.unwrap();
        files.img(3, "123.png", b"png bytes").await.unwrap();

        assert_eq!(
            std::fs::read(tmp.path().join("20240301/3/123.png")).unwrap(),
            b"png bytes"
        );
        assert!(!files.download_img(3, "123.png"));
    }

    #[tokio::test]
    async fn test_img_rejects_path_traversal() {
        let tmp = TempDir::new().unwrap();
        let files = handler(&tmp).await;
        assert!(files.img(3, "../escape.png", b"x").await.is_err());
        assert!(files.img(3, "", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_document_is_a_persistence_error() {
        let tmp = TempDir::new().unwrap();
        let files = handler(&tmp).await;
        files.post(4, &Post::new(1, "ok")).await.unwrap();

        std::fs::write(files.document_path(4), b"{\"posts\": [").unwrap();
        let err = files.post(4, &Post::new(2, "lost")).await.unwrap_err();
        assert!(matches!(err, AppError::Persistence { .. }));
    }
}
