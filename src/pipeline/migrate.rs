// src/pipeline/migrate.rs

//! One-shot conversion of a file tree into per-date databases.
//!
//! Walks `{from}/YYYYMMDD/{thread}/{thread}.json` in date order and writes
//! each date into `{to}/YYYYMMDD.db`. Each thread is one transaction and
//! every insert ignores existing rows, so an interrupted run can simply be
//! started again.

use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::models::{ThreadDocument, ThreadId};
use crate::storage::local::read_json;
use crate::storage::sqlite::SqliteStore;

/// What a migration run did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub dates: usize,
    pub threads: usize,
    /// Rows that did not exist yet
    pub posts_inserted: usize,
    /// Thread directories without a readable document
    pub skipped: usize,
    pub images: usize,
}

/// Convert the file tree under `from` into databases under `to`.
pub async fn run_migrate(from: &Path, to: &Path) -> Result<MigrationReport> {
    if !from.is_dir() {
        return Err(AppError::config(format!(
            "{} is not a directory",
            from.display()
        )));
    }
    tokio::fs::create_dir_all(to).await?;

    let mut report = MigrationReport::default();
    for (date, date_dir) in date_dirs(from).await? {
        let db_path = to.join(format!("{date}.db"));
        log::info!("Migrating {} into {}", date_dir.display(), db_path.display());

        let mut store = SqliteStore::open(&db_path)?;
        let migrated = migrate_date(&mut store, &date_dir, &mut report).await;
        let closed = store.close();
        migrated?;
        closed?;
        report.dates += 1;
    }

    log::info!(
        "Migration done: {} dates, {} threads, {} posts inserted, {} images, {} skipped",
        report.dates,
        report.threads,
        report.posts_inserted,
        report.images,
        report.skipped
    );
    Ok(report)
}

async fn migrate_date(
    store: &mut SqliteStore,
    date_dir: &Path,
    report: &mut MigrationReport,
) -> Result<()> {
    for (thread_id, thread_dir) in thread_dirs(date_dir).await? {
        migrate_thread(store, thread_id, &thread_dir, report).await?;
    }
    Ok(())
}

async fn migrate_thread(
    store: &mut SqliteStore,
    thread_id: ThreadId,
    thread_dir: &Path,
    report: &mut MigrationReport,
) -> Result<()> {
    let document_name = format!("{thread_id}.json");
    let document: ThreadDocument = match read_json(&thread_dir.join(&document_name)).await {
        Ok(Some(document)) => document,
        Ok(None) => {
            log::warn!("No document in {}, skipping", thread_dir.display());
            report.skipped += 1;
            return Ok(());
        }
        Err(e) => {
            log::warn!("Skipping thread {}: {}", thread_id, e);
            report.skipped += 1;
            return Ok(());
        }
    };

    report.posts_inserted += store.persist(thread_id, &document.posts)?;
    report.threads += 1;

    let mut entries = tokio::fs::read_dir(thread_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        // Follows symlinks; a dangling one is an error.
        if name == document_name || !tokio::fs::metadata(entry.path()).await?.is_file() {
            continue;
        }
        let data = tokio::fs::read(entry.path()).await?;
        store.store_image(thread_id, &name, &data)?;
        report.images += 1;
    }
    Ok(())
}

/// `YYYYMMDD` subdirectories, oldest first.
async fn date_dirs(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_date_key(&name) && entry.file_type().await?.is_dir() {
            dirs.push((name, entry.path()));
        } else {
            log::debug!("Ignoring {}", entry.path().display());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Numeric thread subdirectories, ascending.
async fn thread_dirs(date_dir: &Path) -> Result<Vec<(ThreadId, PathBuf)>> {
    let mut dirs = Vec::new();
    let mut entries = tokio::fs::read_dir(date_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let parsed = entry.file_name().to_string_lossy().parse::<ThreadId>();
        match parsed {
            Ok(thread_id) if entry.path().is_dir() => dirs.push((thread_id, entry.path())),
            _ => log::debug!("Ignoring {}", entry.path().display()),
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn is_date_key(name: &str) -> bool {
    name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Post;
    use serde_json::json;
    use tempfile::TempDir;

    async fn write_thread(root: &Path, date: &str, thread_id: ThreadId, posts: &[Post]) -> PathBuf {
        let dir = root.join(date).join(thread_id.to_string());
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let document = ThreadDocument {
            posts: posts.to_vec(),
        };
        tokio::fs::write(
            dir.join(format!("{thread_id}.json")),
            serde_json::to_vec(&document).unwrap(),
        )
        .await
        .unwrap();
        dir
    }

    #[test]
    fn test_date_key_detection() {
        assert!(is_date_key("20240301"));
        assert!(!is_date_key("2024031"));
        assert!(!is_date_key("2024-03-01"));
        assert!(!is_date_key("notes.txt"));
    }

    #[tokio::test]
    async fn test_migrates_every_date_into_its_own_database() {
        let from = TempDir::new().unwrap();
        let to = TempDir::new().unwrap();

        let dir = write_thread(
            from.path(),
            "20240301",
            100,
            &[Post::new(100, "op"), Post::new(101, "reply")],
        )
        .await;
        tokio::fs::write(dir.join("1000.jpg"), b"jpeg").await.unwrap();
        write_thread(from.path(), "20240302", 200, &[Post::new(200, "op")]).await;
        tokio::fs::write(from.path().join("README"), b"x").await.unwrap();

        let report = run_migrate(from.path(), to.path()).await.unwrap();
        assert_eq!(report.dates, 2);
        assert_eq!(report.threads, 2);
        assert_eq!(report.posts_inserted, 3);
        assert_eq!(report.images, 1);
        assert_eq!(report.skipped, 0);

        let first = SqliteStore::open(to.path().join("20240301.db")).unwrap();
        assert_eq!(first.thread_post_ids(100).unwrap(), vec![100, 101]);
        assert_eq!(first.image("1000.jpg").unwrap(), Some(b"jpeg".to_vec()));

        let second = SqliteStore::open(to.path().join("20240302.db")).unwrap();
        assert_eq!(second.post_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rerun_inserts_nothing_new() {
        let from = TempDir::new().unwrap();
        let to = TempDir::new().unwrap();
        write_thread(from.path(), "20240301", 7, &[Post::new(7, "op")]).await;

        run_migrate(from.path(), to.path()).await.unwrap();
        let report = run_migrate(from.path(), to.path()).await.unwrap();
        assert_eq!(report.threads, 1);
        assert_eq!(report.posts_inserted, 0);
    }

    #[tokio::test]
    async fn test_corrupt_document_is_skipped() {
        let from = TempDir::new().unwrap();
        let to = TempDir::new().unwrap();

        let broken = from.path().join("20240301").join("8");
        tokio::fs::create_dir_all(&broken).await.unwrap();
        tokio::fs::write(broken.join("8.json"), b"{\"posts\": [")
            .await
            .unwrap();
        let dir = write_thread(from.path(), "20240301", 9, &[]).await;
        tokio::fs::write(
            dir.join("9.json"),
            serde_json::to_vec(&json!({ "posts": [{ "no": 9, "com": "ok", "country": "NL" }] }))
                .unwrap(),
        )
        .await
        .unwrap();

        let report = run_migrate(from.path(), to.path()).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.threads, 1);
        assert_eq!(report.posts_inserted, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_image_aborts_after_closing_database() {
        let from = TempDir::new().unwrap();
        let to = TempDir::new().unwrap();
        write_thread(from.path(), "20240301", 1, &[Post::new(1, "op")]).await;
        let broken = write_thread(from.path(), "20240301", 2, &[Post::new(2, "op")]).await;
        std::os::unix::fs::symlink(broken.join("missing.jpg"), broken.join("2000.jpg")).unwrap();

        let err = run_migrate(from.path(), to.path()).await.unwrap_err();
        assert!(matches!(err, AppError::Io(_)));

        // Committed threads survive, and a rerun picks up where it stopped.
        let store = SqliteStore::open(to.path().join("20240301.db")).unwrap();
        assert_eq!(store.thread_post_ids(1).unwrap(), vec![1]);
        store.close().unwrap();

        std::fs::remove_file(broken.join("2000.jpg")).unwrap();
        let report = run_migrate(from.path(), to.path()).await.unwrap();
        assert_eq!(report.dates, 1);
        assert_eq!(report.threads, 2);
        assert_eq!(report.posts_inserted, 0);
    }

    #[tokio::test]
    async fn test_missing_source_is_a_config_error() {
        let to = TempDir::new().unwrap();
        let err = run_migrate(&to.path().join("nope"), to.path())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
