//! Per-date SQLite backend.
//!
//! One database per calendar day, `{root}/YYYYMMDD.db`. The database for a
//! day is opened on the first write of that day and kept open until the date
//! changes or the handler is flushed. Every insert ignores rows whose key
//! already exists, so replaying posts after a restart or a migration rerun
//! is harmless.
//!
//! `rusqlite` is blocking; the handler runs every database call on the
//! blocking pool and never holds the lock across an `.await`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{AppError, Result};
use crate::models::{Post, ThreadId};
use crate::storage::{Clock, Handler, date_key, local_clock};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS posts (
        no        INTEGER PRIMARY KEY,
        thread    INTEGER NOT NULL,
        resto     INTEGER NOT NULL,
        time      INTEGER NOT NULL,
        now       TEXT,
        name      TEXT,
        sub       TEXT,
        com       TEXT,
        tim       INTEGER,
        ext       TEXT,
        filename  TEXT,
        md5       TEXT,
        fsize     INTEGER,
        raw       TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS posts_thread ON posts (thread);
    CREATE TABLE IF NOT EXISTS pruned_threads (
        thread    INTEGER PRIMARY KEY,
        pruned_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS images (
        filename  TEXT PRIMARY KEY,
        thread    INTEGER NOT NULL,
        data      BLOB NOT NULL
    );
";

const INSERT_POST: &str = "
    INSERT OR IGNORE INTO posts
        (no, thread, resto, time, now, name, sub, com, tim, ext, filename, md5, fsize, raw)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
";

/// A single day's database.
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteStore {
    /// Open or create a database file and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        Self::bootstrap(conn, path)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn bootstrap(conn: Connection, path: PathBuf) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert a thread's posts in one transaction.
    ///
    /// Returns how many rows were new.
    pub fn persist(&mut self, thread_id: ThreadId, posts: &[Post]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(INSERT_POST)?;
            for post in posts {
                let raw = serde_json::to_string(post)?;
                inserted += stmt.execute(params![
                    post.no as i64,
                    thread_id as i64,
                    post.resto as i64,
                    post.time,
                    post.now,
                    post.name,
                    post.sub,
                    post.com,
                    post.tim.map(|t| t as i64),
                    post.ext,
                    post.filename,
                    post.md5,
                    post.fsize.map(|s| s as i64),
                    raw,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Record a thread closure; repeated calls keep the first timestamp.
    pub fn mark_pruned(&mut self, thread_id: ThreadId, pruned_at: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO pruned_threads (thread, pruned_at) VALUES (?1, ?2)",
            params![thread_id as i64, pruned_at],
        )?;
        Ok(())
    }

    pub fn store_image(&mut self, thread_id: ThreadId, filename: &str, data: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO images (filename, thread, data) VALUES (?1, ?2, ?3)",
            params![filename, thread_id as i64, data],
        )?;
        Ok(())
    }

    pub fn post_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM posts", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Post numbers of a thread in ascending order.
    pub fn thread_post_ids(&self, thread_id: ThreadId) -> Result<Vec<u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT no FROM posts WHERE thread = ?1 ORDER BY no ASC")?;
        let rows = stmt.query_map(params![thread_id as i64], |row| row.get::<_, i64>(0))?;
        rows.map(|r| r.map(|no| no as u64).map_err(AppError::from))
            .collect()
    }

    pub fn is_pruned(&self, thread_id: ThreadId) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM pruned_threads WHERE thread = ?1",
                params![thread_id as i64],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn image(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        let data = self
            .conn
            .query_row(
                "SELECT data FROM images WHERE filename = ?1",
                params![filename],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    /// Close the connection, surfacing any error the drop would swallow.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| AppError::from(e))
    }
}

/// Keeps the current day's database open and rotates at midnight.
pub struct RotatingStore {
    root_dir: PathBuf,
    clock: Clock,
    current: Option<(String, SqliteStore)>,
}

impl RotatingStore {
    pub fn new(root_dir: impl Into<PathBuf>, clock: Clock) -> Self {
        Self {
            root_dir: root_dir.into(),
            clock,
            current: None,
        }
    }

    pub fn db_path(&self, date: &str) -> PathBuf {
        self.root_dir.join(format!("{date}.db"))
    }

    /// Today's database, opening it (and closing yesterday's) as needed.
    pub fn today(&mut self) -> Result<&mut SqliteStore> {
        let date = date_key((self.clock)());
        let stale = matches!(&self.current, Some((open, _)) if *open != date);
        if stale {
            self.close()?;
        }
        if self.current.is_none() {
            let path = self.db_path(&date);
            log::info!("Opening database {}", path.display());
            self.current = Some((date, SqliteStore::open(path)?));
        }
        match self.current.as_mut() {
            Some((_, store)) => Ok(store),
            None => Err(AppError::persistence("sqlite", "no open database")),
        }
    }

    /// Close the open database, if any.
    pub fn close(&mut self) -> Result<()> {
        if let Some((date, store)) = self.current.take() {
            log::info!("Closing database for {}", date);
            store.close()?;
        }
        Ok(())
    }
}

/// Handler inserting posts into per-date databases.
pub struct SqliteHandler {
    store: Arc<Mutex<RotatingStore>>,
    /// Images stored by this process, so they are not fetched twice.
    stored_images: Mutex<HashSet<String>>,
}

impl SqliteHandler {
    /// Create a handler writing under `root_dir`, creating it if needed.
    pub async fn new(root_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_clock(root_dir, local_clock()).await
    }

    pub async fn with_clock(root_dir: impl Into<PathBuf>, clock: Clock) -> Result<Self> {
        let root_dir = root_dir.into();
        tokio::fs::create_dir_all(&root_dir).await?;
        Ok(Self {
            store: Arc::new(Mutex::new(RotatingStore::new(root_dir, clock))),
            stored_images: Mutex::new(HashSet::new()),
        })
    }

    /// Run `f` against the store on the blocking pool.
    async fn with_store<T, F>(&self, context: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut RotatingStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking({
            let store = Arc::clone(&self.store);
            move || {
                let mut store = store
                    .lock()
                    .map_err(|_| AppError::persistence(context, "database lock poisoned"))?;
                f(&mut store)
            }
        })
        .await
        .map_err(|e| AppError::persistence(context, e))?
    }
}

#[async_trait]
impl Handler for SqliteHandler {
    async fn post(&self, thread_id: ThreadId, post: &Post) -> Result<()> {
        let post = post.clone();
        self.with_store("post", move |store| {
            store.today()?.persist(thread_id, std::slice::from_ref(&post))
        })
        .await?;
        Ok(())
    }

    async fn pruned(&self, thread_id: ThreadId) -> Result<()> {
        let now = Utc::now().timestamp();
        self.with_store("pruned", move |store| {
            store.today()?.mark_pruned(thread_id, now)
        })
        .await?;
        log::info!("Thread {} pruned", thread_id);
        Ok(())
    }

    fn download_img(&self, _thread_id: ThreadId, filename: &str) -> bool {
        !self
            .stored_images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(filename)
    }

    async fn img(&self, thread_id: ThreadId, filename: &str, data: &[u8]) -> Result<()> {
        let name = filename.to_string();
        let data = data.to_vec();
        self.with_store("img", move |store| {
            store.today()?.store_image(thread_id, &name, &data)
        })
        .await?;
        self.stored_images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(filename.to_string());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.with_store("flush", |store| store.close()).await
    }
}
