// src/pipeline/watch.rs

//! Board polling loop.
//!
//! One [`Watcher`] per board. Each cycle fetches the catalog, prunes threads
//! that dropped off it, fetches every listed thread on a bounded pool and
//! feeds the results back into this task, which alone owns the watch state
//! and talks to the handler. Fetches run in parallel; diffs and handler
//! calls never do.
//!
//! Thread fetches are conditional on the last delivered `Last-Modified`, so
//! quiet threads cost a 304 instead of a full document.

use std::collections::HashSet;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;

use crate::client::{BoardClient, ThreadSnapshot};
use crate::error::{FetchError, Result};
use crate::models::{ThreadId, WatcherConfig};
use crate::pipeline::diff::{DiffEngine, ImageJob};
use crate::pipeline::retry::{RetryPolicy, with_retry};
use crate::pipeline::state::WatchStore;
use crate::storage::Handler;

/// Where the watcher is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    Idle,
    FetchingCatalog,
    FetchingThreads,
    Sleeping,
}

/// Summary of one polling cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Catalog could not be fetched; nothing else happened
    pub catalog_failed: bool,
    pub threads_listed: usize,
    pub threads_fetched: usize,
    /// Fetched threads the board answered 304 for
    pub threads_unchanged: usize,
    /// Threads whose fetch gave up after retries
    pub threads_skipped: usize,
    pub new_posts: usize,
    pub pruned: usize,
    pub images_stored: usize,
    pub images_failed: usize,
    pub handler_failures: usize,
    /// Shutdown was requested mid-cycle
    pub interrupted: bool,
}

/// Polls one board and reports changes to a handler.
pub struct Watcher<C, H> {
    board: String,
    client: C,
    handler: H,
    engine: DiffEngine,
    store: WatchStore,
    catalog_retry: RetryPolicy,
    fetch_retry: RetryPolicy,
    concurrency: usize,
    interval: Duration,
    phase: WatchPhase,
}

impl<C: BoardClient, H: Handler> Watcher<C, H> {
    pub fn new(config: &WatcherConfig, client: C, handler: H) -> Self {
        Self {
            board: config.board.clone(),
            client,
            handler,
            engine: DiffEngine::new(config.prune_after_misses, config.images),
            store: WatchStore::new(),
            catalog_retry: RetryPolicy::catalog(config),
            fetch_retry: RetryPolicy::fetch(config),
            concurrency: config.concurrency.max(1),
            interval: config.interval(),
            phase: WatchPhase::Idle,
        }
    }

    pub fn phase(&self) -> WatchPhase {
        self.phase
    }

    pub fn store(&self) -> &WatchStore {
        &self.store
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    fn set_phase(&mut self, phase: WatchPhase) {
        log::debug!("/{}/: {:?} -> {:?}", self.board, self.phase, phase);
        self.phase = phase;
    }

    /// Poll until `shutdown` turns true or the board is rejected.
    ///
    /// Only a fatal catalog error ends the loop with an error; every other
    /// failure is logged and retried next cycle. The handler is flushed on
    /// the way out either way.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        log::info!(
            "Watching /{}/ every {}s ({} concurrent fetches)",
            self.board,
            self.interval.as_secs(),
            self.concurrency
        );

        let outcome = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            match self.cycle(Some(&shutdown)).await {
                Ok(report) => log_report(&self.board, &report),
                Err(e) => {
                    log::error!("Stopping watch of /{}/: {}", self.board, e);
                    break Err(e);
                }
            }

            self.set_phase(WatchPhase::Sleeping);
            let stop = tokio::select! {
                _ = tokio::time::sleep(self.interval) => false,
                changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            };
            self.set_phase(WatchPhase::Idle);
            if stop {
                break Ok(());
            }
        };

        self.set_phase(WatchPhase::Idle);
        if let Err(e) = self.handler.flush().await {
            log::error!("Failed to flush handler: {}", e);
            outcome?;
            return Err(e);
        }
        log::info!("Stopped watching /{}/", self.board);
        outcome
    }

    /// Run a single polling cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let report = self.cycle(None).await;
        self.set_phase(WatchPhase::Idle);
        report
    }

    async fn cycle(&mut self, shutdown: Option<&watch::Receiver<bool>>) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        self.set_phase(WatchPhase::FetchingCatalog);
        let catalog = match self.fetch_catalog().await {
            Ok(catalog) => catalog,
            Err(e @ FetchError::Fatal { .. }) => return Err(e.into()),
            Err(e) => {
                log::warn!("Cycle for /{}/ skipped: {}", self.board, e);
                report.catalog_failed = true;
                return Ok(report);
            }
        };
        report.threads_listed = catalog.len();

        for thread_id in self.engine.observe_catalog(&mut self.store, &catalog) {
            match self
                .engine
                .prune(&mut self.store, thread_id, &self.handler)
                .await
            {
                Ok(true) => report.pruned += 1,
                Ok(false) => {}
                Err(e) => {
                    report.handler_failures += 1;
                    log::error!("Failed to record prune of thread {}: {}", thread_id, e);
                }
            }
        }

        self.set_phase(WatchPhase::FetchingThreads);
        let images = self.sync_threads(&catalog, shutdown, &mut report).await;
        if !report.interrupted && !images.is_empty() {
            self.download_images(images, shutdown, &mut report).await;
        }

        Ok(report)
    }

    /// Catalog thread ids, deduplicated in listing order.
    async fn fetch_catalog(&self) -> std::result::Result<Vec<ThreadId>, FetchError> {
        let context = format!("catalog /{}/", self.board);
        let ids = with_retry(&self.catalog_retry, &context, || {
            self.client.fetch_catalog(&self.board)
        })
        .await?;

        let mut seen = HashSet::new();
        Ok(ids.into_iter().filter(|id| seen.insert(*id)).collect())
    }

    /// Fetch and diff every listed thread. Returns the images to download.
    async fn sync_threads(
        &mut self,
        catalog: &[ThreadId],
        shutdown: Option<&watch::Receiver<bool>>,
        report: &mut CycleReport,
    ) -> Vec<ImageJob> {
        let targets: Vec<(ThreadId, Option<String>)> = catalog
            .iter()
            .copied()
            .filter(|&thread_id| !self.store.is_retired(thread_id))
            .map(|thread_id| {
                let since = self
                    .store
                    .get(thread_id)
                    .and_then(|state| state.last_modified.clone());
                (thread_id, since)
            })
            .collect();

        let client = &self.client;
        let board = self.board.as_str();
        let policy = self.fetch_retry;

        let mut fetches = stream::iter(targets)
            .map(move |(thread_id, since)| async move {
                let context = format!("thread /{board}/{thread_id}");
                let result = with_retry(&policy, &context, || {
                    client.fetch_thread(board, thread_id, since.as_deref())
                })
                .await;
                (thread_id, result)
            })
            .buffer_unordered(self.concurrency);

        let mut images = Vec::new();
        while let Some((thread_id, result)) = fetches.next().await {
            match result {
                Ok(ThreadSnapshot::NotModified) => {
                    report.threads_fetched += 1;
                    report.threads_unchanged += 1;
                }
                Ok(ThreadSnapshot::Modified {
                    posts,
                    last_modified,
                }) => {
                    report.threads_fetched += 1;
                    let mut diff = self.engine.diff(&self.store, thread_id, posts, &self.handler);
                    diff.last_modified = last_modified;
                    if !diff.has_changes() {
                        log::debug!("Thread {} changed without new posts", thread_id);
                    }
                    let committed = self
                        .engine
                        .commit(&mut self.store, diff, &self.handler)
                        .await;
                    report.new_posts += committed.posted;
                    images.extend(committed.images);
                    if let Some(e) = committed.failure {
                        report.handler_failures += 1;
                        log::error!("Failed to persist thread {}: {}", thread_id, e);
                    }
                }
                Err(FetchError::ThreadGone(_)) => {
                    log::info!("Thread {} is gone", thread_id);
                    match self
                        .engine
                        .retire(&mut self.store, thread_id, &self.handler)
                        .await
                    {
                        Ok(true) => report.pruned += 1,
                        Ok(false) => {}
                        Err(e) => {
                            report.handler_failures += 1;
                            log::error!("Failed to record prune of thread {}: {}", thread_id, e);
                        }
                    }
                }
                Err(e) => {
                    report.threads_skipped += 1;
                    log::warn!("Skipping thread {} this cycle: {}", thread_id, e);
                }
            }

            if is_stopping(shutdown) {
                report.interrupted = true;
                log::info!("Shutdown requested, abandoning remaining thread fetches");
                break;
            }
        }
        images
    }

    async fn download_images(
        &mut self,
        jobs: Vec<ImageJob>,
        shutdown: Option<&watch::Receiver<bool>>,
        report: &mut CycleReport,
    ) {
        let client = &self.client;
        let board = self.board.as_str();
        let policy = self.fetch_retry;

        let mut downloads = stream::iter(jobs)
            .map(move |job| async move {
                let context = format!("image /{board}/{}", job.image.filename);
                let result =
                    with_retry(&policy, &context, || client.fetch_image(board, &job.image)).await;
                (job, result)
            })
            .buffer_unordered(self.concurrency);

        while let Some((job, result)) = downloads.next().await {
            match result {
                Ok(data) => {
                    match self
                        .handler
                        .img(job.thread_id, &job.image.filename, &data)
                        .await
                    {
                        Ok(()) => report.images_stored += 1,
                        Err(e) => {
                            report.handler_failures += 1;
                            log::error!(
                                "Failed to store image {} of thread {}: {}",
                                job.image.filename,
                                job.thread_id,
                                e
                            );
                        }
                    }
                }
                Err(e) => {
                    report.images_failed += 1;
                    log::warn!("Giving up on image {}: {}", job.image.filename, e);
                }
            }

            if is_stopping(shutdown) {
                report.interrupted = true;
                break;
            }
        }
    }
}

fn is_stopping(shutdown: Option<&watch::Receiver<bool>>) -> bool {
    shutdown.is_some_and(|rx| *rx.borrow())
}

fn log_report(board: &str, report: &CycleReport) {
    if report.catalog_failed {
        return;
    }
    log::info!(
        "/{}/: {} threads listed, {} fetched ({} unchanged), {} skipped, {} new posts, {} pruned, {} images",
        board,
        report.threads_listed,
        report.threads_fetched,
        report.threads_unchanged,
        report.threads_skipped,
        report.new_posts,
        report.pruned,
        report.images_stored
    );
    if report.handler_failures > 0 {
        log::warn!(
            "/{}/: {} handler failures this cycle, affected threads retry next cycle",
            board,
            report.handler_failures
        );
    }
}
