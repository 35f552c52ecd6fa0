//! In-memory watch state.
//!
//! Nothing here is persisted; after a restart every live thread is observed
//! as new and its posts are delivered again.
//!
//! Threads that answered 404 are retired rather than just forgotten: a
//! catalog that lags behind the thread endpoint keeps listing them for a
//! while, and they must not be picked up again until a catalog has dropped
//! them at least once.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::models::{PostId, ThreadId};

/// What the watcher knows about one thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchState {
    pub thread_id: ThreadId,
    /// Number of posts in the latest snapshot
    pub last_post_count: usize,
    /// Posts already delivered to the handler; only grows
    pub last_post_ids: BTreeSet<PostId>,
    /// Consecutive catalogs the thread was missing from
    pub missed_catalogs: u32,
    /// `Last-Modified` of the newest fully delivered snapshot
    pub last_modified: Option<String>,
}

impl WatchState {
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            ..Self::default()
        }
    }

    pub fn has_seen(&self, post_id: PostId) -> bool {
        self.last_post_ids.contains(&post_id)
    }

    /// Highest post number delivered so far.
    pub fn last_post_id(&self) -> Option<PostId> {
        self.last_post_ids.last().copied()
    }

    pub(crate) fn mark_seen(&mut self, post_id: PostId) {
        self.last_post_ids.insert(post_id);
    }
}

/// Thread id to watch state, owned by a single watcher.
#[derive(Debug, Default)]
pub struct WatchStore {
    threads: HashMap<ThreadId, WatchState>,
    /// Gone threads the catalog may still list
    retired: HashSet<ThreadId>,
}

impl WatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, thread_id: ThreadId) -> Option<&WatchState> {
        self.threads.get(&thread_id)
    }

    pub fn get_mut(&mut self, thread_id: ThreadId) -> Option<&mut WatchState> {
        self.threads.get_mut(&thread_id)
    }

    pub fn upsert(&mut self, thread_id: ThreadId, state: WatchState) {
        self.threads.insert(thread_id, state);
    }

    pub fn remove(&mut self, thread_id: ThreadId) -> Option<WatchState> {
        self.threads.remove(&thread_id)
    }

    /// State of a thread, created empty on first sighting.
    pub(crate) fn entry(&mut self, thread_id: ThreadId) -> &mut WatchState {
        self.threads
            .entry(thread_id)
            .or_insert_with(|| WatchState::new(thread_id))
    }

    /// Known thread ids in ascending order.
    pub fn known_thread_ids(&self) -> Vec<ThreadId> {
        let mut ids: Vec<_> = self.threads.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Forget a gone thread and ignore it while the catalog still lists it.
    pub fn retire(&mut self, thread_id: ThreadId) -> Option<WatchState> {
        self.retired.insert(thread_id);
        self.threads.remove(&thread_id)
    }

    pub fn is_retired(&self, thread_id: ThreadId) -> bool {
        self.retired.contains(&thread_id)
    }

    /// Drop tombstones for ids the latest catalog no longer lists.
    pub(crate) fn release_retired(&mut self, listed: &HashSet<ThreadId>) {
        self.retired.retain(|thread_id| {
            let keep = listed.contains(thread_id);
            if !keep {
                log::debug!("Thread {} left the catalog, tombstone released", thread_id);
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}
