//! Diff calculation between thread snapshots and the watch state.
//!
//! A post is new when its number is not in the thread's `last_post_ids`.
//! New posts are handed to the handler in ascending order and only marked
//! as seen once the handler accepted them, so a failed write is retried on
//! the next cycle instead of being lost.

use std::collections::HashSet;

use crate::error::{AppError, Result};
use crate::models::{ImageRef, Post, PostId, ThreadId};
use crate::pipeline::state::WatchStore;
use crate::storage::Handler;

/// An image the handler asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageJob {
    pub thread_id: ThreadId,
    pub post_id: PostId,
    pub image: ImageRef,
}

/// New content found in one thread snapshot.
#[derive(Debug, Clone, Default)]
pub struct ThreadDiff {
    pub thread_id: ThreadId,
    /// Unseen posts, ascending by number
    pub new_posts: Vec<Post>,
    /// Size of the snapshot the diff was computed from
    pub snapshot_len: usize,
    /// Images of new posts that passed `download_img`
    pub images: Vec<ImageJob>,
    /// Validator of the snapshot, stored once every new post is delivered
    pub last_modified: Option<String>,
}

impl ThreadDiff {
    pub fn has_changes(&self) -> bool {
        !self.new_posts.is_empty()
    }
}

/// Result of delivering a diff to the handler.
#[derive(Debug, Default)]
pub struct Committed {
    /// Posts the handler accepted
    pub posted: usize,
    /// Image jobs belonging to accepted posts
    pub images: Vec<ImageJob>,
    /// First handler error; later posts were not attempted
    pub failure: Option<AppError>,
}

/// Calculator turning snapshots into handler events.
#[derive(Debug, Clone)]
pub struct DiffEngine {
    /// Consecutive catalog absences before a thread is pruned
    prune_after_misses: u32,
    /// Whether image jobs are produced at all
    images: bool,
}

impl DiffEngine {
    pub fn new(prune_after_misses: u32, images: bool) -> Self {
        Self {
            prune_after_misses: prune_after_misses.max(1),
            images,
        }
    }

    /// Update the store from a catalog and return threads due for pruning.
    ///
    /// Listed threads are added if new and have their miss counter reset;
    /// known threads missing from the catalog count one more miss. Retired
    /// threads stay ignored until a catalog omits them.
    pub fn observe_catalog(&self, store: &mut WatchStore, catalog: &[ThreadId]) -> Vec<ThreadId> {
        let listed: HashSet<ThreadId> = catalog.iter().copied().collect();
        store.release_retired(&listed);

        for &thread_id in &listed {
            if !store.is_retired(thread_id) {
                store.entry(thread_id).missed_catalogs = 0;
            }
        }

        let mut due = Vec::new();
        for thread_id in store.known_thread_ids() {
            if listed.contains(&thread_id) {
                continue;
            }
            if let Some(state) = store.get_mut(thread_id) {
                state.missed_catalogs += 1;
                if state.missed_catalogs >= self.prune_after_misses {
                    due.push(thread_id);
                } else {
                    log::debug!(
                        "Thread {} missing from catalog ({}/{})",
                        thread_id,
                        state.missed_catalogs,
                        self.prune_after_misses
                    );
                }
            }
        }
        due
    }

    /// Compute the unseen posts of a snapshot.
    ///
    /// Consults `download_img` for every new post carrying an image, so
    /// images the handler does not want are never scheduled.
    pub fn diff<H: Handler + ?Sized>(
        &self,
        store: &WatchStore,
        thread_id: ThreadId,
        posts: Vec<Post>,
        handler: &H,
    ) -> ThreadDiff {
        let snapshot_len = posts.len();
        let state = store.get(thread_id);

        let mut queued = HashSet::new();
        let mut new_posts: Vec<Post> = posts
            .into_iter()
            .filter(|post| !state.is_some_and(|s| s.has_seen(post.no)))
            .filter(|post| queued.insert(post.no))
            .collect();
        new_posts.sort_by_key(|post| post.no);

        let images = if self.images {
            new_posts
                .iter()
                .filter_map(|post| post.image().map(|image| (post.no, image)))
                .filter(|(_, image)| handler.download_img(thread_id, &image.filename))
                .map(|(post_id, image)| ImageJob {
                    thread_id,
                    post_id,
                    image,
                })
                .collect()
        } else {
            Vec::new()
        };

        ThreadDiff {
            thread_id,
            new_posts,
            snapshot_len,
            images,
            last_modified: None,
        }
    }

    /// Deliver a diff to the handler, marking each post seen after it is
    /// persisted.
    ///
    /// The snapshot's `Last-Modified` is only kept when nothing failed;
    /// otherwise the next fetch would be answered 304 and the undelivered
    /// posts never retried.
    pub async fn commit<H: Handler + ?Sized>(
        &self,
        store: &mut WatchStore,
        diff: ThreadDiff,
        handler: &H,
    ) -> Committed {
        let ThreadDiff {
            thread_id,
            new_posts,
            snapshot_len,
            images,
            last_modified,
        } = diff;

        let state = store.entry(thread_id);
        let previous = state.last_post_ids.len();
        let newest = state.last_post_id();
        state.last_post_count = snapshot_len;

        let mut committed = Committed::default();
        let mut persisted = HashSet::new();
        for post in &new_posts {
            if let Err(e) = handler.post(thread_id, post).await {
                committed.failure = Some(e);
                break;
            }
            state.mark_seen(post.no);
            persisted.insert(post.no);
            committed.posted += 1;
        }

        if committed.failure.is_none() {
            state.last_modified = last_modified;
        }

        log::debug!(
            "Thread {} has {} posts, had {} up to {:?} => {} new",
            thread_id,
            snapshot_len,
            previous,
            newest,
            committed.posted
        );

        committed.images = images
            .into_iter()
            .filter(|job| persisted.contains(&job.post_id))
            .collect();
        committed
    }

    /// Emit `pruned` for a known thread and forget it.
    ///
    /// Returns `Ok(false)` for threads without watch state. The state is
    /// kept when the handler fails, so the prune is retried next cycle.
    pub async fn prune<H: Handler + ?Sized>(
        &self,
        store: &mut WatchStore,
        thread_id: ThreadId,
        handler: &H,
    ) -> Result<bool> {
        if store.get(thread_id).is_none() {
            return Ok(false);
        }
        handler.pruned(thread_id).await?;
        store.remove(thread_id);
        Ok(true)
    }

    /// Prune a thread the board answered 404 for and tombstone its id, so a
    /// stale catalog listing does not bring it back.
    pub async fn retire<H: Handler + ?Sized>(
        &self,
        store: &mut WatchStore,
        thread_id: ThreadId,
        handler: &H,
    ) -> Result<bool> {
        let pruned = self.prune(store, thread_id, handler).await?;
        store.retire(thread_id);
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Post(ThreadId, PostId),
        Pruned(ThreadId),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
        fail_on: Option<PostId>,
        fail_prune: bool,
        refuse_images: bool,
        asked: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn post(&self, thread_id: ThreadId, post: &Post) -> Result<()> {
            if self.fail_on == Some(post.no) {
                return Err(AppError::persistence("test", "disk full"));
            }
            self.events.lock().unwrap().push(Event::Post(thread_id, post.no));
            Ok(())
        }

        async fn pruned(&self, thread_id: ThreadId) -> Result<()> {
            if self.fail_prune {
                return Err(AppError::persistence("test", "read-only filesystem"));
            }
            self.events.lock().unwrap().push(Event::Pruned(thread_id));
            Ok(())
        }

        fn download_img(&self, _thread_id: ThreadId, filename: &str) -> bool {
            self.asked.lock().unwrap().push(filename.to_string());
            !self.refuse_images
        }

        async fn img(&self, _: ThreadId, _: &str, _: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn posts(ids: &[PostId]) -> Vec<Post> {
        ids.iter().map(|&id| Post::new(id, format!("post {id}"))).collect()
    }

    async fn apply(
        engine: &DiffEngine,
        store: &mut WatchStore,
        handler: &Recorder,
        thread_id: ThreadId,
        ids: &[PostId],
    ) -> Committed {
        let diff = engine.diff(store, thread_id, posts(ids), handler);
        engine.commit(store, diff, handler).await
    }

    #[tokio::test]
    async fn test_new_posts_emitted_in_ascending_order() {
        let engine = DiffEngine::new(2, false);
        let mut store = WatchStore::new();
        let handler = Recorder::default();

        apply(&engine, &mut store, &handler, 1, &[3, 1, 2]).await;

        assert_eq!(
            handler.events(),
            vec![Event::Post(1, 1), Event::Post(1, 2), Event::Post(1, 3)]
        );
        assert_eq!(store.get(1).unwrap().last_post_count, 3);
    }

    #[tokio::test]
    async fn test_replayed_snapshot_is_idempotent() {
        let engine = DiffEngine::new(2, false);
        let mut store = WatchStore::new();
        let handler = Recorder::default();

        apply(&engine, &mut store, &handler, 1, &[1, 2]).await;
        let again = apply(&engine, &mut store, &handler, 1, &[1, 2]).await;
        assert_eq!(again.posted, 0);

        apply(&engine, &mut store, &handler, 1, &[1, 2, 3]).await;
        assert_eq!(handler.events().len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_ids_in_snapshot_emit_once() {
        let engine = DiffEngine::new(2, false);
        let mut store = WatchStore::new();
        let handler = Recorder::default();

        apply(&engine, &mut store, &handler, 1, &[1, 1, 2]).await;
        assert_eq!(handler.events().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_post_is_not_marked_seen() {
        let engine = DiffEngine::new(2, false);
        let mut store = WatchStore::new();
        let failing = Recorder {
            fail_on: Some(2),
            ..Recorder::default()
        };

        let committed = apply(&engine, &mut store, &failing, 1, &[1, 2, 3]).await;
        assert_eq!(committed.posted, 1);
        assert!(committed.failure.is_some());
        assert!(store.get(1).unwrap().has_seen(1));
        assert!(!store.get(1).unwrap().has_seen(2));
        assert!(!store.get(1).unwrap().has_seen(3));

        let healthy = Recorder::default();
        apply(&engine, &mut store, &healthy, 1, &[1, 2, 3]).await;
        assert_eq!(healthy.events(), vec![Event::Post(1, 2), Event::Post(1, 3)]);
    }

    #[tokio::test]
    async fn test_refused_images_are_not_scheduled() {
        let engine = DiffEngine::new(2, true);
        let store = WatchStore::new();
        let handler = Recorder {
            refuse_images: true,
            ..Recorder::default()
        };
        let snapshot = vec![
            Post::new(1, "op").with_image(100, ".jpg", None),
            Post::new(2, "reply"),
        ];

        let diff = engine.diff(&store, 1, snapshot, &handler);
        assert!(diff.images.is_empty());
        assert_eq!(*handler.asked.lock().unwrap(), vec!["100.jpg".to_string()]);
    }

    #[tokio::test]
    async fn test_images_only_for_persisted_posts() {
        let engine = DiffEngine::new(2, true);
        let mut store = WatchStore::new();
        let handler = Recorder {
            fail_on: Some(2),
            ..Recorder::default()
        };
        let snapshot = vec![
            Post::new(1, "op").with_image(100, ".jpg", None),
            Post::new(2, "reply").with_image(200, ".png", None),
        ];

        let diff = engine.diff(&store, 1, snapshot, &handler);
        assert_eq!(diff.images.len(), 2);
        let committed = engine.commit(&mut store, diff, &handler).await;
        assert_eq!(committed.images.len(), 1);
        assert_eq!(committed.images[0].image.filename, "100.jpg");
    }

    #[tokio::test]
    async fn test_images_disabled_skips_predicate() {
        let engine = DiffEngine::new(2, false);
        let store = WatchStore::new();
        let handler = Recorder::default();
        let snapshot = vec![Post::new(1, "op").with_image(100, ".jpg", None)];

        let diff = engine.diff(&store, 1, snapshot, &handler);
        assert!(diff.images.is_empty());
        assert!(handler.asked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_after_two_missed_catalogs() {
        let engine = DiffEngine::new(2, false);
        let mut store = WatchStore::new();

        assert!(engine.observe_catalog(&mut store, &[111, 222]).is_empty());
        assert!(engine.observe_catalog(&mut store, &[111]).is_empty());
        assert_eq!(store.get(222).unwrap().missed_catalogs, 1);
        assert_eq!(engine.observe_catalog(&mut store, &[111]), vec![222]);
    }

    #[tokio::test]
    async fn test_relisting_resets_miss_counter() {
        let engine = DiffEngine::new(2, false);
        let mut store = WatchStore::new();

        engine.observe_catalog(&mut store, &[1, 2]);
        engine.observe_catalog(&mut store, &[1]);
        engine.observe_catalog(&mut store, &[1, 2]);
        assert!(engine.observe_catalog(&mut store, &[1]).is_empty());
    }

    #[tokio::test]
    async fn test_pruned_thread_starts_over() {
        let engine = DiffEngine::new(2, false);
        let mut store = WatchStore::new();
        let handler = Recorder::default();

        apply(&engine, &mut store, &handler, 7, &[1, 2]).await;
        assert!(engine.prune(&mut store, 7, &handler).await.unwrap());
        assert!(!engine.prune(&mut store, 7, &handler).await.unwrap());
        assert!(store.get(7).is_none());

        // A recycled id is a brand-new thread.
        apply(&engine, &mut store, &handler, 7, &[1]).await;
        assert_eq!(
            handler.events(),
            vec![
                Event::Post(7, 1),
                Event::Post(7, 2),
                Event::Pruned(7),
                Event::Post(7, 1)
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_prune_is_retried_next_catalog() {
        let engine = DiffEngine::new(2, false);
        let mut store = WatchStore::new();
        let failing = Recorder {
            fail_prune: true,
            ..Recorder::default()
        };

        apply(&engine, &mut store, &failing, 4, &[1]).await;
        engine.observe_catalog(&mut store, &[4]);
        engine.observe_catalog(&mut store, &[]);
        let due = engine.observe_catalog(&mut store, &[]);
        assert_eq!(due, vec![4]);

        assert!(engine.prune(&mut store, 4, &failing).await.is_err());
        assert!(store.get(4).unwrap().has_seen(1));

        let healthy = Recorder::default();
        let due = engine.observe_catalog(&mut store, &[]);
        assert_eq!(due, vec![4]);
        assert!(engine.prune(&mut store, 4, &healthy).await.unwrap());
        assert_eq!(healthy.events(), vec![Event::Pruned(4)]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_retired_thread_ignored_while_listed() {
        let engine = DiffEngine::new(2, false);
        let mut store = WatchStore::new();
        let handler = Recorder::default();

        engine.observe_catalog(&mut store, &[9]);
        assert!(engine.retire(&mut store, 9, &handler).await.unwrap());

        // The catalog lags behind and still lists 9.
        for _ in 0..3 {
            assert!(engine.observe_catalog(&mut store, &[9]).is_empty());
            assert!(store.get(9).is_none());
        }
        assert_eq!(handler.events(), vec![Event::Pruned(9)]);

        engine.observe_catalog(&mut store, &[]);
        engine.observe_catalog(&mut store, &[9]);
        assert!(store.get(9).is_some());
    }

    #[tokio::test]
    async fn test_failed_retire_keeps_thread_watched() {
        let engine = DiffEngine::new(2, false);
        let mut store = WatchStore::new();
        let failing = Recorder {
            fail_prune: true,
            ..Recorder::default()
        };

        engine.observe_catalog(&mut store, &[9]);
        assert!(engine.retire(&mut store, 9, &failing).await.is_err());
        assert!(store.get(9).is_some());
        assert!(!store.is_retired(9));
    }

    #[tokio::test]
    async fn test_validator_kept_only_after_full_delivery() {
        let engine = DiffEngine::new(2, false);
        let mut store = WatchStore::new();
        let failing = Recorder {
            fail_on: Some(2),
            ..Recorder::default()
        };

        let mut diff = engine.diff(&store, 1, posts(&[1, 2]), &failing);
        assert!(diff.has_changes());
        diff.last_modified = Some("Mon, 04 Mar 2024 10:00:00 GMT".to_string());
        engine.commit(&mut store, diff, &failing).await;
        assert_eq!(store.get(1).unwrap().last_modified, None);

        let healthy = Recorder::default();
        let mut diff = engine.diff(&store, 1, posts(&[1, 2]), &healthy);
        diff.last_modified = Some("Mon, 04 Mar 2024 10:01:00 GMT".to_string());
        engine.commit(&mut store, diff, &healthy).await;
        assert_eq!(
            store.get(1).unwrap().last_modified.as_deref(),
            Some("Mon, 04 Mar 2024 10:01:00 GMT")
        );
        assert_eq!(store.get(1).unwrap().last_post_id(), Some(2));
    }
}
