//! Board API client.
//!
//! The watcher only talks to the remote board through [`BoardClient`]; the
//! HTTP implementation lives in [`http`]. Implementations hold no per-request
//! state, so a failed call can be repeated verbatim.

pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};

use crate::error::FetchError;
use crate::models::{ImageRef, Post, ThreadId};

pub use http::HttpBoardClient;

/// Result of a conditional thread fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadSnapshot {
    /// Full post list plus the validator to send next time
    Modified {
        posts: Vec<Post>,
        last_modified: Option<String>,
    },
    /// Nothing changed since `since`
    NotModified,
}

impl ThreadSnapshot {
    /// A snapshot without a `Last-Modified` validator.
    pub fn posts(posts: Vec<Post>) -> Self {
        Self::Modified {
            posts,
            last_modified: None,
        }
    }
}

/// Read-only access to one imageboard's API.
#[async_trait]
pub trait BoardClient: Send + Sync {
    /// Thread numbers currently listed on the board.
    async fn fetch_catalog(&self, board: &str) -> Result<Vec<ThreadId>, FetchError>;

    /// Posts of a thread in ascending order.
    ///
    /// `since` is the `Last-Modified` value of the previous successful fetch;
    /// when the thread has not changed since then the client may answer
    /// [`ThreadSnapshot::NotModified`]. Returns [`FetchError::ThreadGone`]
    /// when the thread no longer exists.
    async fn fetch_thread(
        &self,
        board: &str,
        thread_id: ThreadId,
        since: Option<&str>,
    ) -> Result<ThreadSnapshot, FetchError>;

    /// Raw bytes of an attached image.
    async fn fetch_image(&self, board: &str, image: &ImageRef) -> Result<Vec<u8>, FetchError>;
}

#[async_trait]
impl<C: BoardClient + ?Sized> BoardClient for Arc<C> {
    async fn fetch_catalog(&self, board: &str) -> Result<Vec<ThreadId>, FetchError> {
        (**self).fetch_catalog(board).await
    }

    async fn fetch_thread(
        &self,
        board: &str,
        thread_id: ThreadId,
        since: Option<&str>,
    ) -> Result<ThreadSnapshot, FetchError> {
        (**self).fetch_thread(board, thread_id, since).await
    }

    async fn fetch_image(&self, board: &str, image: &ImageRef) -> Result<Vec<u8>, FetchError> {
        (**self).fetch_image(board, image).await
    }
}

/// Check image bytes against the base64 MD5 published by the API.
///
/// An undecodable checksum never matches.
pub fn md5_matches(data: &[u8], expected_b64: &str) -> bool {
    match B64.decode(expected_b64.trim()) {
        Ok(expected) => md5::compute(data).0.as_slice() == expected.as_slice(),
        Err(_) => false,
    }
}
