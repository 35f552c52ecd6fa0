//! Post and image data structures as served by the board API.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Thread number, unique within a board.
pub type ThreadId = u64;

/// Post number, increasing within a thread.
pub type PostId = u64;

/// A single post of a thread.
///
/// Only the fields the watcher and the backends look at are typed; every
/// other field of the upstream record is kept in `extra` so persisted
/// documents carry the full post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    /// Post number
    pub no: PostId,

    /// Thread this post replies to (0 for the opening post)
    #[serde(default)]
    pub resto: ThreadId,

    /// UNIX timestamp of the post
    #[serde(default)]
    pub time: i64,

    /// Human-readable timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub now: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Subject line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Body text, escaped HTML
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub com: Option<String>,

    /// Image content identifier (upload timestamp in milliseconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tim: Option<u64>,

    /// Image extension including the dot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,

    /// Original image filename as uploaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    /// Base64-encoded MD5 of the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,

    /// Image size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fsize: Option<u64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Post {
    /// Minimal post with only a number and body, mostly useful in tests.
    pub fn new(no: PostId, com: impl Into<String>) -> Self {
        Self {
            no,
            resto: 0,
            time: 0,
            now: None,
            name: None,
            sub: None,
            com: Some(com.into()),
            tim: None,
            ext: None,
            filename: None,
            md5: None,
            fsize: None,
            extra: Map::new(),
        }
    }

    /// Attach an image reference, builder-style.
    pub fn with_image(mut self, tim: u64, ext: impl Into<String>, md5: Option<String>) -> Self {
        self.tim = Some(tim);
        self.ext = Some(ext.into());
        self.md5 = md5;
        self
    }

    /// The attached image, if the post carries one.
    pub fn image(&self) -> Option<ImageRef> {
        match (self.tim, self.ext.as_deref()) {
            (Some(tim), Some(ext)) => Some(ImageRef {
                filename: format!("{tim}{ext}"),
                md5: self.md5.clone(),
            }),
            _ => None,
        }
    }
}

/// Reference to an image stored on the board's media host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    /// Remote and local filename, `{tim}{ext}`
    pub filename: String,

    /// Base64-encoded MD5 digest published by the API
    pub md5: Option<String>,
}

/// Thread document as returned by the thread endpoint and as written by the
/// file backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ThreadDocument {
    pub posts: Vec<Post>,
}

/// One page of the `threads.json` catalog.
///
/// Page numbers and per-thread timestamps are ignored; freshness comes from
/// the thread endpoint's `Last-Modified` header instead.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogPage {
    pub threads: Vec<CatalogThread>,
}

/// A catalog entry.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogThread {
    pub no: ThreadId,
}

/// Flatten catalog pages into thread numbers, keeping listing order.
pub fn catalog_thread_ids(pages: &[CatalogPage]) -> Vec<ThreadId> {
    pages
        .iter()
        .flat_map(|page| page.threads.iter().map(|t| t.no))
        .collect()
}
