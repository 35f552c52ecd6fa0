// src/models/mod.rs

//! Domain models for the watcher.

mod config;
mod post;

// Re-export all public types
pub use config::{BackendKind, Config, HttpConfig, StorageConfig, WatcherConfig};
pub use post::{
    CatalogPage, CatalogThread, ImageRef, Post, PostId, ThreadDocument, ThreadId,
    catalog_thread_ids,
};
