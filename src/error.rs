// src/error.rs

//! Unified error handling for the watcher.

use std::fmt;

use thiserror::Error;

use crate::models::ThreadId;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Failure of a call to the remote board API.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Network error, timeout or 5xx; safe to retry verbatim.
    #[error("transient fetch failure for {context}: {message}")]
    Transient { context: String, message: String },

    /// Non-retryable response, usually a misconfigured board.
    #[error("fatal fetch failure for {context}: {message}")]
    Fatal { context: String, message: String },

    /// The thread returned 404 between catalog listing and fetch.
    #[error("thread {0} is gone")]
    ThreadGone(ThreadId),
}

impl FetchError {
    /// Create a transient (retryable) fetch error.
    pub fn transient(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Transient {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create a fatal fetch error.
    pub fn fatal(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Fatal {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Remote API error
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// A backend failed to persist an event
    #[error("Persistence error for {context}: {message}")]
    Persistence { context: String, message: String },

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client could not be built
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// SQLite operation failed
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Create a persistence error with context.
    pub fn persistence(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Persistence {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// True when the error came from a fatal API response.
    pub fn is_fatal_fetch(&self) -> bool {
        matches!(self, Self::Fetch(FetchError::Fatal { .. }))
    }
}
