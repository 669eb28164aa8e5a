//! Cache-related error types

use std::{fmt, path::PathBuf, sync::Arc};

use thiserror::Error;

/// Cache store errors
///
/// All of these are non-fatal from the point of view of a combined stream:
/// [`crate::CacheChannel`] downgrades every one of them to "no cached value".
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cache directory unavailable: {message}")]
    DirectoryUnavailable { message: String },

    #[error("Failed to write cache entry '{key}': {source}")]
    WriteFailed {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read cache entry '{key}': {source}")]
    ReadFailed {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode cache entry '{key}': {message}")]
    DecodeFailed { key: String, message: String },
}

/// Errors of the lazy single-value cache read
///
/// Only used internally; both variants collapse to an empty producer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("No cached value for key '{key}'")]
    NoValueForKey { key: String },

    #[error("Cache channel is no longer available")]
    InvalidContext,
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid cache config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Opaque error produced by an upstream source.
///
/// Cloneable so a single failure can be broadcast to every subscriber of a
/// [`crate::SourceMulticaster`].
#[derive(Clone)]
pub struct UpstreamError {
    inner: Arc<dyn std::error::Error + Send + Sync + 'static>,
}

impl UpstreamError {
    /// Wrap any error produced by an upstream source
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    /// Create an upstream error from a plain message
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(MessageError(message.into()))
    }

    /// Access the wrapped error if it is of type `E`
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.inner.downcast_ref::<E>()
    }
}

impl fmt::Debug for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UpstreamError").field(&self.inner).finish()
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl std::error::Error for UpstreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&*self.inner)
    }
}

#[derive(Error, Debug)]
#[error("{0}")]
struct MessageError(String);

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;
