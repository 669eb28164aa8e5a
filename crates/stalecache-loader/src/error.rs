//! Loader error types

use stalecache::UpstreamError;
use thiserror::Error;

/// Errors surfaced by loaders
#[derive(Error, Debug, Clone)]
pub enum LoaderError {
    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Invalid cache key '{key}': {message}")]
    InvalidKey { key: String, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Upstream error: {0}")]
    Upstream(UpstreamError),
}

impl LoaderError {
    /// Recover a loader error that travelled through a combined stream
    pub fn from_upstream(error: UpstreamError) -> Self {
        match error.downcast_ref::<LoaderError>() {
            Some(inner) => inner.clone(),
            None => LoaderError::Upstream(error),
        }
    }
}

/// Result type for loader operations
pub type Result<T> = std::result::Result<T, LoaderError>;
