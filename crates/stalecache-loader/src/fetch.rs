//! Data loaders: where upstream bytes come from

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use stalecache::{ByteStream, UpstreamError};
use tracing::{debug, error};
use url::Url;

use crate::error::{LoaderError, Result};

/// Mockable byte fetcher
#[async_trait]
pub trait DataLoader: Send + Sync {
    /// Fetch the full body at `url`
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>>;
}

/// Turn one fetch into a one-shot upstream
///
/// The fetch starts when the stream is first polled. Failures are logged and
/// carried as [`UpstreamError`]s wrapping the [`LoaderError`].
pub fn fetch_stream(loader: Arc<dyn DataLoader>, url: Url) -> ByteStream {
    stream::once(async move {
        loader.fetch(&url).await.map_err(|e| {
            error!(url = %url, error = %e, "Fetch failed");
            UpstreamError::new(e)
        })
    })
    .boxed()
}

/// HTTP GET loader backed by reqwest
pub struct HttpDataLoader {
    client: reqwest::Client,
}

impl HttpDataLoader {
    /// Create a loader with a 30 second request timeout
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("stalecache/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LoaderError::Network(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DataLoader for HttpDataLoader {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        debug!("HTTP GET: {}", url);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| LoaderError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LoaderError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| LoaderError::Network(e.to_string()))?;
        Ok(body.to_vec())
    }
}
