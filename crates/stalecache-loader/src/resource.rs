//! Cached resource loading
//!
//! [`ResourceLoader`] is the glue domain loaders are built from: it derives a
//! cache key, fetches through a [`DataLoader`], combines the fetch with the
//! cache and optionally decodes JSON.

use std::{collections::HashMap, sync::Arc};

use futures::{
    stream::{self, BoxStream},
    StreamExt,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use stalecache::{
    combine, CacheChannel, CacheConfig, CacheStore, CachingStrategy, CombinedStream,
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::{LoaderError, Result},
    fetch::{fetch_stream, DataLoader},
    key::CacheKey,
};

/// Loads resources through a cache
///
/// Channels are kept per key for the loader's lifetime, so values keep being
/// recorded after a consumer drops its stream. A new load for a key replaces
/// that key's previous recording.
pub struct ResourceLoader {
    data_loader: Arc<dyn DataLoader>,
    store: Arc<dyn CacheStore>,
    strategy: CachingStrategy,
    channels: Mutex<HashMap<CacheKey, Arc<CacheChannel>>>,
}

impl ResourceLoader {
    pub fn new(
        data_loader: Arc<dyn DataLoader>,
        store: Arc<dyn CacheStore>,
        strategy: CachingStrategy,
    ) -> Self {
        Self {
            data_loader,
            store,
            strategy,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Loader over the file store and default strategy `config` describes
    pub fn from_config(data_loader: Arc<dyn DataLoader>, config: &CacheConfig) -> Self {
        Self::new(data_loader, config.build_store(), config.strategy)
    }

    pub fn strategy(&self) -> CachingStrategy {
        self.strategy
    }

    /// The channel for `key`, created on first use
    pub fn channel(&self, key: &CacheKey) -> Arc<CacheChannel> {
        let mut channels = self.channels.lock();
        let channel = channels.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, "Opening cache channel");
            Arc::new(CacheChannel::new(key.as_str(), Arc::clone(&self.store)))
        });
        Arc::clone(channel)
    }

    /// Load raw bytes for `url`, cached under `logical_key`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn load_bytes(&self, url: &str, logical_key: &str) -> Result<CombinedStream> {
        self.load_bytes_with(url, logical_key, self.strategy)
    }

    /// Like [`ResourceLoader::load_bytes`] with an explicit strategy
    pub fn load_bytes_with(
        &self,
        url: &str,
        logical_key: &str,
        strategy: CachingStrategy,
    ) -> Result<CombinedStream> {
        let url = Url::parse(url).map_err(|e| LoaderError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let channel = self.channel(&CacheKey::derive(logical_key));
        let upstream = fetch_stream(Arc::clone(&self.data_loader), url);

        Ok(combine(upstream, channel, strategy).into_stream())
    }

    /// Load and decode JSON for `url`, cached under `logical_key`
    ///
    /// See [`decode_json`] for how undecodable payloads are reported.
    pub fn load_json<T>(
        &self,
        url: &str,
        logical_key: &str,
    ) -> Result<BoxStream<'static, Result<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        Ok(decode_json(self.load_bytes(url, logical_key)?))
    }
}

struct Decoding {
    payloads: CombinedStream,
    /// Decode failure held back in case a later payload decodes
    pending: Option<LoaderError>,
    has_emitted: bool,
    done: bool,
}

/// Decode every payload of a combined stream as JSON
///
/// Keeps the combined stream's shape: values, then completion or a single
/// error, and never an error once a value was delivered. A payload that
/// fails to decode is dropped if a value was already delivered or a later
/// payload decodes; otherwise it ends the stream with
/// [`LoaderError::Decode`].
pub fn decode_json<T>(stream: CombinedStream) -> BoxStream<'static, Result<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    let state = Decoding {
        payloads: stream,
        pending: None,
        has_emitted: false,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        loop {
            match state.payloads.next().await {
                Some(Ok(payload)) => match serde_json::from_slice::<T>(&payload) {
                    Ok(value) => {
                        state.pending = None;
                        state.has_emitted = true;
                        return Some((Ok(value), state));
                    }
                    Err(e) => {
                        let error = LoaderError::Decode(e.to_string());
                        if state.has_emitted {
                            warn!(error = %error, "Dropping undecodable payload");
                        } else {
                            debug!(error = %error, "Holding back decode failure");
                            state.pending = Some(error);
                        }
                    }
                },
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(LoaderError::from_upstream(e)), state));
                }
                None => {
                    state.done = true;
                    let pending = state.pending.take();
                    return pending.map(move |error| (Err(error), state));
                }
            }
        }
    })
    .boxed()
}
