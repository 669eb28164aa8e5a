//! Key-bound view of a cache store

use std::sync::{Arc, Weak};

use futures::{future, stream, stream::BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    error::{ChannelError, UpstreamError},
    storage::CacheStore,
};

/// Binds one key to a shared [`CacheStore`]
///
/// The channel owns at most one recording task at a time. The task lives as
/// long as the channel, or until a later [`CacheChannel::record`] replaces it.
pub struct CacheChannel {
    key: String,
    store: Arc<dyn CacheStore>,
    recording: Mutex<Option<JoinHandle<()>>>,
}

impl CacheChannel {
    pub fn new(key: impl Into<String>, store: Arc<dyn CacheStore>) -> Self {
        Self {
            key: key.into(),
            store,
            recording: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Synchronous best-effort read; any store error is a miss
    pub fn peek(&self) -> Option<Vec<u8>> {
        match self.store.load(&self.key) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(key = %self.key, error = %e, "Treating unreadable cache entry as a miss");
                None
            }
        }
    }

    /// Deferred single-value read of the cached payload
    ///
    /// Nothing is read until the stream is first polled; the read then runs
    /// on the blocking pool. Emits the payload once, or completes empty on a
    /// miss, a store failure, or when the channel has been dropped in the
    /// meantime. Never yields an error.
    pub fn as_lazy_single_value(self: &Arc<Self>) -> BoxStream<'static, Vec<u8>> {
        let channel = Arc::downgrade(self);
        stream::once(async move {
            match read_detached(channel).await {
                Ok(payload) => Some(payload),
                Err(e) => {
                    debug!(error = %e, "No cached value");
                    None
                }
            }
        })
        .filter_map(future::ready)
        .boxed()
    }

    /// Persist every value `producer` emits under this channel's key
    ///
    /// Runs on its own task and replaces any previous recording. Store
    /// failures are logged and otherwise ignored; an upstream error ends the
    /// recording. Must be called from within a Tokio runtime.
    pub fn record<S>(&self, producer: S)
    where
        S: Stream<Item = Result<Vec<u8>, UpstreamError>> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let key = self.key.clone();

        let task = tokio::spawn(async move {
            let mut producer = Box::pin(producer);
            while let Some(item) = producer.next().await {
                let payload = match item {
                    Ok(payload) => payload,
                    Err(e) => {
                        debug!(key = %key, error = %e, "Upstream failed, nothing more to record");
                        break;
                    }
                };

                let store = Arc::clone(&store);
                let write_key = key.clone();
                match tokio::task::spawn_blocking(move || store.store(&write_key, &payload)).await
                {
                    Ok(Ok(())) => debug!(key = %key, "Recorded upstream value"),
                    Ok(Err(e)) => warn!(key = %key, error = %e, "Failed to persist cached value"),
                    Err(e) => warn!(key = %key, error = %e, "Cache write task failed"),
                }
            }
        });

        if let Some(previous) = self.recording.lock().replace(task) {
            previous.abort();
        }
    }

    /// Wait for the current recording to finish
    ///
    /// Returns immediately when nothing is being recorded.
    pub async fn settled(&self) {
        let task = self.recording.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Whether a recording task is attached and still running
    pub fn is_recording(&self) -> bool {
        self.recording
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }
}

impl Drop for CacheChannel {
    fn drop(&mut self) {
        if let Some(task) = self.recording.get_mut().take() {
            task.abort();
        }
    }
}

async fn read_detached(channel: Weak<CacheChannel>) -> Result<Vec<u8>, ChannelError> {
    let channel = channel.upgrade().ok_or(ChannelError::InvalidContext)?;
    let key = channel.key.clone();

    tokio::task::spawn_blocking(move || channel.peek())
        .await
        .map_err(|_| ChannelError::InvalidContext)?
        .ok_or(ChannelError::NoValueForKey { key })
}
