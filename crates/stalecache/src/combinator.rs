//! Merging a cached value with a live upstream
//!
//! [`combine`] wraps an upstream stream and a [`CacheChannel`] according to a
//! [`CachingStrategy`]:
//!
//! - **Cache first**: on a hit the cached value is the whole result and the
//!   upstream is never started. On a miss the upstream passes through
//!   unchanged while the channel records its values.
//! - **Stale while revalidate**: the cached value (if any) races the
//!   upstream's first event. A cached value is only delivered if it arrives
//!   strictly before that event. Upstream values always follow. An upstream
//!   error after a delivered value ends the stream normally instead.
//!
//! The upstream runs at most once no matter how many subscriptions are taken
//! from the returned [`CombinedSource`]; the channel's recording observes the
//! same run without starting it.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{stream::BoxStream, Stream, StreamExt};
use tracing::debug;

use crate::{
    channel::CacheChannel,
    error::UpstreamError,
    multicast::{SourceMulticaster, Subscription},
    strategy::CachingStrategy,
};

/// Combine `upstream` with the value cached in `channel`
///
/// Must be called from within a Tokio runtime.
pub fn combine<S>(upstream: S, channel: Arc<CacheChannel>, strategy: CachingStrategy) -> CombinedSource
where
    S: Stream<Item = Result<Vec<u8>, UpstreamError>> + Send + 'static,
{
    if strategy == CachingStrategy::CacheFirst {
        if let Some(cached) = channel.peek() {
            debug!(key = channel.key(), "Cache hit, upstream skipped");
            return CombinedSource {
                kind: SourceKind::Hit(cached),
            };
        }
        debug!(key = channel.key(), "Cache miss, using upstream");
    }

    let shared_upstream = SourceMulticaster::new(upstream);
    channel.record(shared_upstream.observe());

    CombinedSource {
        kind: SourceKind::Live {
            upstream: shared_upstream,
            channel,
            strategy,
        },
    }
}

enum SourceKind {
    Hit(Vec<u8>),
    Live {
        upstream: SourceMulticaster,
        channel: Arc<CacheChannel>,
        strategy: CachingStrategy,
    },
}

/// The result of [`combine`]; hands out [`CombinedStream`]s
///
/// Subscriptions share one upstream run. Values are not replayed, so a
/// subscription taken after the upstream emitted misses those values.
pub struct CombinedSource {
    kind: SourceKind,
}

impl CombinedSource {
    /// Attach a new observer with its own merge state
    pub fn subscribe(&self) -> CombinedStream {
        match &self.kind {
            SourceKind::Hit(cached) => CombinedStream {
                state: State::Cached(Some(cached.clone())),
                _channel: None,
            },
            SourceKind::Live {
                upstream,
                channel,
                strategy: CachingStrategy::CacheFirst,
            } => CombinedStream {
                state: State::Passthrough(upstream.subscribe()),
                _channel: Some(Arc::clone(channel)),
            },
            SourceKind::Live {
                upstream,
                channel,
                strategy: CachingStrategy::StaleWhileRevalidate,
            } => CombinedStream::revalidating(
                upstream.subscribe(),
                channel.as_lazy_single_value(),
                Arc::clone(channel),
            ),
        }
    }

    /// Consume the source into its single observer
    pub fn into_stream(self) -> CombinedStream {
        self.subscribe()
    }

    /// Whether a cache-first hit made the upstream unnecessary
    pub fn is_cache_hit(&self) -> bool {
        matches!(self.kind, SourceKind::Hit(_))
    }
}

/// One subscription to a combined cache/upstream source
///
/// Yields zero or more values, then ends, or yields a single error. Dropping
/// it cancels the pending cache read and releases its upstream subscription;
/// the channel's recording is unaffected.
pub struct CombinedStream {
    state: State,
    // Keeps the channel (and its recording) alive while observed
    _channel: Option<Arc<CacheChannel>>,
}

enum State {
    Cached(Option<Vec<u8>>),
    Passthrough(Subscription),
    Revalidating(Revalidate),
}

struct Revalidate {
    upstream: Subscription,
    /// Dropped as soon as upstream produces any event
    cached: Option<BoxStream<'static, Vec<u8>>>,
    has_emitted: bool,
    done: bool,
}

impl CombinedStream {
    fn revalidating(
        upstream: Subscription,
        cached: BoxStream<'static, Vec<u8>>,
        channel: Arc<CacheChannel>,
    ) -> Self {
        Self {
            state: State::Revalidating(Revalidate {
                upstream,
                cached: Some(cached),
                has_emitted: false,
                done: false,
            }),
            _channel: Some(channel),
        }
    }
}

impl Stream for CombinedStream {
    type Item = Result<Vec<u8>, UpstreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.state {
            State::Cached(cached) => Poll::Ready(cached.take().map(Ok)),
            State::Passthrough(upstream) => upstream.poll_next_unpin(cx),
            State::Revalidating(revalidate) => revalidate.poll_next(cx),
        }
    }
}

impl Revalidate {
    fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Vec<u8>, UpstreamError>>> {
        if self.done {
            return Poll::Ready(None);
        }

        // Upstream is polled first so it wins ties
        match self.upstream.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(payload))) => {
                self.cached = None;
                self.has_emitted = true;
                return Poll::Ready(Some(Ok(payload)));
            }
            Poll::Ready(Some(Err(error))) => {
                self.cached = None;
                self.done = true;
                if self.has_emitted {
                    debug!(error = %error, "Suppressing upstream error after cached value");
                    return Poll::Ready(None);
                }
                return Poll::Ready(Some(Err(error)));
            }
            Poll::Ready(None) => {
                self.cached = None;
                self.done = true;
                return Poll::Ready(None);
            }
            Poll::Pending => {}
        }

        if let Some(cached) = self.cached.as_mut() {
            match cached.poll_next_unpin(cx) {
                Poll::Ready(Some(payload)) => {
                    self.cached = None;
                    self.has_emitted = true;
                    return Poll::Ready(Some(Ok(payload)));
                }
                Poll::Ready(None) => self.cached = None,
                Poll::Pending => {}
            }
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use futures::stream;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;
    use crate::{
        error::StoreResult,
        storage::{CacheStore, MemoryCacheStore},
    };

    const KEY: &str = "bW92aWUtbGlzdDI4";
    const CACHED: &[u8] = b"(the mic is off)";
    const FRESH: &[u8] = b"Hey, I think this is broken.";

    type Subject = mpsc::UnboundedSender<Result<Vec<u8>, UpstreamError>>;

    fn subject() -> (Subject, UnboundedReceiverStream<Result<Vec<u8>, UpstreamError>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (sender, UnboundedReceiverStream::new(receiver))
    }

    fn channel_with(cached: Option<&[u8]>) -> (Arc<MemoryCacheStore>, Arc<CacheChannel>) {
        let store = Arc::new(MemoryCacheStore::new());
        if let Some(cached) = cached {
            store.store(KEY, cached).unwrap();
        }
        let channel = Arc::new(CacheChannel::new(KEY, store.clone()));
        (store, channel)
    }

    /// Memory store whose reads block for `delay`
    struct SlowStore {
        inner: MemoryCacheStore,
        delay: Duration,
        reads: AtomicUsize,
    }

    impl CacheStore for SlowStore {
        fn store(&self, key: &str, payload: &[u8]) -> StoreResult<()> {
            self.inner.store(key, payload)
        }

        fn load(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.inner.load(key)
        }
    }

    /// Send `item` after a short delay, then complete
    fn send_later(subject: Subject, item: Result<Vec<u8>, UpstreamError>) {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = subject.send(item);
        });
    }

    async fn drain(stream: CombinedStream) -> (Vec<Vec<u8>>, Option<UpstreamError>) {
        let mut values = Vec::new();
        let mut error = None;
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(value) => values.push(value),
                Err(e) => {
                    assert!(error.is_none(), "more than one terminal error");
                    error = Some(e);
                }
            }
        }
        (values, error)
    }

    #[tokio::test]
    async fn test_cache_first_hit_skips_upstream() {
        let (_store, channel) = channel_with(Some(CACHED));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let upstream = stream::once(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(FRESH.to_vec())
        });

        let source = combine(upstream, channel.clone(), CachingStrategy::CacheFirst);
        assert!(source.is_cache_hit());

        let (values, error) = drain(source.into_stream()).await;
        assert_eq!(values, vec![CACHED.to_vec()]);
        assert!(error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!channel.is_recording());
    }

    #[tokio::test]
    async fn test_cache_first_hit_ignores_later_upstream_values() {
        let (_store, channel) = channel_with(Some(CACHED));
        let (subject, upstream) = subject();

        let stream = combine(upstream, channel.clone(), CachingStrategy::CacheFirst).into_stream();
        send_later(subject, Ok(FRESH.to_vec()));

        let (values, _) = drain(stream).await;
        assert_eq!(values, vec![CACHED.to_vec()]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(channel.peek(), Some(CACHED.to_vec()));
    }

    #[tokio::test]
    async fn test_cache_first_miss_mirrors_upstream() {
        let (_store, channel) = channel_with(None);
        let upstream = stream::iter(vec![
            Ok(b"one".to_vec()),
            Ok(b"two".to_vec()),
            Err(UpstreamError::msg("offline")),
        ]);

        let stream = combine(upstream, channel, CachingStrategy::CacheFirst).into_stream();
        let (values, error) = drain(stream).await;

        assert_eq!(values, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(error.unwrap().to_string(), "offline");
    }

    #[tokio::test]
    async fn test_cache_first_miss_records_upstream_value() {
        let (_store, channel) = channel_with(None);
        let upstream = stream::iter(vec![Ok(FRESH.to_vec())]);

        let stream = combine(upstream, channel.clone(), CachingStrategy::CacheFirst).into_stream();
        let (values, _) = drain(stream).await;
        assert_eq!(values, vec![FRESH.to_vec()]);

        channel.settled().await;
        assert_eq!(channel.peek(), Some(FRESH.to_vec()));
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_publishes_cached_then_upstream() {
        let (_store, channel) = channel_with(Some(CACHED));
        let (subject, upstream) = subject();

        let stream =
            combine(upstream, channel.clone(), CachingStrategy::StaleWhileRevalidate).into_stream();
        send_later(subject, Ok(FRESH.to_vec()));

        let (values, error) = drain(stream).await;
        assert_eq!(values, vec![CACHED.to_vec(), FRESH.to_vec()]);
        assert!(error.is_none());

        channel.settled().await;
        assert_eq!(channel.peek(), Some(FRESH.to_vec()));
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_miss_publishes_upstream() {
        let (_store, channel) = channel_with(None);
        let (subject, upstream) = subject();

        let stream = combine(upstream, channel, CachingStrategy::StaleWhileRevalidate).into_stream();
        send_later(subject, Ok(b"Is this thing on?".to_vec()));

        let (values, error) = drain(stream).await;
        assert_eq!(values, vec![b"Is this thing on?".to_vec()]);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_suppresses_error_after_cached_value() {
        let (_store, channel) = channel_with(Some(CACHED));
        let (subject, upstream) = subject();

        let stream = combine(upstream, channel, CachingStrategy::StaleWhileRevalidate).into_stream();
        send_later(subject, Err(UpstreamError::msg("offline")));

        let (values, error) = drain(stream).await;
        assert_eq!(values, vec![CACHED.to_vec()]);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_forwards_error_without_cached_value() {
        let (_store, channel) = channel_with(None);
        let (subject, upstream) = subject();

        let stream = combine(upstream, channel, CachingStrategy::StaleWhileRevalidate).into_stream();
        subject.send(Err(UpstreamError::msg("offline"))).unwrap();

        let (values, error) = drain(stream).await;
        assert!(values.is_empty());
        assert_eq!(error.unwrap().to_string(), "offline");
    }

    #[tokio::test]
    async fn test_upstream_wins_ties_with_cache() {
        let (_store, channel) = channel_with(Some(CACHED));
        let source = SourceMulticaster::new(stream::iter(vec![Ok(FRESH.to_vec())]));
        let upstream = source.subscribe();

        // Run the source to completion so its event is already waiting
        let _: Vec<_> = source.subscribe().collect().await;

        let stream = CombinedStream::revalidating(
            upstream,
            channel.as_lazy_single_value(),
            channel.clone(),
        );
        let (values, error) = drain(stream).await;
        assert_eq!(values, vec![FRESH.to_vec()]);
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_upstream_runs_once_for_many_subscribers() {
        let (_store, channel) = channel_with(Some(CACHED));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let upstream = stream::once(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(FRESH.to_vec())
        });

        let source = combine(upstream, channel.clone(), CachingStrategy::StaleWhileRevalidate);
        let subscriptions: Vec<_> = (0..4).map(|_| source.subscribe()).collect();
        let results = futures::future::join_all(subscriptions.into_iter().map(drain)).await;

        for (values, error) in results {
            assert_eq!(values.last(), Some(&FRESH.to_vec()));
            assert!(error.is_none());
        }
        channel.settled().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_stream_keeps_recording_alive() {
        let (_store, channel) = channel_with(Some(CACHED));
        let (subject, upstream) = subject();

        let mut stream =
            combine(upstream, channel.clone(), CachingStrategy::StaleWhileRevalidate).into_stream();
        assert_eq!(stream.next().await.unwrap().unwrap(), CACHED);
        drop(stream);

        subject.send(Ok(FRESH.to_vec())).unwrap();
        drop(subject);
        channel.settled().await;

        assert_eq!(channel.peek(), Some(FRESH.to_vec()));
    }

    #[tokio::test]
    async fn test_dropping_everything_cancels_upstream() {
        let (_store, channel) = channel_with(None);
        let (subject, upstream) = subject();

        let mut stream =
            combine(upstream, channel, CachingStrategy::StaleWhileRevalidate).into_stream();
        subject.send(Ok(b"partial".to_vec())).unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), b"partial");

        // The stream held the last reference to the channel
        drop(stream);

        tokio::time::timeout(Duration::from_secs(1), subject.closed())
            .await
            .expect("upstream was not cancelled");
    }

    #[tokio::test]
    async fn test_unpolled_stream_lets_recording_finish() {
        let (_store, channel) = channel_with(None);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let upstream = stream::once(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(FRESH.to_vec())
        });

        let stream =
            combine(upstream, channel.clone(), CachingStrategy::StaleWhileRevalidate).into_stream();
        drop(stream);

        tokio::time::timeout(Duration::from_secs(2), channel.settled())
            .await
            .expect("recording was left waiting");
        assert!(!channel.is_recording());
        assert_eq!(channel.peek(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsubscribed_source_lets_recording_finish() {
        let (_store, channel) = channel_with(None);
        let (_subject, upstream) = subject();

        let source = combine(upstream, channel.clone(), CachingStrategy::CacheFirst);
        assert!(!source.is_cache_hit());
        drop(source);

        tokio::time::timeout(Duration::from_secs(2), channel.settled())
            .await
            .expect("recording was left waiting");
        assert_eq!(channel.peek(), None);
    }

    #[tokio::test]
    async fn test_cancelling_during_cache_read_cancels_upstream() {
        let store = Arc::new(SlowStore {
            inner: MemoryCacheStore::new(),
            delay: Duration::from_millis(200),
            reads: AtomicUsize::new(0),
        });
        store.store(KEY, CACHED).unwrap();
        let channel = Arc::new(CacheChannel::new(KEY, store.clone()));
        let (subject, upstream) = subject();

        let mut stream =
            combine(upstream, channel, CachingStrategy::StaleWhileRevalidate).into_stream();

        // The first poll starts the upstream and the blocking cache read
        let polled = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(polled.is_err(), "a value arrived before the cache read finished");
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);

        drop(stream);

        tokio::time::timeout(Duration::from_secs(2), subject.closed())
            .await
            .expect("upstream was not cancelled");
        assert!(subject.send(Ok(FRESH.to_vec())).is_err());
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }
}
