//! # stalecache
//!
//! A transparent caching layer between a consumer and an asynchronous
//! byte-producing source.
//!
//! ## Features
//!
//! - **TTL byte store**: one self-describing, atomically written entry per key
//! - **Run-once upstreams**: a multicaster shares one upstream run between the
//!   consumer and the cache writer
//! - **Two strategies**: cache-first and stale-while-revalidate, with
//!   upstream-wins-ties racing and error suppression after a cached value
//!
//! ```rust,ignore
//! let store = CacheConfig::default().build_store();
//! let channel = Arc::new(CacheChannel::new("Z2VucmVz", store));
//! let mut genres = combine(fetch_genres(), channel, CachingStrategy::StaleWhileRevalidate)
//!     .into_stream();
//! while let Some(payload) = genres.next().await {
//!     render(payload?);
//! }
//! ```

pub mod channel;
pub mod clock;
pub mod combinator;
pub mod config;
pub mod error;
pub mod multicast;
pub mod storage;
pub mod strategy;

pub use channel::CacheChannel;
pub use clock::{Clock, ManualClock, SystemClock};
pub use combinator::{combine, CombinedSource, CombinedStream};
pub use config::CacheConfig;
pub use error::{ChannelError, ConfigError, StoreError, StoreResult, UpstreamError};
pub use multicast::{ByteStream, SourceMulticaster, Subscription};
pub use storage::{CacheEntry, CacheLocation, CacheStore, FileCacheStore, MemoryCacheStore};
pub use strategy::CachingStrategy;
