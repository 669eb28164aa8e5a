//! Loaders built on stalecache
//!
//! Turns URLs into cached, combined byte streams:
//!
//! ```rust,ignore
//! let loader = ResourceLoader::new(
//!     Arc::new(HttpDataLoader::new()?),
//!     CacheConfig::default().build_store(),
//!     CachingStrategy::StaleWhileRevalidate,
//! );
//! let genres = loader.load_json::<GenresResponse>(GENRES_URL, "genre-list")?;
//! let mut states = track_state(genres);
//! ```

pub mod error;
pub mod fetch;
pub mod key;
pub mod resource;
pub mod state;

pub use error::{LoaderError, Result};
pub use fetch::{fetch_stream, DataLoader, HttpDataLoader};
pub use key::CacheKey;
pub use resource::{decode_json, ResourceLoader};
pub use state::{track_state, LoadState};
