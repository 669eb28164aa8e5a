//! Caching strategies

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// How a cached value is overlaid onto a live upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachingStrategy {
    /// On a hit only the cached value is published and upstream is never
    /// started. On a miss only upstream is published.
    CacheFirst,
    /// On a hit the cached value is published first and upstream's values
    /// follow. A cached value arriving after upstream's first event is
    /// dropped, and an upstream error after a cached value ends the stream
    /// normally.
    #[default]
    StaleWhileRevalidate,
}

impl CachingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CachingStrategy::CacheFirst => "cache-first",
            CachingStrategy::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

impl fmt::Display for CachingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CachingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cache-first" => Ok(CachingStrategy::CacheFirst),
            "stale-while-revalidate" => Ok(CachingStrategy::StaleWhileRevalidate),
            other => Err(format!("unknown caching strategy: {}", other)),
        }
    }
}
