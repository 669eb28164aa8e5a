//! Filesystem-safe cache keys

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::error::{LoaderError, Result};

/// A cache key safe to use verbatim as a file name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Encode a logical key (URL, composite string) with URL-safe base64
    pub fn derive(raw: &str) -> Self {
        Self(URL_SAFE_NO_PAD.encode(raw.as_bytes()))
    }

    /// Accept a key that is already filesystem-safe
    pub fn from_encoded(encoded: impl Into<String>) -> Result<Self> {
        let encoded = encoded.into();
        let invalid = |message: &str| LoaderError::InvalidKey {
            key: encoded.clone(),
            message: message.to_string(),
        };

        if encoded.is_empty() {
            return Err(invalid("key is empty"));
        }
        if encoded == "." || encoded == ".." {
            return Err(invalid("key is a relative path component"));
        }
        if encoded.contains(['/', '\\', '\0']) {
            return Err(invalid("key contains a path separator"));
        }
        Ok(Self(encoded))
    }

    /// Reverse [`CacheKey::derive`]
    pub fn decode(&self) -> Result<String> {
        let bytes = URL_SAFE_NO_PAD
            .decode(self.0.as_bytes())
            .map_err(|e| LoaderError::InvalidKey {
                key: self.0.clone(),
                message: e.to_string(),
            })?;
        String::from_utf8(bytes).map_err(|e| LoaderError::InvalidKey {
            key: self.0.clone(),
            message: e.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
