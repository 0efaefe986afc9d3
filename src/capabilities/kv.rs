use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::http::{HttpMethod, HttpRequest, ValidatedUrl};

pub const MAX_KEY_LENGTH: usize = 2048;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_VERSION_NAME_LENGTH: usize = 128;

/// Request identity used to key cached responses.
///
/// Only `GET` requests have a cache identity; the key is the absolute URL
/// without its fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self(key))
    }

    pub fn from_url(url: &ValidatedUrl) -> Self {
        Self(url.as_str().to_string())
    }

    /// `None` for requests that never hit the cache.
    pub fn for_request(request: &HttpRequest) -> Option<Self> {
        (request.method() == HttpMethod::Get).then(|| Self::from_url(request.url()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(KvError::InvalidKey {
                key: key.escape_default().to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validates a cache version name (one per build).
pub fn validate_version_name(name: &str) -> Result<(), KvError> {
    if name.is_empty() || name.len() > MAX_VERSION_NAME_LENGTH {
        return Err(KvError::InvalidKey {
            key: name.chars().take(50).collect(),
            reason: format!("version name must be 1..={MAX_VERSION_NAME_LENGTH} bytes"),
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(KvError::InvalidKey {
            key: name.to_string(),
            reason: "version name may only contain a-z, A-Z, 0-9, '-', '_', '.'".to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },
}
