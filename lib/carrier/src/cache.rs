//! Key/value cache contract for the dependency maps.
//!
//! A missing key always means "rebuild", never an error.

use crate::error::CacheError;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheError>;

    async fn set(&self, key: &str, value: JsonValue, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Reads and decodes a cached value.
///
/// # Errors
///
/// Returns `CacheError::Codec` if the stored value has the wrong shape.
pub async fn get_json<T: DeserializeOwned>(
    cache: &dyn Cache,
    key: &str,
) -> Result<Option<T>, CacheError> {
    match cache.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| CacheError::Codec {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Encodes and stores a value.
///
/// # Errors
///
/// Returns `CacheError::Codec` if the value cannot be encoded.
pub async fn set_json<T: Serialize + Sync>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), CacheError> {
    let value = serde_json::to_value(value).map_err(|e| CacheError::Codec {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    cache.set(key, value, ttl).await
}

/// In-process cache with per-key expiry.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (JsonValue, Instant)>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, (JsonValue, Instant)>>, CacheError> {
        self.entries.lock().map_err(|e| CacheError::Backend {
            message: format!("cache lock poisoned: {e}"),
        })
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheError> {
        let mut entries = self.entries()?;
        let now = Instant::now();
        if entries.get(key).is_some_and(|(_, expires)| *expires <= now) {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: JsonValue, ttl: Duration) -> Result<(), CacheError> {
        self.entries()?
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn typed_roundtrip_and_expiry() {
        let cache = MemoryCache::new();
        let value = BTreeMap::from([("a".to_string(), 1u32)]);
        set_json(&cache, "k", &value, Duration::from_secs(60))
            .await
            .unwrap();
        let back: Option<BTreeMap<String, u32>> = get_json(&cache, "k").await.unwrap();
        assert_eq!(back, Some(value));

        cache
            .set("gone", JsonValue::from(1), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(cache.get("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn wrong_shape_is_a_codec_error() {
        let cache = MemoryCache::new();
        cache
            .set("k", JsonValue::from("text"), Duration::from_secs(60))
            .await
            .unwrap();
        let result: Result<Option<Vec<u32>>, _> = get_json(&cache, "k").await;
        assert!(matches!(result, Err(CacheError::Codec { .. })));
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
