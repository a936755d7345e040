use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    backend::StorageBackend,
    client::Method,
    error::Result,
    transport::TransportResponse,
    utils::{generate_storage_key, TimeSource},
};

/// Caller-supplied labels stored alongside a cached response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheAttributes {
    pub primary: Option<String>,
    pub secondary: Option<String>,
    pub tertiary: Option<String>,
}

impl CacheAttributes {
    pub fn new(
        primary: Option<String>,
        secondary: Option<String>,
        tertiary: Option<String>,
    ) -> Self {
        Self {
            primary,
            secondary,
            tertiary,
        }
    }
}

/// A stored response. Replaced wholesale on re-store, never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub client_name: String,
    pub endpoint: String,
    pub version: String,
    pub method: Method,
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub cost: Option<f64>,
    pub attributes: CacheAttributes,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    pub fn response(&self) -> TransportResponse {
        TransportResponse {
            status_code: self.status_code,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// Persistent cache of API responses keyed by fingerprint
#[derive(Clone)]
pub struct ResponseStore {
    backend: Arc<dyn StorageBackend>,
    key_prefix: String,
    time_source: TimeSource,
}

impl ResponseStore {
    pub fn new(backend: Arc<dyn StorageBackend>, key_prefix: impl Into<String>, time_source: TimeSource) -> Self {
        Self {
            backend,
            key_prefix: key_prefix.into(),
            time_source,
        }
    }

    fn storage_key(&self, fingerprint: &str) -> String {
        generate_storage_key(&self.key_prefix, &["response", fingerprint])
    }

    /// Look up a live entry. Missing, expired and undecodable entries are misses.
    pub async fn get(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        let storage_key = self.storage_key(fingerprint);
        let Some(bytes) = self.backend.get(&storage_key).await? else {
            return Ok(None);
        };

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Dropping undecodable cache entry {}: {}", storage_key, e);
                self.backend.delete(&storage_key).await?;
                return Ok(None);
            }
        };

        if entry.is_expired(self.time_source.utc_now()) {
            debug!("Cache entry {} expired", fingerprint);
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Store `entry`, replacing any entry with the same key.
    ///
    /// `expires_at` is derived from `ttl`; `None` keeps the entry until cleared.
    pub async fn put(&self, mut entry: CacheEntry, ttl: Option<Duration>) -> Result<()> {
        entry.expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| entry.created_at + ttl);

        let storage_key = self.storage_key(&entry.key);
        let bytes = serde_json::to_vec(&entry)?;
        self.backend.put(&storage_key, bytes, ttl).await?;
        debug!("Cache STORE: {} ({} bytes body)", entry.key, entry.body.len());
        Ok(())
    }

    /// Drop one entry, returning whether it existed
    pub async fn clear(&self, fingerprint: &str) -> Result<bool> {
        Ok(self.backend.delete(&self.storage_key(fingerprint)).await? > 0)
    }

    /// Drop every entry, or only those of one client
    pub async fn clear_all(&self, client_name: Option<&str>) -> Result<u64> {
        let prefix = match client_name {
            Some(client) => self.storage_key(&format!("{}.", client)),
            None => self.storage_key(""),
        };
        self.backend.delete_prefix(&prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use chrono::TimeZone;

    fn store() -> (ResponseStore, TimeSource) {
        let time_source = TimeSource::manual(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let backend = Arc::new(MemoryBackend::new(100).with_time_source(time_source.clone()));
        (ResponseStore::new(backend, "test", time_source.clone()), time_source)
    }

    fn entry(key: &str, client: &str, created_at: DateTime<Utc>) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            client_name: client.to_string(),
            endpoint: "items".to_string(),
            version: "v1".to_string(),
            method: Method::Get,
            status_code: 200,
            headers: BTreeMap::from([("content-type".to_string(), "text/plain".to_string())]),
            body: b"payload".to_vec(),
            cost: Some(5.0),
            attributes: CacheAttributes::new(Some("listing".to_string()), None, None),
            created_at,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_miss_is_not_an_error() {
        let (store, _) = store();
        assert!(store.get("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, clock) = store();
        let original = entry("shop.get.items.h.v1", "shop", clock.utc_now());

        store.put(original.clone(), None).await.unwrap();
        let cached = store.get("shop.get.items.h.v1").await.unwrap().unwrap();

        assert_eq!(cached, original);
        assert_eq!(cached.response().text(), "payload");
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let (store, clock) = store();
        store
            .put(entry("k", "shop", clock.utc_now()), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let cached = store.get("k").await.unwrap().unwrap();
        assert_eq!(
            cached.expires_at,
            Some(clock.utc_now() + chrono::Duration::seconds(60))
        );

        clock.advance(Duration::from_secs(61));
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let (store, clock) = store();
        store.put(entry("k", "shop", clock.utc_now()), None).await.unwrap();

        let mut replacement = entry("k", "shop", clock.utc_now());
        replacement.status_code = 503;
        replacement.body = b"later".to_vec();
        store.put(replacement, None).await.unwrap();

        let cached = store.get("k").await.unwrap().unwrap();
        assert_eq!(cached.status_code, 503);
        assert_eq!(cached.body, b"later");
    }

    #[tokio::test]
    async fn test_clear_scopes() {
        let (store, clock) = store();
        let now = clock.utc_now();
        store.put(entry("shop.get.a.h.v1", "shop", now), None).await.unwrap();
        store.put(entry("shop.get.b.h.v1", "shop", now), None).await.unwrap();
        store.put(entry("maps.get.a.h.v1", "maps", now), None).await.unwrap();

        assert!(store.clear("shop.get.a.h.v1").await.unwrap());
        assert!(store.get("shop.get.a.h.v1").await.unwrap().is_none());
        assert!(!store.clear("shop.get.a.h.v1").await.unwrap());

        assert_eq!(store.clear_all(Some("shop")).await.unwrap(), 1);
        assert!(store.get("shop.get.b.h.v1").await.unwrap().is_none());
        assert!(store.get("maps.get.a.h.v1").await.unwrap().is_some());

        store.clear_all(None).await.unwrap();
        assert!(store.get("maps.get.a.h.v1").await.unwrap().is_none());
    }
}
