use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::{future::Cache, Expiry};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

use crate::{
    error::Result,
    utils::{calculate_reset, window_expired, TimeSource},
};

/// Attempt count of a fixed window and the time until it resets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub attempts: u64,
    pub resets_in: Duration,
}

/// Outcome of a counter increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Increment {
    /// The attempt was recorded
    Counted(WindowSnapshot),
    /// The ceiling was already reached; nothing was recorded
    Refused(WindowSnapshot),
}

impl Increment {
    pub fn snapshot(&self) -> WindowSnapshot {
        match self {
            Increment::Counted(snapshot) | Increment::Refused(snapshot) => *snapshot,
        }
    }
}

/// Key/value storage underneath the response store and the rate limiter
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value`, replacing any previous value. `None` keeps it until deleted.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Delete the value or counter at `key`, returning how many were removed
    async fn delete(&self, key: &str) -> Result<u64>;

    /// Delete every value whose key starts with `prefix`, returning how many went
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Current state of the fixed-window counter at `key`, if a window is open
    async fn window(&self, key: &str, window: Duration) -> Result<Option<WindowSnapshot>>;

    /// Atomically count one attempt in the fixed window at `key`.
    ///
    /// An expired or missing window is replaced by a new one starting now with a
    /// count of one. With a `ceiling`, a window already holding that many attempts
    /// is left untouched and the increment is refused. The check and the write
    /// happen in one step so concurrent callers cannot both slip under the ceiling.
    async fn increment_window(
        &self,
        key: &str,
        window: Duration,
        ceiling: Option<u64>,
    ) -> Result<Increment>;

    /// Health check for the backend
    async fn health_check(&self) -> Result<()>;
}

#[derive(Clone, Debug)]
struct StoredValue {
    bytes: Arc<Vec<u8>>,
    ttl: Option<Duration>,
    expires_at: Option<DateTime<Utc>>,
}

struct StoredValueExpiry;

impl Expiry<String, StoredValue> for StoredValueExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredValue,
        _current_time: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    /// A re-stored value takes its own TTL, not what was left of the old one
    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

#[derive(Debug, Clone, Copy)]
struct CounterWindow {
    attempts: u64,
    started_at: DateTime<Utc>,
}

/// In-process backend.
///
/// Values live in a bounded moka cache which also evicts them once their TTL has
/// passed in real time. Reads additionally compare against the injected clock, so
/// a manual [`TimeSource`] expires entries deterministically. Counters sit behind a
/// single mutex, making each increment one critical section.
pub struct MemoryBackend {
    values: Cache<String, StoredValue>,
    counters: Mutex<HashMap<String, CounterWindow>>,
    time_source: TimeSource,
}

impl MemoryBackend {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            values: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(StoredValueExpiry)
                .build(),
            counters: Mutex::new(HashMap::new()),
            time_source: TimeSource::new(),
        }
    }

    pub fn with_time_source(mut self, time_source: TimeSource) -> Self {
        self.time_source = time_source;
        self
    }

    fn snapshot(&self, counter: &CounterWindow, window: Duration) -> WindowSnapshot {
        WindowSnapshot {
            attempts: counter.attempts,
            resets_in: calculate_reset(counter.started_at, window, &self.time_source),
        }
    }

    fn is_live(&self, counter: &CounterWindow, window: Duration) -> bool {
        !window_expired(counter.started_at, window, &self.time_source)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(stored) = self.values.get(key).await else {
            return Ok(None);
        };
        if let Some(expires_at) = stored.expires_at {
            if self.time_source.utc_now() >= expires_at {
                self.values.invalidate(key).await;
                return Ok(None);
            }
        }
        Ok(Some(stored.bytes.as_ref().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = match ttl {
            Some(ttl) => chrono::Duration::from_std(ttl)
                .ok()
                .map(|ttl| self.time_source.utc_now() + ttl),
            None => None,
        };
        self.values
            .insert(
                key.to_string(),
                StoredValue {
                    bytes: Arc::new(value),
                    ttl,
                    expires_at,
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut removed = u64::from(self.values.remove(key).await.is_some());
        removed += u64::from(self.counters.lock().await.remove(key).is_some());
        Ok(removed)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let keys: Vec<Arc<String>> = self
            .values
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key)
            .collect();
        let mut removed = keys.len() as u64;
        for key in keys {
            self.values.invalidate(key.as_str()).await;
        }

        let mut counters = self.counters.lock().await;
        let before = counters.len();
        counters.retain(|key, _| !key.starts_with(prefix));
        removed += (before - counters.len()) as u64;

        Ok(removed)
    }

    async fn window(&self, key: &str, window: Duration) -> Result<Option<WindowSnapshot>> {
        let counters = self.counters.lock().await;
        Ok(counters
            .get(key)
            .filter(|counter| self.is_live(counter, window))
            .map(|counter| self.snapshot(counter, window)))
    }

    async fn increment_window(
        &self,
        key: &str,
        window: Duration,
        ceiling: Option<u64>,
    ) -> Result<Increment> {
        let mut counters = self.counters.lock().await;
        let now = self.time_source.utc_now();

        let live = counters
            .get(key)
            .copied()
            .filter(|counter| self.is_live(counter, window));

        let next = match live {
            Some(counter) => {
                if ceiling.is_some_and(|ceiling| counter.attempts >= ceiling) {
                    return Ok(Increment::Refused(self.snapshot(&counter, window)));
                }
                CounterWindow {
                    attempts: counter.attempts + 1,
                    ..counter
                }
            }
            None => {
                if ceiling == Some(0) {
                    return Ok(Increment::Refused(WindowSnapshot {
                        attempts: 0,
                        resets_in: window,
                    }));
                }
                CounterWindow {
                    attempts: 1,
                    started_at: now,
                }
            }
        };

        counters.insert(key.to_string(), next);
        Ok(Increment::Counted(self.snapshot(&next, window)))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn manual_backend() -> (MemoryBackend, TimeSource) {
        let time_source = TimeSource::manual(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        (MemoryBackend::new(100).with_time_source(time_source.clone()), time_source)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (backend, _) = manual_backend();

        backend.put("k", b"value".to_vec(), None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"value".to_vec()));

        backend.put("k", b"newer".to_vec(), None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"newer".to_vec()));

        assert_eq!(backend.delete("k").await.unwrap(), 1);
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert_eq!(backend.get("missing").await.unwrap(), None);
        assert_eq!(backend.delete("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_ttl() {
        let backend = MemoryBackend::new(100);

        backend
            .put("k", b"old".to_vec(), Some(Duration::from_millis(300)))
            .await
            .unwrap();
        backend.put("k", b"new".to_vec(), None).await.unwrap();
        backend
            .put("short", b"old".to_vec(), Some(Duration::from_millis(300)))
            .await
            .unwrap();
        backend
            .put("short", b"new".to_vec(), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        backend.values.run_pending_tasks().await;

        assert_eq!(backend.get("k").await.unwrap(), Some(b"new".to_vec()));
        assert_eq!(backend.get("short").await.unwrap(), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_lazy_ttl_expiry() {
        let (backend, clock) = manual_backend();

        backend
            .put("k", b"v".to_vec(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(9));
        assert!(backend.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(backend.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let (backend, _) = manual_backend();

        backend.put("response:a.1", vec![1], None).await.unwrap();
        backend.put("response:a.2", vec![2], None).await.unwrap();
        backend.put("response:b.1", vec![3], None).await.unwrap();

        assert_eq!(backend.delete_prefix("response:a.").await.unwrap(), 2);
        assert!(backend.get("response:a.1").await.unwrap().is_none());
        assert!(backend.get("response:b.1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_window_counting_and_rollover() {
        let (backend, clock) = manual_backend();
        let window = Duration::from_secs(60);

        assert_eq!(backend.window("c", window).await.unwrap(), None);

        for expected in 1..=3 {
            let result = backend.increment_window("c", window, None).await.unwrap();
            assert_eq!(result.snapshot().attempts, expected);
        }

        clock.advance(Duration::from_secs(20));
        let snapshot = backend.window("c", window).await.unwrap().unwrap();
        assert_eq!(snapshot.attempts, 3);
        assert_eq!(snapshot.resets_in, Duration::from_secs(40));

        clock.advance(Duration::from_secs(40));
        assert_eq!(backend.window("c", window).await.unwrap(), None);

        let result = backend.increment_window("c", window, None).await.unwrap();
        assert_eq!(
            result,
            Increment::Counted(WindowSnapshot {
                attempts: 1,
                resets_in: window
            })
        );
    }

    #[tokio::test]
    async fn test_ceiling_refuses_without_counting() {
        let (backend, _) = manual_backend();
        let window = Duration::from_secs(60);

        assert!(matches!(
            backend.increment_window("c", window, Some(2)).await.unwrap(),
            Increment::Counted(_)
        ));
        assert!(matches!(
            backend.increment_window("c", window, Some(2)).await.unwrap(),
            Increment::Counted(_)
        ));
        let refused = backend.increment_window("c", window, Some(2)).await.unwrap();
        assert!(matches!(refused, Increment::Refused(_)));
        assert_eq!(refused.snapshot().attempts, 2);
        assert_eq!(backend.window("c", window).await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_zero_ceiling_always_refuses() {
        let (backend, _) = manual_backend();
        let result = backend
            .increment_window("c", Duration::from_secs(5), Some(0))
            .await
            .unwrap();
        assert!(matches!(result, Increment::Refused(_)));
        assert_eq!(backend.window("c", Duration::from_secs(5)).await.unwrap(), None);
    }
}
