use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tracing::debug;

use crate::{
    backend::{Increment, StorageBackend, WindowSnapshot},
    error::{GateError, Result},
    utils::{generate_storage_key, TimeSource},
};

/// Result of asking whether a client may dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The call may go out. `remaining` counts attempts left in the window.
    Allowed { remaining: u64 },
    /// The window is full until `retry_after` has passed.
    Denied { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Whether a client can still dispatch in its current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitState {
    WithinLimit,
    AtLimit,
}

/// The active fixed window of one client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWindow {
    pub client_name: String,
    pub window_start: DateTime<Utc>,
    pub attempt_count: u64,
    pub max_attempts: u64,
    pub decay_seconds: u64,
}

impl RateWindow {
    pub fn state(&self) -> LimitState {
        if self.attempt_count >= self.max_attempts {
            LimitState::AtLimit
        } else {
            LimitState::WithinLimit
        }
    }

    pub fn remaining(&self) -> u64 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }
}

/// Fixed-window attempt counter for a single client.
///
/// The window opens on the first counted attempt and lasts `decay`. Only window
/// rollover brings a client back under its limit. State lives in the backend so
/// several gates sharing a Redis instance enforce one limit.
pub struct RateLimiter {
    client_name: String,
    max_attempts: u64,
    decay: Duration,
    key: String,
    backend: Arc<dyn StorageBackend>,
    time_source: TimeSource,
}

impl RateLimiter {
    pub fn new(
        client_name: impl Into<String>,
        max_attempts: u64,
        decay: Duration,
        backend: Arc<dyn StorageBackend>,
        key_prefix: &str,
        time_source: TimeSource,
    ) -> Self {
        let client_name = client_name.into();
        let key = generate_storage_key(key_prefix, &["ratelimit", &client_name]);
        Self {
            client_name,
            max_attempts,
            decay,
            key,
            backend,
            time_source,
        }
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn max_attempts(&self) -> u64 {
        self.max_attempts
    }

    pub fn decay(&self) -> Duration {
        self.decay
    }

    fn decide(&self, snapshot: Option<WindowSnapshot>) -> Decision {
        let attempts = snapshot.map_or(0, |s| s.attempts);
        if attempts < self.max_attempts {
            Decision::Allowed {
                remaining: self.max_attempts - attempts,
            }
        } else {
            Decision::Denied {
                retry_after: snapshot.map_or(self.decay, |s| s.resets_in),
            }
        }
    }

    fn to_window(&self, snapshot: WindowSnapshot) -> RateWindow {
        let elapsed = self.decay.saturating_sub(snapshot.resets_in);
        let window_start = self.time_source.utc_now()
            - chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        RateWindow {
            client_name: self.client_name.clone(),
            window_start,
            attempt_count: snapshot.attempts,
            max_attempts: self.max_attempts,
            decay_seconds: self.decay.as_secs(),
        }
    }

    /// Read-only check. A rolled-over window counts as empty but is not reset here.
    pub async fn allow(&self) -> Result<Decision> {
        let snapshot = self.backend.window(&self.key, self.decay).await?;
        Ok(self.decide(snapshot))
    }

    /// Record one dispatched attempt, opening a new window if the last one expired.
    pub async fn increment(&self) -> Result<RateWindow> {
        let snapshot = self
            .backend
            .increment_window(&self.key, self.decay, None)
            .await?
            .snapshot();
        Ok(self.to_window(snapshot))
    }

    /// Check and count in one atomic step.
    ///
    /// A denied call is not counted. This is what the gate uses before dispatch, so
    /// concurrent callers can never exceed `max_attempts` between them.
    pub async fn acquire(&self) -> Result<Decision> {
        match self
            .backend
            .increment_window(&self.key, self.decay, Some(self.max_attempts))
            .await?
        {
            Increment::Counted(snapshot) => Ok(Decision::Allowed {
                remaining: self.max_attempts.saturating_sub(snapshot.attempts),
            }),
            Increment::Refused(snapshot) => {
                debug!(
                    "Client {} at limit ({}/{}), resets in {}s",
                    self.client_name,
                    snapshot.attempts,
                    self.max_attempts,
                    snapshot.resets_in.as_secs()
                );
                Ok(Decision::Denied {
                    retry_after: snapshot.resets_in,
                })
            }
        }
    }

    /// Like [`acquire`](Self::acquire) but a denial becomes `RateLimitExceeded`
    pub async fn acquire_or_err(&self) -> Result<u64> {
        match self.acquire().await? {
            Decision::Allowed { remaining } => Ok(remaining),
            Decision::Denied { retry_after } => Err(GateError::RateLimitExceeded {
                client: self.client_name.clone(),
                retry_after,
            }),
        }
    }

    /// The open window, if any
    pub async fn window(&self) -> Result<Option<RateWindow>> {
        Ok(self
            .backend
            .window(&self.key, self.decay)
            .await?
            .map(|snapshot| self.to_window(snapshot)))
    }

    pub async fn state(&self) -> Result<LimitState> {
        Ok(match self.allow().await? {
            Decision::Allowed { .. } => LimitState::WithinLimit,
            Decision::Denied { .. } => LimitState::AtLimit,
        })
    }

    /// Forget the current window
    pub async fn clear(&self) -> Result<()> {
        self.backend.delete(&self.key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use chrono::TimeZone;

    fn limiter(max_attempts: u64, decay_secs: u64) -> (RateLimiter, TimeSource) {
        let time_source = TimeSource::manual(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap());
        let backend = Arc::new(MemoryBackend::new(100).with_time_source(time_source.clone()));
        (
            RateLimiter::new(
                "scraper",
                max_attempts,
                Duration::from_secs(decay_secs),
                backend,
                "",
                time_source.clone(),
            ),
            time_source,
        )
    }

    #[tokio::test]
    async fn test_fresh_client_is_allowed() {
        let (limiter, _) = limiter(3, 60);
        assert_eq!(limiter.allow().await.unwrap(), Decision::Allowed { remaining: 3 });
        assert_eq!(limiter.state().await.unwrap(), LimitState::WithinLimit);
        assert!(limiter.window().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_allow_does_not_mutate() {
        let (limiter, _) = limiter(3, 60);
        for _ in 0..5 {
            assert!(limiter.allow().await.unwrap().is_allowed());
        }
        assert!(limiter.window().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_increment_reaches_limit() {
        let (limiter, clock) = limiter(3, 60);
        let start = clock.utc_now();

        for expected in 1..=3 {
            let window = limiter.increment().await.unwrap();
            assert_eq!(window.attempt_count, expected);
            assert_eq!(window.window_start, start);
            clock.advance(Duration::from_secs(10));
        }

        assert_eq!(limiter.state().await.unwrap(), LimitState::AtLimit);
        assert_eq!(
            limiter.allow().await.unwrap(),
            Decision::Denied {
                retry_after: Duration::from_secs(30)
            }
        );
    }

    #[tokio::test]
    async fn test_increment_is_unconditional() {
        let (limiter, _) = limiter(1, 60);
        limiter.increment().await.unwrap();
        let window = limiter.increment().await.unwrap();
        assert_eq!(window.attempt_count, 2);
        assert_eq!(window.remaining(), 0);
        assert_eq!(window.state(), LimitState::AtLimit);
    }

    #[tokio::test]
    async fn test_rollover_restores_limit() {
        let (limiter, clock) = limiter(2, 60);
        limiter.increment().await.unwrap();
        limiter.increment().await.unwrap();
        assert!(!limiter.allow().await.unwrap().is_allowed());

        clock.advance(Duration::from_secs(60));
        assert!(limiter.allow().await.unwrap().is_allowed());

        let window = limiter.increment().await.unwrap();
        assert_eq!(window.attempt_count, 1);
        assert_eq!(window.window_start, clock.utc_now());
    }

    #[tokio::test]
    async fn test_acquire_refuses_without_counting() {
        let (limiter, _) = limiter(2, 60);

        assert_eq!(limiter.acquire().await.unwrap(), Decision::Allowed { remaining: 1 });
        assert_eq!(limiter.acquire().await.unwrap(), Decision::Allowed { remaining: 0 });
        assert!(matches!(limiter.acquire().await.unwrap(), Decision::Denied { .. }));
        assert_eq!(limiter.window().await.unwrap().unwrap().attempt_count, 2);

        match limiter.acquire_or_err().await {
            Err(GateError::RateLimitExceeded { client, retry_after }) => {
                assert_eq!(client, "scraper");
                assert_eq!(retry_after, Duration::from_secs(60));
            }
            other => panic!("Expected rate limit error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clear_resets_window() {
        let (limiter, _) = limiter(1, 60);
        limiter.increment().await.unwrap();
        assert_eq!(limiter.state().await.unwrap(), LimitState::AtLimit);

        limiter.clear().await.unwrap();
        assert!(limiter.window().await.unwrap().is_none());
        assert_eq!(limiter.state().await.unwrap(), LimitState::WithinLimit);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_respects_limit() {
        let (limiter, _) = limiter(5, 60);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await.unwrap().is_allowed() })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
        assert_eq!(limiter.window().await.unwrap().unwrap().attempt_count, 5);
    }
}
