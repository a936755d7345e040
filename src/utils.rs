use chrono::{DateTime, TimeZone, Utc};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use std::time::Duration;

/// Clock used for cache expiry and rate limit windows.
///
/// The system variant reads the wall clock. The manual variant only moves when
/// [`TimeSource::advance`] is called, which lets window rollover and TTL expiry be
/// exercised without sleeping. Clones share the same manual clock.
#[derive(Debug, Clone, Default)]
pub struct TimeSource {
    manual_millis: Option<Arc<AtomicI64>>,
}

impl TimeSource {
    pub fn new() -> Self {
        Self { manual_millis: None }
    }

    /// A clock frozen at `start` until advanced
    pub fn manual(start: DateTime<Utc>) -> Self {
        Self {
            manual_millis: Some(Arc::new(AtomicI64::new(start.timestamp_millis()))),
        }
    }

    /// Move a manual clock forward. No-op on the system clock.
    pub fn advance(&self, by: Duration) {
        if let Some(millis) = &self.manual_millis {
            millis.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
        }
    }

    pub fn is_manual(&self) -> bool {
        self.manual_millis.is_some()
    }

    /// Get the current time as a DateTime<Utc>
    pub fn utc_now(&self) -> DateTime<Utc> {
        match &self.manual_millis {
            Some(millis) => Utc
                .timestamp_millis_opt(millis.load(Ordering::SeqCst))
                .single()
                .unwrap_or_else(Utc::now),
            None => Utc::now(),
        }
    }

    /// Get the current Unix timestamp in seconds
    pub fn unix_now(&self) -> i64 {
        self.utc_now().timestamp()
    }
}

/// Time left in a window that started at `window_start` and lasts `window`.
///
/// Zero once the window has rolled over.
pub fn calculate_reset(
    window_start: DateTime<Utc>,
    window: Duration,
    time_source: &TimeSource,
) -> Duration {
    let elapsed = time_source
        .utc_now()
        .signed_duration_since(window_start)
        .to_std()
        .unwrap_or(Duration::ZERO);
    window.saturating_sub(elapsed)
}

/// Whether a window starting at `window_start` has rolled over
pub fn window_expired(window_start: DateTime<Utc>, window: Duration, time_source: &TimeSource) -> bool {
    calculate_reset(window_start, window, time_source).is_zero()
}

/// Join storage key segments under an optional prefix
pub fn generate_storage_key(prefix: &str, parts: &[&str]) -> String {
    let mut key_parts: Vec<&str> = Vec::with_capacity(parts.len() + 1);
    if !prefix.is_empty() {
        key_parts.push(prefix);
    }
    key_parts.extend_from_slice(parts);
    key_parts.join(":")
}
