use prometheus::{CounterVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the request gate
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Gate metrics
    total_requests: IntCounterVec,
    cache_hits: IntCounterVec,
    cache_misses: IntCounterVec,
    rate_limited_requests: IntCounterVec,

    // Dispatch metrics
    dispatches: IntCounterVec,
    transport_errors: IntCounterVec,
    dispatch_duration: HistogramVec,
    credits_consumed: CounterVec,

    // Storage metrics
    storage_errors: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let total_requests = IntCounterVec::new(
            Opts::new("apigate_requests_total", "Total number of gated API calls"),
            &["client"],
        )?;

        let cache_hits = IntCounterVec::new(
            Opts::new("apigate_cache_hits_total", "Calls answered from the response cache"),
            &["client"],
        )?;

        let cache_misses = IntCounterVec::new(
            Opts::new("apigate_cache_misses_total", "Calls not found in the response cache"),
            &["client"],
        )?;

        let rate_limited_requests = IntCounterVec::new(
            Opts::new(
                "apigate_rate_limited_total",
                "Calls rejected because the client window was full",
            ),
            &["client"],
        )?;

        let dispatches = IntCounterVec::new(
            Opts::new("apigate_dispatches_total", "Calls sent to the remote API"),
            &["client", "status_class"],
        )?;

        let transport_errors = IntCounterVec::new(
            Opts::new(
                "apigate_transport_errors_total",
                "Dispatches that failed below the HTTP layer",
            ),
            &["client"],
        )?;

        let dispatch_duration = HistogramVec::new(
            HistogramOpts::new(
                "apigate_dispatch_duration_seconds",
                "Duration of remote API calls in seconds",
            ),
            &["client"],
        )?;

        let credits_consumed = CounterVec::new(
            Opts::new(
                "apigate_credits_consumed_total",
                "Provider credits spent on dispatched calls",
            ),
            &["client"],
        )?;

        let storage_errors = IntCounterVec::new(
            Opts::new(
                "apigate_storage_errors_total",
                "Cache or rate limit storage failures by operation",
            ),
            &["operation"],
        )?;

        registry.register(Box::new(total_requests.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(rate_limited_requests.clone()))?;
        registry.register(Box::new(dispatches.clone()))?;
        registry.register(Box::new(transport_errors.clone()))?;
        registry.register(Box::new(dispatch_duration.clone()))?;
        registry.register(Box::new(credits_consumed.clone()))?;
        registry.register(Box::new(storage_errors.clone()))?;

        Ok(Self {
            registry,
            total_requests,
            cache_hits,
            cache_misses,
            rate_limited_requests,
            dispatches,
            transport_errors,
            dispatch_duration,
            credits_consumed,
            storage_errors,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_total_request(&self, client: &str) {
        self.total_requests.with_label_values(&[client]).inc();
    }

    pub fn record_cache_hit(&self, client: &str) {
        self.cache_hits.with_label_values(&[client]).inc();
    }

    pub fn record_cache_miss(&self, client: &str) {
        self.cache_misses.with_label_values(&[client]).inc();
    }

    pub fn record_rate_limited(&self, client: &str) {
        self.rate_limited_requests.with_label_values(&[client]).inc();
    }

    /// Record a completed dispatch and its duration
    pub fn record_dispatch(&self, client: &str, status_class: &str, duration_seconds: f64) {
        self.dispatches
            .with_label_values(&[client, status_class])
            .inc();
        self.dispatch_duration
            .with_label_values(&[client])
            .observe(duration_seconds);
    }

    pub fn record_transport_error(&self, client: &str, duration_seconds: f64) {
        self.transport_errors.with_label_values(&[client]).inc();
        self.dispatch_duration
            .with_label_values(&[client])
            .observe(duration_seconds);
    }

    pub fn record_credits(&self, client: &str, credits: f64) {
        if credits > 0.0 {
            self.credits_consumed.with_label_values(&[client]).inc_by(credits);
        }
    }

    pub fn record_storage_error(&self, operation: &str) {
        self.storage_errors.with_label_values(&[operation]).inc();
    }

    pub fn cache_hits(&self, client: &str) -> u64 {
        self.cache_hits.with_label_values(&[client]).get()
    }

    pub fn dispatches(&self, client: &str, status_class: &str) -> u64 {
        self.dispatches.with_label_values(&[client, status_class]).get()
    }

    pub fn credits_consumed(&self, client: &str) -> f64 {
        self.credits_consumed.with_label_values(&[client]).get()
    }

    pub fn storage_errors(&self, operation: &str) -> u64 {
        self.storage_errors.with_label_values(&[operation]).get()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
