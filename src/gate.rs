//! The request gate decides, for every outbound call, whether it is answered
//! from cache, refused by the client's rate limit, or dispatched and recorded.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    backend::{MemoryBackend, StorageBackend},
    client::{Client, Method, Params},
    config::{ClientSettings, GateConfig, StorageFailurePolicy},
    credits::ScrapeOptions,
    error::{GateError, Result},
    fingerprint::RequestIdentity,
    limiter::{Decision, LimitState, RateLimiter, RateWindow},
    metrics::Metrics,
    redis::{RedisBackend, RedisClientPool},
    store::{CacheAttributes, CacheEntry, ResponseStore},
    transport::{ReqwestTransport, Transport, TransportResponse},
    utils::TimeSource,
};

/// Per-call options. The defaults are a cached GET against the client's version.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub method: Method,
    /// API version; `None` uses the client's own
    pub version: Option<String>,
    pub attributes: CacheAttributes,
    /// `false` bypasses the cache for this call, both lookup and storage
    pub cache: bool,
    /// Overrides the client's cache TTL for the stored response
    pub ttl: Option<Duration>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            method: Method::Get,
            version: None,
            attributes: CacheAttributes::default(),
            cache: true,
            ttl: None,
        }
    }
}

impl CallOptions {
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn attributes(mut self, attributes: CacheAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.cache = false;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Outcome of a gated call
#[derive(Debug, Clone)]
pub struct CallResult {
    pub response: TransportResponse,
    pub from_cache: bool,
    pub elapsed: Duration,
    /// Credits of the call as priced when it was dispatched
    pub cost: Option<f64>,
    pub fingerprint: String,
}

/// What `clear_cache` drops
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    Key(String),
    Client(String),
    All,
}

struct RegisteredClient {
    client: Arc<dyn Client>,
    settings: ClientSettings,
    limiter: Option<RateLimiter>,
}

impl RegisteredClient {
    /// Client pricing first, then the credit table from settings
    fn cost(&self, endpoint: &str, params: &Params) -> Result<Option<f64>> {
        if let Some(cost) = self.client.cost(endpoint, params)? {
            return Ok(Some(cost));
        }
        match &self.settings.credits {
            Some(table) => Ok(Some(ScrapeOptions::from_params(params)?.credits(table)?)),
            None => Ok(None),
        }
    }
}

/// Orchestrates cache lookup, rate limiting, dispatch and recording
pub struct RequestGate {
    clients: RwLock<HashMap<String, Arc<RegisteredClient>>>,
    backend: Arc<dyn StorageBackend>,
    store: ResponseStore,
    transport: Arc<dyn Transport>,
    caching_enabled: AtomicBool,
    failure_policy: StorageFailurePolicy,
    key_prefix: String,
    time_source: TimeSource,
    metrics: Arc<Metrics>,
}

impl RequestGate {
    /// Create a gate with caching on, fail-open storage and no key prefix
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        transport: Arc<dyn Transport>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let time_source = TimeSource::new();
        Self {
            clients: RwLock::new(HashMap::new()),
            store: ResponseStore::new(backend.clone(), "", time_source.clone()),
            backend,
            transport,
            caching_enabled: AtomicBool::new(true),
            failure_policy: StorageFailurePolicy::FailOpen,
            key_prefix: String::new(),
            time_source,
            metrics,
        }
    }

    fn rebuild_store(&mut self) {
        self.store = ResponseStore::new(
            self.backend.clone(),
            self.key_prefix.clone(),
            self.time_source.clone(),
        );
    }

    /// Must be set before clients are registered
    pub fn with_time_source(mut self, time_source: TimeSource) -> Self {
        self.time_source = time_source;
        self.rebuild_store();
        self
    }

    /// Must be set before clients are registered
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self.rebuild_store();
        self
    }

    pub fn with_failure_policy(mut self, policy: StorageFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Build a gate and register `clients` with their configured policies.
    ///
    /// Uses Redis when configured, otherwise an in-process backend. Without an
    /// explicit transport a `reqwest` one is created with the configured timeout.
    pub async fn from_config(
        config: &GateConfig,
        clients: Vec<Arc<dyn Client>>,
        transport: Option<Arc<dyn Transport>>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        config.validate()?;

        let backend: Arc<dyn StorageBackend> = match &config.redis {
            Some(redis) => {
                let pool = match redis.counters_config() {
                    Some(counters) => {
                        RedisClientPool::new_dual(redis.primary_config(), counters).await?
                    }
                    None => RedisClientPool::new_single(redis.primary_config()).await?,
                };
                Arc::new(RedisBackend::new(pool))
            }
            None => Arc::new(MemoryBackend::new(config.local_cache_size)),
        };

        let transport: Arc<dyn Transport> = match transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(config.transport_timeout())?),
        };

        let gate = Self::new(backend, transport, metrics)
            .with_key_prefix(config.cache_key_prefix.clone())
            .with_failure_policy(config.storage_failure_policy);
        gate.set_caching_enabled(config.caching_enabled);

        for client in clients {
            let settings = config
                .client(client.name())
                .cloned()
                .unwrap_or_else(|| ClientSettings::new(client.name()));
            gate.register_client(client, settings).await?;
        }

        info!(
            "Request gate ready with {} client(s), caching {}",
            gate.clients.read().await.len(),
            if config.caching_enabled { "on" } else { "off" }
        );
        Ok(gate)
    }

    /// Register (or replace) a client under its own name
    pub async fn register_client(&self, client: Arc<dyn Client>, settings: ClientSettings) -> Result<()> {
        settings.validate()?;
        if settings.name != client.name() {
            return Err(GateError::Config(format!(
                "Settings for {} cannot be applied to client {}",
                settings.name,
                client.name()
            )));
        }

        let limiter = settings.rate_limit_max_attempts.map(|max_attempts| {
            RateLimiter::new(
                client.name(),
                max_attempts,
                settings.decay(),
                self.backend.clone(),
                &self.key_prefix,
                self.time_source.clone(),
            )
        });

        debug!(
            "Registering client {} (ttl: {:?}, limit: {:?}/{}s)",
            client.name(),
            settings.cache_ttl_seconds,
            settings.rate_limit_max_attempts,
            settings.rate_limit_decay_seconds
        );

        let mut clients = self.clients.write().await;
        clients.insert(
            client.name().to_string(),
            Arc::new(RegisteredClient {
                client,
                settings,
                limiter,
            }),
        );
        Ok(())
    }

    /// Remove a client. Its cached responses and counters are left in place.
    pub async fn remove_client(&self, name: &str) -> bool {
        self.clients.write().await.remove(name).is_some()
    }

    async fn registered(&self, name: &str) -> Result<Arc<RegisteredClient>> {
        self.clients
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| GateError::ClientNotFound(name.to_string()))
    }

    pub fn set_caching_enabled(&self, enabled: bool) {
        self.caching_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn caching_enabled(&self) -> bool {
        self.caching_enabled.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn store(&self) -> &ResponseStore {
        &self.store
    }

    /// Apply the storage failure policy. `Ok` means carry on as if nothing was stored.
    fn absorb_storage_error(&self, operation: &str, err: GateError) -> Result<()> {
        if !err.is_storage() {
            return Err(err);
        }
        self.metrics.record_storage_error(operation);
        match self.failure_policy {
            StorageFailurePolicy::FailOpen => {
                warn!("Storage failure during {} ignored (fail open): {}", operation, err);
                Ok(())
            }
            StorageFailurePolicy::FailClosed => {
                warn!("Storage failure during {} rejected the call: {}", operation, err);
                Err(err)
            }
        }
    }

    async fn lookup(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        match self.store.get(fingerprint).await {
            Ok(entry) => Ok(entry),
            Err(e) => self.absorb_storage_error("cache_get", e).map(|_| None),
        }
    }

    async fn acquire(&self, limiter: &RateLimiter) -> Result<()> {
        let decision = match limiter.acquire().await {
            Ok(decision) => decision,
            Err(e) => {
                self.absorb_storage_error("rate_limit", e)?;
                return Ok(());
            }
        };

        match decision {
            Decision::Allowed { remaining } => {
                debug!(
                    "Client {} allowed, {} attempt(s) left in window",
                    limiter.client_name(),
                    remaining
                );
                Ok(())
            }
            Decision::Denied { retry_after } => {
                self.metrics.record_rate_limited(limiter.client_name());
                info!(
                    "Client {} rate limited, retry after {}s",
                    limiter.client_name(),
                    retry_after.as_secs()
                );
                Err(GateError::RateLimitExceeded {
                    client: limiter.client_name().to_string(),
                    retry_after,
                })
            }
        }
    }

    /// Run one call through the gate.
    ///
    /// Invalid parameters fail before anything else. A cache hit returns without
    /// touching the rate limit. On a miss one attempt is counted atomically before
    /// dispatch; a denied call is neither dispatched nor counted. Any HTTP response,
    /// error statuses included, is stored unless caching is off. Transport failures
    /// are returned as errors and never stored, but still used their attempt.
    pub async fn execute(
        &self,
        client_name: &str,
        endpoint: &str,
        params: Option<&Params>,
        options: &CallOptions,
    ) -> Result<CallResult> {
        let started = Instant::now();
        let registered = self.registered(client_name).await?;
        self.metrics.record_total_request(client_name);

        let empty = Params::new();
        let call_params = params.unwrap_or(&empty);
        let request = registered
            .client
            .build_request(endpoint, call_params, options.method)?;
        let cost = registered.cost(endpoint, call_params)?;

        let version = options
            .version
            .clone()
            .unwrap_or_else(|| registered.client.version().to_string());
        let fingerprint = RequestIdentity {
            client_name,
            endpoint,
            params,
            method: options.method,
            version: &version,
        }
        .fingerprint();

        let use_cache = options.cache && self.caching_enabled();
        if use_cache {
            if let Some(entry) = self.lookup(&fingerprint).await? {
                debug!("Cache HIT: {}", fingerprint);
                self.metrics.record_cache_hit(client_name);
                return Ok(CallResult {
                    response: entry.response(),
                    from_cache: true,
                    elapsed: started.elapsed(),
                    cost: entry.cost,
                    fingerprint,
                });
            }
            debug!("Cache MISS: {}", fingerprint);
            self.metrics.record_cache_miss(client_name);
        }

        if let Some(limiter) = &registered.limiter {
            self.acquire(limiter).await?;
        }

        let dispatch_started = Instant::now();
        let outcome = self.transport.send(&request).await;
        let elapsed = dispatch_started.elapsed();

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                self.metrics
                    .record_transport_error(client_name, elapsed.as_secs_f64());
                warn!("Dispatch to {} {} failed: {}", client_name, endpoint, e);
                return Err(e.into());
            }
        };

        self.metrics
            .record_dispatch(client_name, response.status_class(), elapsed.as_secs_f64());
        if let Some(cost) = cost {
            self.metrics.record_credits(client_name, cost);
        }
        debug!(
            "Dispatched {} {} -> {} in {}ms",
            client_name,
            endpoint,
            response.status_code,
            elapsed.as_millis()
        );

        if use_cache {
            let entry = CacheEntry {
                key: fingerprint.clone(),
                client_name: client_name.to_string(),
                endpoint: endpoint.to_string(),
                version,
                method: options.method,
                status_code: response.status_code,
                headers: response.headers.clone(),
                body: response.body.clone(),
                cost,
                attributes: options.attributes.clone(),
                created_at: self.time_source.utc_now(),
                expires_at: None,
            };
            let ttl = options.ttl.or_else(|| registered.settings.cache_ttl());
            if let Err(e) = self.store.put(entry, ttl).await {
                self.absorb_storage_error("cache_put", e)?;
            }
        }

        Ok(CallResult {
            response,
            from_cache: false,
            elapsed,
            cost,
            fingerprint,
        })
    }

    /// Drop cached responses in `scope`, returning how many were removed
    pub async fn clear_cache(&self, scope: CacheScope) -> Result<u64> {
        let removed = match &scope {
            CacheScope::Key(key) => u64::from(self.store.clear(key).await?),
            CacheScope::Client(client) => self.store.clear_all(Some(client)).await?,
            CacheScope::All => self.store.clear_all(None).await?,
        };
        info!("Cleared cache ({:?})", scope);
        Ok(removed)
    }

    /// Reset a client's rate limit window. Unlimited clients have nothing to reset.
    pub async fn clear_rate_limit(&self, client_name: &str) -> Result<()> {
        let registered = self.registered(client_name).await?;
        if let Some(limiter) = &registered.limiter {
            limiter.clear().await?;
            info!("Cleared rate limit window for {}", client_name);
        }
        Ok(())
    }

    /// The client's open window, if it is limited and has one
    pub async fn rate_limit_window(&self, client_name: &str) -> Result<Option<RateWindow>> {
        let registered = self.registered(client_name).await?;
        match &registered.limiter {
            Some(limiter) => limiter.window().await,
            None => Ok(None),
        }
    }

    pub async fn rate_limit_state(&self, client_name: &str) -> Result<LimitState> {
        let registered = self.registered(client_name).await?;
        match &registered.limiter {
            Some(limiter) => limiter.state().await,
            None => Ok(LimitState::WithinLimit),
        }
    }

    /// Health check for the storage backend
    pub async fn health_check(&self) -> Result<()> {
        self.backend.health_check().await
    }
}
