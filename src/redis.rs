use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    backend::{Increment, StorageBackend, WindowSnapshot},
    error::{GateError, Result},
};

/// Fixed-window counter step. Returns `{counted, attempts, resets_in_ms}`.
///
/// A key without a positive PTTL is treated as having no open window. A negative
/// ceiling disables the limit check.
const INCREMENT_WINDOW_SCRIPT: &str = r#"
local ttl = redis.call('PTTL', KEYS[1])
local attempts = 0
if ttl > 0 then
  attempts = tonumber(redis.call('GET', KEYS[1]) or '0')
end
local window = tonumber(ARGV[1])
local ceiling = tonumber(ARGV[2])
if ceiling >= 0 and attempts >= ceiling then
  if ttl <= 0 then ttl = window end
  return {0, attempts, ttl}
end
if attempts == 0 then
  redis.call('SET', KEYS[1], 1, 'PX', window)
  return {1, 1, window}
end
attempts = redis.call('INCR', KEYS[1])
return {1, attempts, ttl}
"#;

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
    pub scan_count: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Some(Duration::from_secs(5)),
            command_timeout: Some(Duration::from_secs(1)),
            scan_count: 500,
        }
    }
}

/// Redis client wrapper for cache and counter operations
#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
    config: RedisConfig,
    increment_script: Script,
}

impl RedisClient {
    /// Create a new Redis client
    pub async fn new(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            GateError::Redis(e)
        })?;

        let connect_timeout = config.connection_timeout.unwrap_or(Duration::from_secs(10));
        let connection = match tokio::time::timeout(connect_timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => {
                info!("Connection manager established successfully");
                conn
            }
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(GateError::Redis(e));
            }
            Err(_) => {
                warn!(
                    "Timeout while creating connection manager ({}s)",
                    connect_timeout.as_secs()
                );
                return Err(GateError::Storage(
                    "Timeout while creating Redis connection manager".to_string(),
                ));
            }
        };

        let redis_client = Self {
            connection,
            config,
            increment_script: Script::new(INCREMENT_WINDOW_SCRIPT),
        };
        redis_client.health_check().await?;

        info!("Redis client initialized successfully");
        Ok(redis_client)
    }

    fn command_timeout(&self) -> Duration {
        self.config.command_timeout.unwrap_or(Duration::from_secs(5))
    }

    /// Run a Redis future under the configured command timeout
    async fn timed<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout(), fut).await {
            Ok(result) => result.map_err(GateError::Redis),
            Err(_) => Err(GateError::Storage(format!(
                "Redis {} timed out after {}ms",
                operation,
                self.command_timeout().as_millis()
            ))),
        }
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        self.timed(
            "GET",
            redis::cmd("GET").arg(key).query_async::<_, Option<Vec<u8>>>(&mut conn),
        )
        .await
    }

    pub async fn set_bytes(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        self.timed("SET", cmd.query_async::<_, ()>(&mut conn)).await
    }

    pub async fn delete(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        self.timed("DEL", redis::cmd("DEL").arg(key).query_async::<_, u64>(&mut conn))
            .await
    }

    /// Delete all keys starting with `prefix` using SCAN so the server is never blocked
    pub async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut removed = 0;

        loop {
            let mut conn = self.connection.clone();
            let (next, keys): (u64, Vec<String>) = self
                .timed(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(self.config.scan_count)
                        .query_async(&mut conn),
                )
                .await?;

            if !keys.is_empty() {
                let mut conn = self.connection.clone();
                let deleted: u64 = self
                    .timed("DEL", redis::cmd("DEL").arg(&keys).query_async(&mut conn))
                    .await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!("Deleted {} keys matching {}", removed, pattern);
        Ok(removed)
    }

    pub async fn window(&self, key: &str) -> Result<Option<WindowSnapshot>> {
        let mut conn = self.connection.clone();
        let (attempts, pttl): (Option<u64>, i64) = self
            .timed(
                "GET/PTTL",
                redis::pipe()
                    .cmd("GET")
                    .arg(key)
                    .cmd("PTTL")
                    .arg(key)
                    .query_async(&mut conn),
            )
            .await?;

        Ok(match attempts {
            Some(attempts) if pttl > 0 => Some(WindowSnapshot {
                attempts,
                resets_in: Duration::from_millis(pttl as u64),
            }),
            _ => None,
        })
    }

    pub async fn increment_window(
        &self,
        key: &str,
        window: Duration,
        ceiling: Option<u64>,
    ) -> Result<Increment> {
        let mut conn = self.connection.clone();
        let window_ms = window.as_millis().max(1) as i64;
        let ceiling = ceiling.map(|c| c as i64).unwrap_or(-1);

        let reply: Vec<i64> = self
            .timed(
                "EVALSHA",
                self.increment_script
                    .key(key)
                    .arg(window_ms)
                    .arg(ceiling)
                    .invoke_async(&mut conn),
            )
            .await?;

        let &[counted, attempts, resets_in_ms] = reply.as_slice() else {
            return Err(GateError::Storage(format!(
                "Unexpected counter script reply: {:?}",
                reply
            )));
        };

        let snapshot = WindowSnapshot {
            attempts: attempts.max(0) as u64,
            resets_in: Duration::from_millis(resets_in_ms.max(0) as u64),
        };
        Ok(if counted == 1 {
            Increment::Counted(snapshot)
        } else {
            Increment::Refused(snapshot)
        })
    }

    /// Check if the connection is healthy
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.timed("PING", redis::cmd("PING").query_async::<_, ()>(&mut conn))
            .await
    }
}

fn escape_glob(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Redis clients for responses and, optionally, a separate instance for counters
#[derive(Clone)]
pub struct RedisClientPool {
    primary_client: RedisClient,
    counter_client: Option<RedisClient>,
}

impl RedisClientPool {
    /// Create a new Redis client pool with primary client only
    pub async fn new_single(config: RedisConfig) -> Result<Self> {
        info!("Creating single Redis client pool...");
        let primary_client = RedisClient::new(config).await?;
        Ok(Self {
            primary_client,
            counter_client: None,
        })
    }

    /// Create a new Redis client pool with a dedicated counter instance
    pub async fn new_dual(primary_config: RedisConfig, counter_config: RedisConfig) -> Result<Self> {
        info!("Creating dual Redis client pool...");
        let primary_client = RedisClient::new(primary_config).await?;
        let counter_client = RedisClient::new(counter_config).await.map_err(|e| {
            warn!("Failed to create counter Redis client: {}", e);
            e
        })?;

        info!("Dual Redis pool created successfully");
        Ok(Self {
            primary_client,
            counter_client: Some(counter_client),
        })
    }

    /// Get the appropriate client for the given operation
    pub fn get_client(&self, for_counters: bool) -> &RedisClient {
        match (&self.counter_client, for_counters) {
            (Some(client), true) => client,
            _ => &self.primary_client,
        }
    }

    /// Health check all clients
    pub async fn health_check(&self) -> Result<()> {
        self.primary_client.health_check().await?;
        if let Some(counter_client) = &self.counter_client {
            counter_client.health_check().await?;
        }
        Ok(())
    }
}

/// [`StorageBackend`] on Redis. TTLs are enforced by Redis itself.
#[derive(Clone)]
pub struct RedisBackend {
    pool: RedisClientPool,
}

impl RedisBackend {
    pub fn new(pool: RedisClientPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StorageBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.pool.get_client(false).get_bytes(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.pool.get_client(false).set_bytes(key, &value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut removed = self.pool.get_client(false).delete(key).await?;
        if self.pool.counter_client.is_some() {
            removed += self.pool.get_client(true).delete(key).await?;
        }
        Ok(removed)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut removed = self.pool.get_client(false).delete_prefix(prefix).await?;
        if self.pool.counter_client.is_some() {
            removed += self.pool.get_client(true).delete_prefix(prefix).await?;
        }
        Ok(removed)
    }

    async fn window(&self, key: &str, _window: Duration) -> Result<Option<WindowSnapshot>> {
        self.pool.get_client(true).window(key).await
    }

    async fn increment_window(
        &self,
        key: &str,
        window: Duration,
        ceiling: Option<u64>,
    ) -> Result<Increment> {
        self.pool
            .get_client(true)
            .increment_window(key, window, ceiling)
            .await
    }

    async fn health_check(&self) -> Result<()> {
        self.pool.health_check().await
    }
}
