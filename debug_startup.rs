// Startup check for a gate configuration: storage connectivity and client policies.
// Run this with: CONFIG_PATH=gate.yaml cargo run --bin debug_startup

use anyhow::Result;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_apigate::{
    backend::{MemoryBackend, StorageBackend},
    config::{load_config_layered, GateConfig, RedisSettings},
    redis::{RedisBackend, RedisClientPool},
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_apigate=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting gate startup check...");
    let start_time = Instant::now();

    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = load_config_layered(config_path.as_deref())?;
    info!(
        "Configuration loaded from {} ({} client(s))",
        config_path.as_deref().unwrap_or("environment only"),
        config.clients.len()
    );

    let backend = connect_backend(&config).await?;
    backend.health_check().await?;
    info!("Storage health check passed");

    log_client_policies(&config);

    info!("Startup check completed in {:?}", start_time.elapsed());
    Ok(())
}

async fn connect_backend(config: &GateConfig) -> Result<Arc<dyn StorageBackend>> {
    let Some(redis) = &config.redis else {
        warn!(
            "No Redis configured, using in-process storage ({} entries); cache and limits are not shared",
            config.local_cache_size
        );
        return Ok(Arc::new(MemoryBackend::new(config.local_cache_size)));
    };

    let pool = connect_redis(redis).await?;
    Ok(Arc::new(RedisBackend::new(pool)))
}

async fn connect_redis(redis: &RedisSettings) -> Result<RedisClientPool> {
    info!("Connecting to Redis at {}", redis.url);
    let connection_start = Instant::now();

    let pool = async {
        match redis.counters_config() {
            Some(counters) => {
                info!("Rate limit counters on separate Redis at {}", counters.url);
                RedisClientPool::new_dual(redis.primary_config(), counters).await
            }
            None => RedisClientPool::new_single(redis.primary_config()).await,
        }
    };

    match tokio::time::timeout(Duration::from_secs(10), pool).await {
        Ok(Ok(pool)) => {
            info!("Redis pool created in {:?}", connection_start.elapsed());
            Ok(pool)
        }
        Ok(Err(e)) => {
            error!("Redis pool creation failed: {}", e);
            Err(e.into())
        }
        Err(_) => {
            error!("Redis pool creation timed out after 10 seconds");
            Err(anyhow::anyhow!("Redis connection timeout"))
        }
    }
}

fn log_client_policies(config: &GateConfig) {
    if config.clients.is_empty() {
        warn!("No clients configured");
    }
    for client in &config.clients {
        let ttl = client
            .cache_ttl_seconds
            .map_or_else(|| "until cleared".to_string(), |s| format!("{}s", s));
        let limit = client.rate_limit_max_attempts.map_or_else(
            || "unlimited".to_string(),
            |max| format!("{} per {}s", max, client.rate_limit_decay_seconds),
        );
        info!(
            "Client {}: cache {}, rate limit {}, credits {}",
            client.name,
            ttl,
            limit,
            if client.credits.is_some() { "priced" } else { "unpriced" }
        );
    }
    info!(
        "Caching {}, storage failures {:?}",
        if config.caching_enabled { "enabled" } else { "disabled" },
        config.storage_failure_policy
    );
}
