//! Database connection pool configuration
//!
//! Pool size follows the batch's worker count: each in-flight game commit
//! holds one connection, plus headroom for the checkpoint and audit reads.

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Connections kept beyond one per worker
const HEADROOM_CONNECTIONS: u32 = 2;

#[derive(Clone, Debug, PartialEq)]
pub struct DbPoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// Maximum lifetime of a connection
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for DbPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            max_lifetime: Duration::from_secs(1800), // 30 minutes
            idle_timeout: Duration::from_secs(300),  // 5 minutes
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl DbPoolConfig {
    /// Sized for a batch running `max_workers` units at once
    pub fn for_workers(max_workers: usize) -> Self {
        let max_connections = (max_workers as u32).saturating_add(HEADROOM_CONNECTIONS);
        Self {
            max_connections,
            min_connections: max_connections.min(1),
            ..Default::default()
        }
    }

    /// Override fields from `DB_POOL_*` environment variables
    pub fn from_env(defaults: Self) -> Self {
        let read = |key: &str| env::var(key).ok().and_then(|v| v.parse::<u64>().ok());
        Self {
            max_connections: read("DB_POOL_MAX_CONNECTIONS")
                .map(|v| v as u32)
                .unwrap_or(defaults.max_connections),
            min_connections: read("DB_POOL_MIN_CONNECTIONS")
                .map(|v| v as u32)
                .unwrap_or(defaults.min_connections),
            max_lifetime: read("DB_POOL_MAX_LIFETIME_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_lifetime),
            idle_timeout: read("DB_POOL_IDLE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            acquire_timeout: read("DB_POOL_ACQUIRE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
        }
    }
}

/// Create a PostgreSQL connection pool
pub async fn create_pool(database_url: &str, config: &DbPoolConfig) -> Result<PgPool> {
    info!(
        "Creating database pool: max={}, min={}, acquire_timeout={}s",
        config.max_connections,
        config.min_connections,
        config.acquire_timeout.as_secs()
    );

    let connect_opts =
        PgConnectOptions::from_str(database_url).context("Failed to parse database URL")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(connect_opts)
        .await
        .context("Failed to create database pool")?;

    Ok(pool)
}
