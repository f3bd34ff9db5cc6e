use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Configuration for PostgreSQL connection pool
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub max_lifetime_seconds: u64,
    /// Upper bound for the connectivity check run after the pool is created
    pub ping_timeout_seconds: u64,
    /// Upper bound for a single statement issued by a store
    pub query_timeout_seconds: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: 20,
            min_connections: 1,
            acquire_timeout_seconds: 5,
            idle_timeout_seconds: 600,  // 10 minutes
            max_lifetime_seconds: 1800, // 30 minutes
            ping_timeout_seconds: 5,
            query_timeout_seconds: 5,
        }
    }
}

impl PostgresConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_seconds = timeout.as_secs().max(1);
        self
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_seconds)
    }
}

/// Create a PostgreSQL connection pool with custom configuration and verify
/// the server answers within the ping timeout.
pub async fn create_pool_with_config(config: &PostgresConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
        .idle_timeout(Some(Duration::from_secs(config.idle_timeout_seconds)))
        .max_lifetime(Some(Duration::from_secs(config.max_lifetime_seconds)))
        .connect(&config.database_url)
        .await
        .context("failed to open database connection pool")?;

    tokio::time::timeout(config.ping_timeout(), health_check(&pool))
        .await
        .context("database ping timed out")??;

    tracing::info!(
        "PostgreSQL connection pool created (max: {}, min: {})",
        config.max_connections,
        config.min_connections
    );

    Ok(pool)
}

/// Run database migrations
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// Health check for database connection
pub async fn health_check(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;

    tracing::debug!("Database health check passed");
    Ok(())
}

pub fn pool_status(pool: &PgPool) -> PoolStatus {
    let size = pool.size();
    let idle = pool.num_idle();
    PoolStatus {
        size,
        idle,
        active: (size as usize).saturating_sub(idle),
    }
}

#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub size: u32,
    pub idle: usize,
    pub active: usize,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool(size: {}, active: {}, idle: {})",
            self.size, self.active, self.idle
        )
    }
}
