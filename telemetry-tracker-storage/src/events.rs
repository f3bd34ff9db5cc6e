use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use telemetry_tracker_core::{Event, EventStore, StoreError};
use tracing::Instrument;

use crate::postgres::{create_pool_with_config, PostgresConfig};

pub(crate) const INSERT_EVENT: &str =
    "INSERT INTO events (event_type, timestamp, data) VALUES ($1, $2, $3)";

/// [`EventStore`] backed by the `events` table.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgEventStore {
    pub fn new(pool: PgPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    /// Open a pool, check connectivity and wrap it in a store.
    pub async fn connect(config: &PostgresConfig) -> anyhow::Result<Self> {
        let pool = create_pool_with_config(config).await?;
        Ok(Self::new(pool, config.query_timeout()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Wait for checked-out connections to be returned and close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL connection pool closed");
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn store(&self, event: &Event) -> Result<(), StoreError> {
        let span = tracing::info_span!(
            "db_query",
            otel.kind = "client",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.sql.table = "events",
        );

        async {
            let query = sqlx::query(INSERT_EVENT)
                .bind(&event.event_type)
                .bind(event.normalized_timestamp())
                .bind(&event.data)
                .execute(&self.pool);

            let result = tokio::time::timeout(self.query_timeout, query)
                .await
                .map_err(|_| StoreError::Timeout(self.query_timeout))??;

            check_rows_affected(result.rows_affected())
        }
        .instrument(span)
        .await
    }
}

fn check_rows_affected(rows: u64) -> Result<(), StoreError> {
    if rows == 1 {
        Ok(())
    } else {
        Err(StoreError::UnexpectedRowCount(rows))
    }
}
