use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use urgent_contracts::filter::FilterSet;
use urgent_contracts::{Incident, IncidentDraft, Operator, PlanBApplied};

mod directory;
mod incidents;
pub mod predicate;

#[derive(Debug)]
pub enum StoreError {
    Timeout,
    Sqlx(sqlx::Error),
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::Sqlx(err) => write!(f, "store sql error: {}", err),
            StoreError::Corrupt(detail) => write!(f, "store row rejected: {}", detail),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Sqlx(value)
    }
}

/// Reads and writes the `urgents` table. Lookups by reference code act on the most recently
/// declared NOK incident for that code.
#[async_trait]
pub trait IncidentRepository: Send + Sync {
    async fn list(&self, filters: &FilterSet) -> Result<Vec<Incident>, StoreError>;

    async fn distinct_machines(&self, filters: &FilterSet) -> Result<Vec<String>, StoreError>;

    async fn get(&self, id: i32) -> Result<Option<Incident>, StoreError>;

    async fn insert(&self, draft: &IncidentDraft) -> Result<i32, StoreError>;

    async fn apply_plan_b(
        &self,
        unico: &str,
        mc_pb: &str,
    ) -> Result<Option<PlanBApplied>, StoreError>;

    async fn resolve(
        &self,
        unico: &str,
        corrector: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Incident>, StoreError>;
}

/// Read-only view of the externally owned user directory.
#[async_trait]
pub trait OperatorDirectory: Send + Sync {
    async fn find_by_credentials(
        &self,
        badge: &str,
        secret: &str,
    ) -> Result<Option<Operator>, StoreError>;
}

/// Read-only view of the externally owned inventory (`wires`).
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Returns the distinct requested codes that do not exist, in request order.
    async fn missing_unicos(&self, unicos: &[String]) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub max_connections: u32,
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            connect_timeout: Duration::from_secs(2),
            query_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: sqlx::PgPool,
    query_timeout: Duration,
}

impl PgStore {
    pub async fn connect(db_url: &str, options: StoreOptions) -> Result<Self, StoreError> {
        let pool = tokio::time::timeout(
            options.connect_timeout,
            PgPoolOptions::new()
                .max_connections(options.max_connections)
                .acquire_timeout(options.query_timeout)
                .connect(db_url),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        tracing::info!(
            max_connections = options.max_connections,
            "urgent store pool connected"
        );
        Ok(Self::from_pool(pool, options.query_timeout))
    }

    pub fn from_pool(pool: sqlx::PgPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let store = Self::connect(db_url, options).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        tracing::info!("urgent store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let value = tokio::time::timeout(self.query_timeout, fut)
            .await
            .map_err(|_| {
                tracing::warn!(
                    timeout_ms = self.query_timeout.as_millis() as u64,
                    "store query timed out"
                );
                StoreError::Timeout
            })??;
        Ok(value)
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
