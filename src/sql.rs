//! Relational backend: one row per metric in a `gauges` or `counters` table.

use std::{collections::BTreeMap, str::FromStr, time::Duration};

use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    Connection, SqliteConnection,
};
use tracing::{info, instrument, warn};

use crate::{
    error::{Result, StorageError},
    metric::{merge, Metric, MetricId, MetricKey, MetricKind, MetricValue},
    storage::Storage,
};

/// Waits before each connection attempt.
pub const CONNECT_BACKOFF: [Duration; 4] = [
    Duration::from_secs(0),
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
];

/// Takes the database write lock when the transaction opens, so concurrent read-then-write
/// upserts queue on the busy timeout instead of failing to upgrade a read lock.
const BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

#[derive(Debug, Clone)]
pub struct SqlStorage {
    pool: SqlitePool,
}
impl SqlStorage {
    /// Connects to `dsn` and creates the metric tables if they are absent.
    ///
    /// Connection-level failures are retried on [`CONNECT_BACKOFF`]; anything else fails at once.
    #[instrument(skip(dsn))]
    pub async fn connect(dsn: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)?.create_if_missing(true);
        let mut last_err = None;
        for (attempt, wait) in CONNECT_BACKOFF.iter().enumerate() {
            tokio::time::sleep(*wait).await;
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options.clone())
                .await;
            match pool {
                Ok(pool) => return Self::bootstrap(pool).await,
                Err(e @ (sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)) => {
                    warn!(attempt, error = %e, "database connection failed");
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err.unwrap_or(sqlx::Error::PoolTimedOut).into())
    }

    /// A private in-memory database, kept alive on a single connection.
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::bootstrap(pool).await
    }

    async fn bootstrap(pool: SqlitePool) -> Result<Self> {
        let mut tx = pool.begin().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gauges (
                id TEXT PRIMARY KEY,
                value DOUBLE PRECISION NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS counters (
                id TEXT PRIMARY KEY,
                delta BIGINT NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!("metric tables ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn current(
    conn: &mut SqliteConnection,
    id: &str,
    kind: MetricKind,
) -> Result<Option<MetricValue>> {
    let value = match kind {
        MetricKind::Gauge => sqlx::query_scalar::<_, f64>("SELECT value FROM gauges WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .map(MetricValue::Gauge),
        MetricKind::Counter => {
            sqlx::query_scalar::<_, i64>("SELECT delta FROM counters WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?
                .map(MetricValue::Counter)
        }
    };
    Ok(value)
}

/// Read-then-write; callers run it inside a [`BEGIN_WRITE`] transaction.
async fn apply(conn: &mut SqliteConnection, metric: Metric) -> Result<Metric> {
    let existing = current(&mut *conn, &metric.id, metric.kind()).await?;
    let merged = merge(existing, metric.value);
    match merged {
        MetricValue::Gauge(value) => {
            sqlx::query(
                "INSERT INTO gauges (id, value) VALUES (?, ?) \
                 ON CONFLICT (id) DO UPDATE SET value = excluded.value",
            )
            .bind(&metric.id)
            .bind(value)
            .execute(&mut *conn)
            .await?;
        }
        MetricValue::Counter(delta) => {
            sqlx::query(
                "INSERT INTO counters (id, delta) VALUES (?, ?) \
                 ON CONFLICT (id) DO UPDATE SET delta = excluded.delta",
            )
            .bind(&metric.id)
            .bind(delta)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(Metric {
        id: metric.id,
        value: merged,
    })
}

#[async_trait]
impl Storage for SqlStorage {
    async fn upsert(&self, metric: Metric) -> Result<Metric> {
        let mut tx = self.pool.begin_with(BEGIN_WRITE).await?;
        let stored = apply(&mut tx, metric).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn upsert_batch(&self, metrics: Vec<Metric>) -> Result<Vec<Metric>> {
        // dropping the transaction on error or cancellation rolls it back
        let mut tx = self.pool.begin_with(BEGIN_WRITE).await?;
        let mut stored = Vec::with_capacity(metrics.len());
        for metric in metrics {
            stored.push(apply(&mut tx, metric).await?);
        }
        tx.commit().await?;
        Ok(stored)
    }

    async fn get(&self, key: &MetricKey) -> Result<Metric> {
        let mut conn = self.pool.acquire().await?;
        let value = current(&mut conn, &key.id, key.kind)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                id: key.id.clone(),
                kind: key.kind,
            })?;
        Ok(Metric {
            id: key.id.clone(),
            value,
        })
    }

    async fn list_gauges(&self) -> Result<BTreeMap<MetricId, f64>> {
        let rows = sqlx::query_as::<_, (String, f64)>("SELECT id, value FROM gauges")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn list_counters(&self) -> Result<BTreeMap<MetricId, i64>> {
        let rows = sqlx::query_as::<_, (String, i64)>("SELECT id, delta FROM counters")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        conn.ping().await?;
        Ok(())
    }
}
