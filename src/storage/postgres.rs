//! Relational backend (PostgreSQL)
//!
//! One table holding both kinds, unique on `(id, type)`. Counter writes
//! accumulate inside the database with an upsert, so concurrent single-record
//! writes to one id never lose an increment.

use super::repository::{Repository, StorageError};
use crate::metric::{Metric, MetricValue};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_TABLE: &str = "metric";

const NUMERIC_OUT_OF_RANGE: &str = "22003";

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => StorageError::Malformed(err.to_string()),
            other => StorageError::Unavailable(other.to_string()),
        }
    }
}

fn counter_error(err: sqlx::Error, id: &str) -> StorageError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(NUMERIC_OUT_OF_RANGE) {
            return StorageError::Overflow { id: id.to_string() };
        }
    }
    err.into()
}

/// A table name is spliced into SQL, so only plain identifiers are accepted
pub fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63
}

#[derive(Debug)]
struct Queries {
    create: String,
    upsert_gauge: String,
    upsert_counter: String,
    select_gauge: String,
    select_counter: String,
    all_gauges: String,
    all_counters: String,
}

impl Queries {
    fn new(table: &str) -> Self {
        Self {
            create: format!(
                "create table if not exists {table} (
                    id text not null,
                    type text not null,
                    value double precision,
                    delta bigint,
                    constraint {table}_pk unique (id, type)
                )"
            ),
            upsert_gauge: format!(
                "insert into {table} (id, type, value) values ($1, 'gauge', $2)
                 on conflict (id, type) do update set value = excluded.value"
            ),
            upsert_counter: format!(
                "insert into {table} (id, type, delta) values ($1, 'counter', $2)
                 on conflict (id, type) do update set delta = {table}.delta + excluded.delta"
            ),
            select_gauge: format!("select value from {table} where id = $1 and type = 'gauge'"),
            select_counter: format!("select delta from {table} where id = $1 and type = 'counter'"),
            all_gauges: format!("select id, value from {table} where type = 'gauge' order by id"),
            all_counters: format!("select id, delta from {table} where type = 'counter' order by id"),
        }
    }
}

pub struct PostgresRepository {
    pool: PgPool,
    table: String,
    queries: Queries,
}

impl PostgresRepository {
    /// Connect, retrying per `retry`, then make sure the table exists
    #[instrument(skip(dsn, retry))]
    pub async fn connect(dsn: &str, table: &str, retry: &RetryPolicy) -> Result<Self, StorageError> {
        if !is_valid_table_name(table) {
            return Err(StorageError::Unavailable(format!(
                "invalid table name {:?}",
                table
            )));
        }

        let options = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5));

        let mut attempt = 0;
        let pool = loop {
            match options.clone().connect(dsn).await {
                Ok(pool) => break pool,
                Err(e) => match retry.wait_before(attempt) {
                    Some(wait) => {
                        warn!(error = %e, attempt = attempt + 1, wait = ?wait, "Database connection failed, retrying");
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                    }
                    None => return Err(e.into()),
                },
            }
        };

        let repository = Self::with_pool(pool, table);
        repository.migrate().await?;
        info!(table = %repository.table, "Connected to database");
        Ok(repository)
    }

    /// Wrap an existing pool; the caller is responsible for [`migrate`](Self::migrate)
    pub fn with_pool(pool: PgPool, table: &str) -> Self {
        Self {
            pool,
            table: table.to_string(),
            queries: Queries::new(table),
        }
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(&self.queries.create).execute(&self.pool).await?;
        Ok(())
    }

    /// Health probe, retried with the same backoff as connection attempts
    pub async fn ping(&self, retry: &RetryPolicy) -> Result<(), StorageError> {
        let mut attempt = 0;
        loop {
            match sqlx::query("select 1").execute(&self.pool).await {
                Ok(_) => return Ok(()),
                Err(e) => match retry.wait_before(attempt) {
                    Some(wait) => {
                        debug!(error = %e, attempt = attempt + 1, "Database ping failed, retrying");
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                    }
                    None => return Err(e.into()),
                },
            }
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn apply(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: &str,
        value: MetricValue,
    ) -> Result<(), StorageError> {
        match value {
            MetricValue::Gauge(v) => {
                sqlx::query(&self.queries.upsert_gauge)
                    .bind(id)
                    .bind(v)
                    .execute(&mut **tx)
                    .await?;
            }
            MetricValue::Counter(d) => {
                sqlx::query(&self.queries.upsert_counter)
                    .bind(id)
                    .bind(d)
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| counter_error(e, id))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    #[instrument(skip(self))]
    async fn add_gauge_value(&self, id: &str, value: f64) -> Result<(), StorageError> {
        sqlx::query(&self.queries.upsert_gauge)
            .bind(id)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn add_counter_value(&self, id: &str, delta: i64) -> Result<(), StorageError> {
        sqlx::query(&self.queries.upsert_counter)
            .bind(id)
            .bind(delta)
            .execute(&self.pool)
            .await
            .map_err(|e| counter_error(e, id))?;
        Ok(())
    }

    /// One transaction for the whole batch; any failure rolls it back
    #[instrument(skip(self, metrics), fields(count = metrics.len()))]
    async fn add_values(&self, metrics: &[Metric]) -> Result<(), StorageError> {
        let values = metrics
            .iter()
            .map(|m| m.validate().map(|v| (m.id.as_str(), v)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self.pool.begin().await?;
        for (id, value) in values {
            self.apply(&mut tx, id, value).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_gauge_value(&self, id: &str) -> Result<Option<f64>, StorageError> {
        let row = sqlx::query(&self.queries.select_gauge)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            row.try_get::<Option<f64>, _>("value")?
                .ok_or_else(|| StorageError::Malformed(format!("gauge {:?} has no value", id)))
        })
        .transpose()
    }

    async fn get_counter_value(&self, id: &str) -> Result<Option<i64>, StorageError> {
        let row = sqlx::query(&self.queries.select_counter)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            row.try_get::<Option<i64>, _>("delta")?
                .ok_or_else(|| StorageError::Malformed(format!("counter {:?} has no delta", id)))
        })
        .transpose()
    }

    async fn gauges(&self) -> Result<BTreeMap<String, f64>, StorageError> {
        let rows = sqlx::query(&self.queries.all_gauges)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let value = row
                    .try_get::<Option<f64>, _>("value")?
                    .ok_or_else(|| StorageError::Malformed(format!("gauge {:?} has no value", id)))?;
                Ok((id, value))
            })
            .collect()
    }

    async fn counters(&self) -> Result<BTreeMap<String, i64>, StorageError> {
        let rows = sqlx::query(&self.queries.all_counters)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let delta = row
                    .try_get::<Option<i64>, _>("delta")?
                    .ok_or_else(|| StorageError::Malformed(format!("counter {:?} has no delta", id)))?;
                Ok((id, delta))
            })
            .collect()
    }
}
