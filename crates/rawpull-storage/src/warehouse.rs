//! Idempotent batched upsert of raw vendor rows keyed by `(tenant_id, raw_id)`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use rawpull_core::RawRow;
use serde::Serialize;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid raw table name {0:?}")]
    InvalidTable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("injected sink failure: {0}")]
    Injected(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub inserted: u64,
    pub updated: u64,
}

impl UpsertReport {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }

    fn merge(&mut self, other: UpsertReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
    }
}

#[async_trait]
pub trait RawSink: Send + Sync {
    /// Durably writes every row or fails. Replaying the same rows is a no-op in effect.
    async fn upsert(&self, table: &str, rows: &[RawRow]) -> Result<UpsertReport, SinkError>;
}

/// Accepts `name` or `schema.name`, each part `[a-z_][a-z0-9_]*` and at most 63 bytes.
pub fn validate_table_name(table: &str) -> Result<(), SinkError> {
    let valid_part = |part: &str| {
        !part.is_empty()
            && part.len() <= 63
            && part
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
            && part
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    };
    let parts = table.split('.').collect::<Vec<_>>();
    if parts.len() > 2 || !parts.iter().all(|p| valid_part(p)) {
        return Err(SinkError::InvalidTable(table.to_string()));
    }
    Ok(())
}

/// Collapses rows sharing `(tenant_id, raw_id)`, keeping the last occurrence at the position of
/// the first. Postgres rejects an `ON CONFLICT DO UPDATE` that touches one row twice.
pub fn dedupe_rows(rows: &[RawRow]) -> Vec<&RawRow> {
    let mut position: HashMap<(i64, &str), usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<&RawRow> = Vec::with_capacity(rows.len());
    for row in rows {
        match position.get(&(row.tenant_id, row.raw_id.as_str())) {
            Some(&idx) => out[idx] = row,
            None => {
                position.insert((row.tenant_id, row.raw_id.as_str()), out.len());
                out.push(row);
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct PgRawSink {
    pool: PgPool,
    batch_size: usize,
}

impl PgRawSink {
    pub fn new(pool: PgPool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    /// Creates a raw table with the generic layout if it does not exist yet.
    pub async fn ensure_table(&self, table: &str) -> Result<(), SinkError> {
        validate_table_name(table)?;
        let index_name = format!("{}_extracted_at_idx", table.replace('.', "_"));
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                tenant_id     BIGINT      NOT NULL,
                raw_id        TEXT        NOT NULL,
                data          BYTEA       NOT NULL,
                extracted_at  TIMESTAMPTZ NOT NULL,
                loaded_at     TIMESTAMPTZ NOT NULL,
                meta          JSONB       NOT NULL DEFAULT '{{}}'::jsonb,
                generation_id BIGINT      NOT NULL DEFAULT 0,
                PRIMARY KEY (tenant_id, raw_id)
            )
            "#
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {index_name} ON {table} (tenant_id, extracted_at)"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RawSink for PgRawSink {
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert(&self, table: &str, rows: &[RawRow]) -> Result<UpsertReport, SinkError> {
        validate_table_name(table)?;
        let mut report = UpsertReport::default();
        let rows = dedupe_rows(rows);

        for chunk in rows.chunks(self.batch_size) {
            let mut tx = self.pool.begin().await?;
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {table} (tenant_id, raw_id, data, extracted_at, loaded_at, meta, generation_id) "
            ));
            qb.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(row.tenant_id)
                    .push_bind(row.raw_id.clone())
                    .push_bind(row.payload.clone())
                    .push_bind(row.extracted_at)
                    .push_bind(row.loaded_at)
                    .push_bind(sqlx::types::Json(row.meta.clone()))
                    .push_bind(row.generation_id);
            });
            qb.push(
                " ON CONFLICT (tenant_id, raw_id) DO UPDATE SET \
                 data = EXCLUDED.data, \
                 extracted_at = EXCLUDED.extracted_at, \
                 loaded_at = EXCLUDED.loaded_at, \
                 meta = EXCLUDED.meta, \
                 generation_id = EXCLUDED.generation_id \
                 RETURNING (xmax = 0) AS inserted",
            );

            let returned = qb.build().fetch_all(&mut *tx).await?;
            tx.commit().await?;

            let mut batch = UpsertReport::default();
            for row in returned {
                if row.try_get::<bool, _>("inserted")? {
                    batch.inserted += 1;
                } else {
                    batch.updated += 1;
                }
            }
            debug!(table, inserted = batch.inserted, updated = batch.updated, "raw batch committed");
            report.merge(batch);
        }
        Ok(report)
    }
}

/// In-process sink used by tests and fixture runs.
#[derive(Debug)]
pub struct MemoryRawSink {
    batch_size: usize,
    tables: Mutex<BTreeMap<String, BTreeMap<(i64, String), RawRow>>>,
    batches: StdMutex<Vec<usize>>,
    fail_next: StdMutex<Option<String>>,
}

impl Default for MemoryRawSink {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl MemoryRawSink {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            tables: Mutex::new(BTreeMap::new()),
            batches: StdMutex::new(Vec::new()),
            fail_next: StdMutex::new(None),
        }
    }

    /// Makes the next `upsert` call fail before writing anything.
    pub fn fail_next_upsert(&self, message: impl Into<String>) {
        *self.fail_next.lock().unwrap_or_else(|p| p.into_inner()) = Some(message.into());
    }

    pub async fn rows(&self, table: &str) -> Vec<RawRow> {
        self.tables
            .lock()
            .await
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.tables.lock().await.get(table).map_or(0, BTreeMap::len)
    }

    /// Sizes of every batch written so far, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl RawSink for MemoryRawSink {
    async fn upsert(&self, table: &str, rows: &[RawRow]) -> Result<UpsertReport, SinkError> {
        validate_table_name(table)?;
        let injected = self.fail_next.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(message) = injected {
            return Err(SinkError::Injected(message));
        }

        let rows = dedupe_rows(rows);
        let mut report = UpsertReport::default();
        let mut tables = self.tables.lock().await;
        let target = tables.entry(table.to_string()).or_default();
        for chunk in rows.chunks(self.batch_size) {
            for row in chunk {
                let previous = target.insert((row.tenant_id, row.raw_id.clone()), (*row).clone());
                if previous.is_some() {
                    report.updated += 1;
                } else {
                    report.inserted += 1;
                }
            }
            self.batches
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(chunk.len());
        }
        Ok(report)
    }
}
