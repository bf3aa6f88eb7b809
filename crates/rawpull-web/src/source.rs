//! Daily row counts per tenant, read back from raw tables.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use rawpull_core::RawRow;
use rawpull_storage::warehouse::validate_table_name;
use rawpull_storage::{MemoryRawSink, SinkError};
use serde::Serialize;
use sqlx::{PgPool, Row};

#[derive(Debug, thiserror::Error)]
pub enum SeriesError {
    #[error(transparent)]
    Table(#[from] SinkError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub tenant_id: i64,
    pub day: NaiveDate,
    pub count: i64,
}

/// The last `days` complete UTC days before `now`, as `[start, end)`. The start saturates at
/// the earliest representable date.
pub fn series_window(days: i64, now: DateTime<Utc>) -> (NaiveDate, NaiveDate) {
    let end = now.date_naive();
    let start = end
        .checked_sub_days(Days::new(days.max(1).unsigned_abs()))
        .unwrap_or(NaiveDate::MIN);
    (start, end)
}

/// A malformed `meta.event_at` falls back to `extracted_at` instead of failing the query.
fn daily_counts_sql(table: &str) -> String {
    format!(
        r#"
        SELECT tenant_id, (event_at AT TIME ZONE 'UTC')::date AS day, COUNT(*)::bigint AS cnt
          FROM (
            SELECT tenant_id,
                   COALESCE(rawpull_try_timestamptz(meta->>'event_at'), extracted_at) AS event_at
              FROM {table}
          ) events
         WHERE event_at >= $1 AND event_at < $2
         GROUP BY 1, 2
         ORDER BY 1, 2
        "#
    )
}

fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}

#[async_trait]
pub trait SeriesSource: Send + Sync {
    /// Rows per tenant and UTC event day over [`series_window`], ordered by tenant then day.
    async fn daily_counts(
        &self,
        table: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<DailyCount>, SeriesError>;
}

#[derive(Debug, Clone)]
pub struct PgSeriesSource {
    pool: PgPool,
}

impl PgSeriesSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SeriesSource for PgSeriesSource {
    async fn daily_counts(
        &self,
        table: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<DailyCount>, SeriesError> {
        validate_table_name(table)?;
        let (start, end) = series_window(days, now);
        let rows = sqlx::query(&daily_counts_sql(table))
            .bind(day_start(start))
            .bind(day_start(end))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DailyCount {
                    tenant_id: row.try_get("tenant_id")?,
                    day: row.try_get("day")?,
                    count: row.try_get("cnt")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(SeriesError::from)
    }
}

/// Counts rows held by a [`MemoryRawSink`], for tests and fixture runs.
#[derive(Debug, Clone)]
pub struct MemorySeriesSource {
    sink: Arc<MemoryRawSink>,
}

impl MemorySeriesSource {
    pub fn new(sink: Arc<MemoryRawSink>) -> Self {
        Self { sink }
    }
}

fn event_day(row: &RawRow) -> NaiveDate {
    row.meta
        .get("event_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or(row.extracted_at)
        .date_naive()
}

#[async_trait]
impl SeriesSource for MemorySeriesSource {
    async fn daily_counts(
        &self,
        table: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<DailyCount>, SeriesError> {
        validate_table_name(table)?;
        let (start, end) = series_window(days, now);
        let mut counts = BTreeMap::<(i64, NaiveDate), i64>::new();
        for row in self.sink.rows(table).await {
            let day = event_day(&row);
            if day >= start && day < end {
                *counts.entry((row.tenant_id, day)).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|((tenant_id, day), count)| DailyCount {
                tenant_id,
                day,
                count,
            })
            .collect())
    }
}
