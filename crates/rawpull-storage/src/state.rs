//! Per-(tenant, account, platform, stream) sync state plus the task lease stored alongside it.
//!
//! The lease is an optimistic compare-and-set on `(is_running, lease_started_at)`: exactly one
//! caller can observe the transition `0 -> 1` for a given observed tuple. A lease older than
//! the TTL is treated as orphaned and can be taken over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rawpull_core::{Clock, TenantStreamKey};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("no sync state row for {0}")]
    Missing(String),
    #[error("injected store failure: {0}")]
    Injected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired,
    AlreadyRunning,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct StoredStateRow {
    pub key: TenantStreamKey,
    pub is_running: bool,
    pub lease_started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sync_blob: Option<Vec<u8>>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_sync_blob(&self, key: &TenantStreamKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrites the blob. Callers must hold the lease for `key`.
    async fn put_sync_blob(
        &self,
        key: &TenantStreamKey,
        blob: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Inserts a not-running row if none exists. Returns whether a row was created.
    async fn create_initial(
        &self,
        key: &TenantStreamKey,
        blob: &[u8],
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn try_acquire(
        &self,
        key: &TenantStreamKey,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> Result<LeaseOutcome, StoreError>;

    /// Clears the running flag. Releasing an unheld lease is a no-op.
    async fn release(&self, key: &TenantStreamKey, now: DateTime<Utc>) -> Result<(), StoreError>;

    async fn list_states(&self, platform: Option<&str>) -> Result<Vec<StoredStateRow>, StoreError>;
}

fn lease_is_live(
    is_running: bool,
    lease_started_at: DateTime<Utc>,
    now: DateTime<Utc>,
    lease_ttl: Duration,
) -> bool {
    is_running && lease_started_at >= now - lease_ttl
}

/// A held lease. Call [`LeaseGuard::release`] on every normal exit path; if the guard is dropped
/// while still held (panic, cancelled task) the release is spawned onto the current runtime.
pub struct LeaseGuard {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    key: TenantStreamKey,
    released: bool,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl LeaseGuard {
    pub fn key(&self) -> &TenantStreamKey {
        &self.key
    }

    pub async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.store.release(&self.key, self.clock.now()).await
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let now = self.clock.now();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = store.release(&key, now).await {
                        warn!(trace_id = %key.trace_id(), error = %err, "lease release after drop failed");
                    }
                });
            }
            Err(_) => {
                warn!(trace_id = %key.trace_id(), "lease dropped outside a runtime; waiting for ttl expiry");
            }
        }
    }
}

#[derive(Debug)]
pub enum Lease {
    Held(LeaseGuard),
    AlreadyRunning,
    NotFound,
}

pub async fn try_lease(
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    key: &TenantStreamKey,
    lease_ttl: Duration,
) -> Result<Lease, StoreError> {
    match store.try_acquire(key, clock.now(), lease_ttl).await? {
        LeaseOutcome::Acquired => Ok(Lease::Held(LeaseGuard {
            store,
            clock,
            key: key.clone(),
            released: false,
        })),
        LeaseOutcome::AlreadyRunning => Ok(Lease::AlreadyRunning),
        LeaseOutcome::NotFound => Ok(Lease::NotFound),
    }
}

#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn get_sync_blob(&self, key: &TenantStreamKey) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT sync_blob
              FROM sync_state
             WHERE tenant_id = $1 AND account_id = $2 AND platform = $3 AND stream = $4
            "#,
        )
        .bind(key.tenant_id)
        .bind(&key.account_id)
        .bind(&key.platform)
        .bind(&key.stream)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_get::<Option<Vec<u8>>, _>("sync_blob")?),
            None => Ok(None),
        }
    }

    async fn put_sync_blob(
        &self,
        key: &TenantStreamKey,
        blob: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_state
               SET sync_blob = $5, updated_at = $6
             WHERE tenant_id = $1 AND account_id = $2 AND platform = $3 AND stream = $4
            "#,
        )
        .bind(key.tenant_id)
        .bind(&key.account_id)
        .bind(&key.platform)
        .bind(&key.stream)
        .bind(blob)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Missing(key.trace_id()));
        }
        Ok(())
    }

    async fn create_initial(
        &self,
        key: &TenantStreamKey,
        blob: &[u8],
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_state
                (tenant_id, account_id, platform, stream, sync_blob, is_running, lease_started_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $6)
            ON CONFLICT (tenant_id, account_id, platform, stream) DO NOTHING
            "#,
        )
        .bind(key.tenant_id)
        .bind(&key.account_id)
        .bind(&key.platform)
        .bind(&key.stream)
        .bind(blob)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn try_acquire(
        &self,
        key: &TenantStreamKey,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> Result<LeaseOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT is_running, lease_started_at
              FROM sync_state
             WHERE tenant_id = $1 AND account_id = $2 AND platform = $3 AND stream = $4
            "#,
        )
        .bind(key.tenant_id)
        .bind(&key.account_id)
        .bind(&key.platform)
        .bind(&key.stream)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(LeaseOutcome::NotFound);
        };
        let is_running: i16 = row.try_get("is_running")?;
        let lease_started_at: DateTime<Utc> = row.try_get("lease_started_at")?;
        if lease_is_live(is_running != 0, lease_started_at, now, lease_ttl) {
            return Ok(LeaseOutcome::AlreadyRunning);
        }

        let result = sqlx::query(
            r#"
            UPDATE sync_state
               SET is_running = 1, lease_started_at = $5
             WHERE tenant_id = $1 AND account_id = $2 AND platform = $3 AND stream = $4
               AND is_running = $6 AND lease_started_at = $7
            "#,
        )
        .bind(key.tenant_id)
        .bind(&key.account_id)
        .bind(&key.platform)
        .bind(&key.stream)
        .bind(now)
        .bind(is_running)
        .bind(lease_started_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(trace_id = %key.trace_id(), "lease compare-and-set lost");
            return Ok(LeaseOutcome::AlreadyRunning);
        }
        Ok(LeaseOutcome::Acquired)
    }

    async fn release(&self, key: &TenantStreamKey, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_state
               SET is_running = 0, lease_started_at = $5
             WHERE tenant_id = $1 AND account_id = $2 AND platform = $3 AND stream = $4
            "#,
        )
        .bind(key.tenant_id)
        .bind(&key.account_id)
        .bind(&key.platform)
        .bind(&key.stream)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_states(&self, platform: Option<&str>) -> Result<Vec<StoredStateRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, account_id, platform, stream, sync_blob, is_running, lease_started_at, updated_at
              FROM sync_state
             WHERE $1::text IS NULL OR platform = $1
             ORDER BY platform, tenant_id, account_id, stream
            "#,
        )
        .bind(platform)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let is_running: i16 = row.try_get("is_running")?;
            out.push(StoredStateRow {
                key: TenantStreamKey {
                    tenant_id: row.try_get("tenant_id")?,
                    account_id: row.try_get("account_id")?,
                    platform: row.try_get("platform")?,
                    stream: row.try_get("stream")?,
                },
                is_running: is_running != 0,
                lease_started_at: row.try_get("lease_started_at")?,
                updated_at: row.try_get("updated_at")?,
                sync_blob: row.try_get("sync_blob")?,
            });
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
struct MemoryRow {
    is_running: bool,
    lease_started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sync_blob: Option<Vec<u8>>,
    blob_history: Vec<Vec<u8>>,
}

/// In-process store with the same lease semantics as [`PgStateStore`]. Keeps every blob
/// written per key so tests can inspect commit order.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    rows: Mutex<HashMap<TenantStreamKey, MemoryRow>>,
    fail_puts: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_running(&self, key: &TenantStreamKey) -> Option<bool> {
        self.rows.lock().await.get(key).map(|r| r.is_running)
    }

    pub async fn blob_history(&self, key: &TenantStreamKey) -> Vec<Vec<u8>> {
        self.rows
            .lock()
            .await
            .get(key)
            .map(|r| r.blob_history.clone())
            .unwrap_or_default()
    }

    /// Marks `key` as held since `started_at`, as if a crashed worker never released it.
    pub async fn force_running(&self, key: &TenantStreamKey, started_at: DateTime<Utc>) {
        let mut rows = self.rows.lock().await;
        let row = rows.entry(key.clone()).or_insert_with(|| MemoryRow {
            is_running: true,
            lease_started_at: started_at,
            updated_at: started_at,
            sync_blob: None,
            blob_history: Vec::new(),
        });
        row.is_running = true;
        row.lease_started_at = started_at;
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_sync_blob(&self, key: &TenantStreamKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .rows
            .lock()
            .await
            .get(key)
            .and_then(|r| r.sync_blob.clone()))
    }

    async fn put_sync_blob(
        &self,
        key: &TenantStreamKey,
        blob: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Injected(format!("put for {}", key.trace_id())));
        }
        let mut rows = self.rows.lock().await;
        let row = rows
            .get_mut(key)
            .ok_or_else(|| StoreError::Missing(key.trace_id()))?;
        row.sync_blob = Some(blob.to_vec());
        row.blob_history.push(blob.to_vec());
        row.updated_at = now;
        Ok(())
    }

    async fn create_initial(
        &self,
        key: &TenantStreamKey,
        blob: &[u8],
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(key) {
            return Ok(false);
        }
        rows.insert(
            key.clone(),
            MemoryRow {
                is_running: false,
                lease_started_at: now,
                updated_at: now,
                sync_blob: Some(blob.to_vec()),
                blob_history: Vec::new(),
            },
        );
        Ok(true)
    }

    async fn try_acquire(
        &self,
        key: &TenantStreamKey,
        now: DateTime<Utc>,
        lease_ttl: Duration,
    ) -> Result<LeaseOutcome, StoreError> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.get_mut(key) else {
            return Ok(LeaseOutcome::NotFound);
        };
        if lease_is_live(row.is_running, row.lease_started_at, now, lease_ttl) {
            return Ok(LeaseOutcome::AlreadyRunning);
        }
        row.is_running = true;
        row.lease_started_at = now;
        Ok(LeaseOutcome::Acquired)
    }

    async fn release(&self, key: &TenantStreamKey, now: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(row) = self.rows.lock().await.get_mut(key) {
            row.is_running = false;
            row.lease_started_at = now;
        }
        Ok(())
    }

    async fn list_states(&self, platform: Option<&str>) -> Result<Vec<StoredStateRow>, StoreError> {
        let rows = self.rows.lock().await;
        let mut out = rows
            .iter()
            .filter(|(key, _)| platform.map_or(true, |p| key.platform == p))
            .map(|(key, row)| StoredStateRow {
                key: key.clone(),
                is_running: row.is_running,
                lease_started_at: row.lease_started_at,
                updated_at: row.updated_at,
                sync_blob: row.sync_blob.clone(),
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}
