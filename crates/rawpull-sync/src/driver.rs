//! Runs one `(tenant, account, platform, stream)` under its lease: decode state, plan slices,
//! fetch, upsert, commit the watermark after every slice.

use std::sync::Arc;
use std::time::Duration;

use rawpull_adapters::{StreamSpec, SyncMode, VendorAdapter};
use rawpull_core::state::{decode, encode};
use rawpull_core::{
    Clock, PlannerError, RawRow, SlicePlanner, StateDefaults, SyncState, SyncStatus,
    TenantAccount, TenantStreamKey,
};
use rawpull_storage::{try_lease, Lease, LeaseGuard, RawSink, SinkError, StateStore, StoreError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::fetcher::{FetchSettings, SliceError, SliceFetcher};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverSettings {
    pub lease_ttl: chrono::Duration,
    pub min_interval: chrono::Duration,
    pub max_slices_per_run: usize,
    pub inter_slice_delay: Duration,
    pub overlap_days: i64,
    pub state_defaults: StateDefaults,
    pub fetch: FetchSettings,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            lease_ttl: chrono::Duration::hours(1),
            min_interval: chrono::Duration::hours(1),
            max_slices_per_run: 800,
            inter_slice_delay: Duration::from_millis(500),
            overlap_days: 0,
            state_defaults: StateDefaults::default(),
            fetch: FetchSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
    RecentlySynced,
    NotAcquired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Skipped { reason: SkipReason },
    Succeeded { slices: usize, rows: usize },
    PartialSuccess { slices: usize, rows: usize },
}

impl RunOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("state store: {0}")]
    Store(#[from] StoreError),
    #[error("encoding sync state: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("slice planner: {0}")]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    Fetch(#[from] SliceError),
    #[error("warehouse sink: {0}")]
    Sink(#[from] SinkError),
}

/// sha256 over `raw_id` and payload of every row, in `raw_id` order.
pub fn content_digest(rows: &[RawRow]) -> String {
    let mut sorted = rows.iter().collect::<Vec<_>>();
    sorted.sort_by(|a, b| (a.tenant_id, &a.raw_id).cmp(&(b.tenant_id, &b.raw_id)));
    let mut hasher = Sha256::new();
    for row in sorted {
        hasher.update(row.tenant_id.to_be_bytes());
        hasher.update(row.raw_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(&row.payload);
        hasher.update([0xffu8]);
    }
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct IngestionDriver {
    store: Arc<dyn StateStore>,
    sink: Arc<dyn RawSink>,
    clock: Arc<dyn Clock>,
    settings: DriverSettings,
    planner: SlicePlanner,
}

impl std::fmt::Debug for IngestionDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

impl IngestionDriver {
    pub fn new(
        store: Arc<dyn StateStore>,
        sink: Arc<dyn RawSink>,
        clock: Arc<dyn Clock>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            store,
            sink,
            clock,
            planner: SlicePlanner::new(settings.overlap_days),
            settings,
        }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub async fn run(
        &self,
        account: &TenantAccount,
        adapter: Arc<dyn VendorAdapter>,
        stream: &StreamSpec,
    ) -> Result<RunOutcome, DriverError> {
        let key = account.key_for(&stream.name);
        let span = info_span!("ingest", trace_id = %key.trace_id(), platform = %key.platform);
        self.run_keyed(&key, account, adapter, stream)
            .instrument(span)
            .await
    }

    async fn run_keyed(
        &self,
        key: &TenantStreamKey,
        account: &TenantAccount,
        adapter: Arc<dyn VendorAdapter>,
        stream: &StreamSpec,
    ) -> Result<RunOutcome, DriverError> {
        let guard = match self.acquire(key).await? {
            Ok(guard) => guard,
            Err(reason) => {
                debug!(?reason, "lease not taken");
                return Ok(RunOutcome::Skipped { reason });
            }
        };

        let result = self.run_leased(key, account, adapter, stream).await;
        if let Err(err) = guard.release().await {
            warn!(error = %err, "releasing lease failed; it will expire after the ttl");
        }
        result
    }

    async fn acquire(&self, key: &TenantStreamKey) -> Result<Result<LeaseGuard, SkipReason>, DriverError> {
        let ttl = self.settings.lease_ttl;
        match try_lease(Arc::clone(&self.store), Arc::clone(&self.clock), key, ttl).await? {
            Lease::Held(guard) => return Ok(Ok(guard)),
            Lease::AlreadyRunning => return Ok(Err(SkipReason::AlreadyRunning)),
            Lease::NotFound => {}
        }

        let now = self.clock.now();
        let initial = encode(&SyncState::fresh(now, self.settings.state_defaults))?;
        if self.store.create_initial(key, &initial, now).await? {
            info!("created initial sync state");
        }
        match try_lease(Arc::clone(&self.store), Arc::clone(&self.clock), key, ttl).await? {
            Lease::Held(guard) => Ok(Ok(guard)),
            Lease::AlreadyRunning | Lease::NotFound => Ok(Err(SkipReason::NotAcquired)),
        }
    }

    async fn run_leased(
        &self,
        key: &TenantStreamKey,
        account: &TenantAccount,
        adapter: Arc<dyn VendorAdapter>,
        stream: &StreamSpec,
    ) -> Result<RunOutcome, DriverError> {
        let now = self.clock.now();
        let blob = self.store.get_sync_blob(key).await?;
        let mut state = decode(blob.as_deref(), now, self.settings.state_defaults);
        let fetcher = SliceFetcher::new(adapter, self.settings.fetch);

        match stream.mode {
            SyncMode::Incremental => {
                self.run_incremental(key, account, stream, &fetcher, &mut state)
                    .await
            }
            SyncMode::FullRefresh => {
                self.run_full_refresh(key, account, stream, &fetcher, &mut state)
                    .await
            }
        }
    }

    fn recently_synced(&self, state: &SyncState) -> bool {
        state.status == SyncStatus::Success
            && state.updated_at + self.settings.min_interval > self.clock.now()
    }

    async fn run_incremental(
        &self,
        key: &TenantStreamKey,
        account: &TenantAccount,
        stream: &StreamSpec,
        fetcher: &SliceFetcher,
        state: &mut SyncState,
    ) -> Result<RunOutcome, DriverError> {
        if self.recently_synced(state) && self.planner.all_complete(state) {
            debug!(updated_at = %state.updated_at, "synced within the minimum interval");
            return Ok(RunOutcome::Skipped {
                reason: SkipReason::RecentlySynced,
            });
        }

        if self.planner.init_if_needed(state, self.clock.now()) {
            info!(
                since = ?state.sync_start_date,
                until = ?state.sync_end_date,
                total_slices = state.total_slices,
                initial = state.is_initial_sync,
                "planned slice round"
            );
        }
        state.status = SyncStatus::Running;
        state.message.clear();

        let mut slices = 0usize;
        let mut rows_written = 0usize;
        while let Some(window) = self.planner.next_window(state) {
            if slices >= self.settings.max_slices_per_run {
                info!(slices, "slice budget for this run exhausted");
                break;
            }

            let rows = match fetcher.fetch_slice(account, stream, &window).await {
                Ok(rows) => rows,
                Err(err) => return self.fail(key, state, err.into()).await,
            };
            if let Err(err) = self.sink.upsert(&stream.raw_table, &rows).await {
                return self.fail(key, state, err.into()).await;
            }

            let advanced = self.planner.complete_slice(state, rows.len())?;
            state.updated_at = self.clock.now();
            self.persist(key, state).await?;
            slices += 1;
            rows_written += rows.len();
            debug!(
                watermark = %advanced,
                rows = rows.len(),
                progress = self.planner.progress(state),
                "slice committed"
            );

            if !self.settings.inter_slice_delay.is_zero() && self.planner.next_window(state).is_some() {
                tokio::time::sleep(self.settings.inter_slice_delay).await;
            }
        }

        let complete = self.planner.all_complete(state);
        state.status = if complete {
            SyncStatus::Success
        } else {
            SyncStatus::PartialSuccess
        };
        state.updated_at = self.clock.now();
        self.persist(key, state).await?;

        info!(
            status = %state.status,
            slices,
            rows = rows_written,
            completed_slices = state.completed_slices,
            total_slices = state.total_slices,
            "incremental run finished"
        );
        Ok(if complete {
            RunOutcome::Succeeded {
                slices,
                rows: rows_written,
            }
        } else {
            RunOutcome::PartialSuccess {
                slices,
                rows: rows_written,
            }
        })
    }

    async fn run_full_refresh(
        &self,
        key: &TenantStreamKey,
        account: &TenantAccount,
        stream: &StreamSpec,
        fetcher: &SliceFetcher,
        state: &mut SyncState,
    ) -> Result<RunOutcome, DriverError> {
        if self.recently_synced(state) && state.last_sync_time.is_some() {
            debug!(updated_at = %state.updated_at, "synced within the minimum interval");
            return Ok(RunOutcome::Skipped {
                reason: SkipReason::RecentlySynced,
            });
        }
        state.status = SyncStatus::Running;
        state.message.clear();

        let rows = match fetcher.fetch_full(account, stream).await {
            Ok(rows) => rows,
            Err(err) => return self.fail(key, state, err.into()).await,
        };
        let digest = content_digest(&rows);
        let count = i64::try_from(rows.len()).unwrap_or(i64::MAX);
        let unchanged = count == state.record_count
            && state.content_digest.as_deref().map_or(true, |d| d == digest);

        let mut rows_written = 0;
        if unchanged {
            debug!(rows = rows.len(), "collection unchanged; sink skipped");
        } else {
            if let Err(err) = self.sink.upsert(&stream.raw_table, &rows).await {
                return self.fail(key, state, err.into()).await;
            }
            rows_written = rows.len();
        }

        let now = self.clock.now();
        state.record_count = count;
        state.content_digest = Some(digest);
        state.last_sync_time = Some(now);
        state.is_initial_sync = false;
        state.status = SyncStatus::Success;
        state.updated_at = now;
        self.persist(key, state).await?;

        info!(rows = rows.len(), written = rows_written, "full refresh finished");
        Ok(RunOutcome::Succeeded {
            slices: 0,
            rows: rows_written,
        })
    }

    async fn persist(&self, key: &TenantStreamKey, state: &SyncState) -> Result<(), DriverError> {
        let blob = encode(state)?;
        self.store
            .put_sync_blob(key, &blob, self.clock.now())
            .await?;
        Ok(())
    }

    /// Stores FAILED with the error message; the slice in flight stays uncommitted.
    async fn fail(
        &self,
        key: &TenantStreamKey,
        state: &mut SyncState,
        err: DriverError,
    ) -> Result<RunOutcome, DriverError> {
        state.mark_failed(err.to_string(), self.clock.now());
        error!(error = %err, watermark = ?state.current_slice_date, "stream run failed");
        if let Err(persist_err) = self.persist(key, state).await {
            error!(error = %persist_err, "could not persist FAILED state");
        }
        Err(err)
    }
}
