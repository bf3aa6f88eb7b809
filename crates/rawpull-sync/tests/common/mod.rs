#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rawpull_adapters::{AdapterError, Page, StreamSpec, SyncMode, VendorAdapter};
use rawpull_core::{
    state, Clock, Credentials, FixedClock, RawRow, StateDefaults, SyncState, TenantAccount,
    TimeWindow,
};
use rawpull_storage::{
    BackoffPolicy, FetchError, MemoryRawSink, MemoryStateStore, StateStore,
};
use rawpull_sync::{DriverSettings, FetchSettings, IngestionDriver};

pub const PLATFORM: &str = "scripted";

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).single().unwrap()
}

pub fn incremental_stream() -> StreamSpec {
    StreamSpec {
        name: "responses".into(),
        mode: SyncMode::Incremental,
        raw_table: "raw_scripted_responses".into(),
        path: None,
    }
}

pub fn full_stream() -> StreamSpec {
    StreamSpec {
        name: "questions".into(),
        mode: SyncMode::FullRefresh,
        raw_table: "raw_scripted_questions".into(),
        path: None,
    }
}

pub fn account(tenant_id: i64) -> TenantAccount {
    TenantAccount {
        tenant_id,
        account_id: format!("acct-{tenant_id}"),
        platform: PLATFORM.into(),
        credentials: Credentials::default(),
    }
}

/// Vendor double. Every window yields `pages` pages of `rows_per_page` rows whose ids are
/// derived from the window start, so a replayed window produces identical ids.
pub struct ScriptedAdapter {
    pub streams: Vec<StreamSpec>,
    pub pages: usize,
    pub rows_per_page: usize,
    /// Adds a cursor pointing at one more, empty page.
    pub trailing_empty_page: bool,
    pub full_rows: usize,
    pub call_delay: Duration,
    pub fail_status: Option<u16>,
    pub panic_for_tenant: Option<i64>,
    pub calls: AtomicUsize,
    pub windows: Mutex<Vec<TimeWindow>>,
}

impl Default for ScriptedAdapter {
    fn default() -> Self {
        Self {
            streams: vec![incremental_stream(), full_stream()],
            pages: 0,
            rows_per_page: 0,
            trailing_empty_page: false,
            full_rows: 0,
            call_delay: Duration::ZERO,
            fail_status: None,
            panic_for_tenant: None,
            calls: AtomicUsize::new(0),
            windows: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedAdapter {
    pub fn only(mut self, stream: StreamSpec) -> Self {
        self.streams = vec![stream];
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn windows(&self) -> Vec<TimeWindow> {
        self.windows.lock().unwrap().clone()
    }

    fn row(account: &TenantAccount, raw_id: String, event_at: DateTime<Utc>) -> RawRow {
        RawRow {
            tenant_id: account.tenant_id,
            raw_id: raw_id.clone(),
            payload: serde_json::to_vec(&serde_json::json!({"id": raw_id})).unwrap(),
            extracted_at: event_at,
            loaded_at: event_at,
            meta: serde_json::json!({"event_at": event_at.to_rfc3339()}),
            generation_id: 0,
        }
    }

    async fn before_call(&self, account: &TenantAccount) -> Result<(), AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        if self.panic_for_tenant == Some(account.tenant_id) {
            panic!("vendor client blew up for tenant {}", account.tenant_id);
        }
        if let Some(status) = self.fail_status {
            return Err(AdapterError::Http(FetchError::HttpStatus {
                status,
                url: "https://scripted.test".into(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl VendorAdapter for ScriptedAdapter {
    fn platform(&self) -> &str {
        PLATFORM
    }

    fn streams(&self) -> &[StreamSpec] {
        &self.streams
    }

    async fn list_incremental(
        &self,
        account: &TenantAccount,
        _stream: &StreamSpec,
        window: &TimeWindow,
        cursor: Option<&str>,
        _page_size: usize,
    ) -> Result<Page, AdapterError> {
        self.before_call(account).await?;
        let page = cursor.map_or(0, |c| c.parse::<usize>().unwrap());
        if page == 0 {
            self.windows.lock().unwrap().push(*window);
        }

        let rows = if page < self.pages {
            (0..self.rows_per_page)
                .map(|i| {
                    let id = format!("{}-p{page}-r{i}", window.since().format("%Y%m%d"));
                    Self::row(account, id, window.since())
                })
                .collect()
        } else {
            Vec::new()
        };
        let last_real = self.pages.saturating_sub(1);
        let next_cursor = if page < last_real || (page == last_real && self.trailing_empty_page && self.pages > 0) {
            Some((page + 1).to_string())
        } else {
            None
        };
        Ok(Page { rows, next_cursor })
    }

    async fn list_full(
        &self,
        account: &TenantAccount,
        _stream: &StreamSpec,
    ) -> Result<Page, AdapterError> {
        self.before_call(account).await?;
        let extracted = at(2025, 1, 1);
        Ok(Page {
            rows: (0..self.full_rows)
                .map(|i| Self::row(account, format!("q{i}"), extracted))
                .collect(),
            next_cursor: None,
        })
    }
}

pub struct Harness {
    pub store: Arc<MemoryStateStore>,
    pub sink: Arc<MemoryRawSink>,
    pub clock: Arc<FixedClock>,
}

impl Harness {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            store: Arc::new(MemoryStateStore::new()),
            sink: Arc::new(MemoryRawSink::default()),
            clock: Arc::new(FixedClock::new(now)),
        }
    }

    pub fn driver(&self, settings: DriverSettings) -> IngestionDriver {
        let store: Arc<dyn StateStore> = self.store.clone();
        let clock: Arc<dyn Clock> = self.clock.clone();
        IngestionDriver::new(store, self.sink.clone(), clock, settings)
    }

    pub async fn state(&self, account: &TenantAccount, stream: &StreamSpec) -> SyncState {
        let blob = self
            .store
            .get_sync_blob(&account.key_for(&stream.name))
            .await
            .unwrap();
        state::decode(blob.as_deref(), self.clock.now(), StateDefaults::default())
    }
}

pub fn settings(initial_days: i64, max_slices_per_run: usize, max_pages: usize) -> DriverSettings {
    DriverSettings {
        lease_ttl: chrono::Duration::hours(1),
        min_interval: chrono::Duration::hours(1),
        max_slices_per_run,
        inter_slice_delay: Duration::ZERO,
        overlap_days: 0,
        state_defaults: StateDefaults {
            initial_days,
            slice_days: 1,
            recent_sync_days: 7,
        },
        fetch: FetchSettings {
            page_size: 100,
            max_pages,
            rate_per_second: 1000,
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(3),
            },
        },
    }
}
