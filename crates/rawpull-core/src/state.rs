//! Versioned JSON codec for the per-stream sync blob.
//!
//! Decoding never fails: a missing or unreadable blob yields a fresh state, unknown fields are
//! ignored, and missing fields fall back to defaults. Blobs written before slice planning existed
//! (no `schema_version`, no planner fields) are widened into the current shape.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::SyncStatus;

pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateDefaults {
    pub initial_days: i64,
    pub slice_days: i64,
    pub recent_sync_days: i64,
}

impl Default for StateDefaults {
    fn default() -> Self {
        Self {
            initial_days: 365,
            slice_days: 1,
            recent_sync_days: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub status: SyncStatus,
    pub message: String,
    pub updated_at: DateTime<Utc>,
    pub record_count: i64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub sync_start_date: Option<DateTime<Utc>>,
    pub sync_end_date: Option<DateTime<Utc>>,
    pub current_slice_date: Option<DateTime<Utc>>,
    pub last_completed_date: Option<DateTime<Utc>>,
    pub completed_slices: i64,
    pub total_slices: i64,
    pub slice_days: i64,
    pub initial_days: i64,
    pub recent_sync_days: i64,
    pub is_initial_sync: bool,
    pub content_digest: Option<String>,
}

impl SyncState {
    /// State for a key that has never been synced. `updated_at` is backdated so the
    /// min-interval gate cannot skip the first run.
    pub fn fresh(now: DateTime<Utc>, defaults: StateDefaults) -> Self {
        Self {
            status: SyncStatus::Success,
            message: String::new(),
            updated_at: now - Duration::hours(2),
            record_count: 0,
            last_sync_time: None,
            sync_start_date: None,
            sync_end_date: None,
            current_slice_date: None,
            last_completed_date: None,
            completed_slices: 0,
            total_slices: 0,
            slice_days: defaults.slice_days.max(1),
            initial_days: defaults.initial_days,
            recent_sync_days: defaults.recent_sync_days,
            is_initial_sync: true,
            content_digest: None,
        }
    }

    pub fn range_is_set(&self) -> bool {
        self.sync_start_date.is_some()
            && self.sync_end_date.is_some()
            && self.current_slice_date.is_some()
    }

    pub fn mark_failed(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = SyncStatus::Failed;
        self.message = message.into();
        self.updated_at = now;
    }
}

#[derive(Serialize)]
struct EncodedState<'a> {
    schema_version: u32,
    #[serde(flatten)]
    state: &'a SyncState,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireState {
    schema_version: Option<u32>,
    status: Option<String>,
    message: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    record_count: Option<i64>,
    last_sync_time: Option<DateTime<Utc>>,
    sync_start_date: Option<DateTime<Utc>>,
    sync_end_date: Option<DateTime<Utc>>,
    current_slice_date: Option<DateTime<Utc>>,
    last_completed_date: Option<DateTime<Utc>>,
    completed_slices: Option<i64>,
    total_slices: Option<i64>,
    slice_days: Option<i64>,
    initial_days: Option<i64>,
    recent_sync_days: Option<i64>,
    is_initial_sync: Option<bool>,
    content_digest: Option<String>,
}

impl WireState {
    fn has_planner_fields(&self) -> bool {
        self.sync_start_date.is_some()
            || self.sync_end_date.is_some()
            || self.current_slice_date.is_some()
            || self.last_completed_date.is_some()
            || self.completed_slices.is_some()
            || self.total_slices.is_some()
            || self.is_initial_sync.is_some()
    }
}

pub fn encode(state: &SyncState) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&EncodedState {
        schema_version: SCHEMA_VERSION,
        state,
    })
}

pub fn decode(bytes: Option<&[u8]>, now: DateTime<Utc>, defaults: StateDefaults) -> SyncState {
    let fresh = SyncState::fresh(now, defaults);
    let Some(bytes) = bytes.filter(|b| !b.is_empty()) else {
        return fresh;
    };

    let wire: WireState = match serde_json::from_slice(bytes) {
        Ok(wire) => wire,
        Err(err) => {
            warn!(error = %err, "unreadable sync blob; starting from defaults");
            return fresh;
        }
    };

    if let Some(version) = wire.schema_version {
        if version > SCHEMA_VERSION {
            warn!(version, supported = SCHEMA_VERSION, "sync blob written by a newer schema");
        }
    }

    let legacy = wire.schema_version.is_none() && !wire.has_planner_fields();
    let status = match wire.status.as_deref() {
        Some(raw) => SyncStatus::parse(raw).unwrap_or_else(|| {
            warn!(status = raw, "unknown sync status in blob");
            fresh.status
        }),
        None => fresh.status,
    };

    let mut state = SyncState {
        status,
        message: wire.message.unwrap_or_default(),
        updated_at: wire.updated_at.unwrap_or(fresh.updated_at),
        record_count: wire.record_count.unwrap_or(0),
        last_sync_time: wire.last_sync_time,
        sync_start_date: wire.sync_start_date,
        sync_end_date: wire.sync_end_date,
        current_slice_date: wire.current_slice_date,
        last_completed_date: wire.last_completed_date,
        completed_slices: wire.completed_slices.unwrap_or(0),
        total_slices: wire.total_slices.unwrap_or(0),
        slice_days: wire.slice_days.filter(|d| *d >= 1).unwrap_or(fresh.slice_days),
        initial_days: wire.initial_days.unwrap_or(fresh.initial_days),
        recent_sync_days: wire.recent_sync_days.unwrap_or(fresh.recent_sync_days),
        is_initial_sync: wire.is_initial_sync.unwrap_or(true),
        content_digest: wire.content_digest,
    };

    if legacy {
        state.is_initial_sync = state.last_sync_time.is_none();
        state.last_completed_date = state.last_sync_time;
    }

    state
}
