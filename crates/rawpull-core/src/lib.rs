//! Core domain model for rawpull: tenant/stream keys, raw rows, sync status, and time.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub mod planner;
pub mod state;

pub use planner::{PlannerError, SlicePlanner, TimeWindow};
pub use state::{StateDefaults, SyncState, SCHEMA_VERSION};

pub const CRATE_NAME: &str = "rawpull-core";

/// Identity of one resumable unit of work: a tenant's account on a platform, narrowed to one stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantStreamKey {
    pub tenant_id: i64,
    pub account_id: String,
    pub platform: String,
    pub stream: String,
}

impl TenantStreamKey {
    pub fn new(
        tenant_id: i64,
        account_id: impl Into<String>,
        platform: impl Into<String>,
        stream: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            account_id: account_id.into(),
            platform: platform.into(),
            stream: stream.into(),
        }
    }

    /// Correlation id carried on every log line of a run.
    pub fn trace_id(&self) -> String {
        format!("{}-{}-{}", self.tenant_id, self.account_id, self.stream)
    }
}

impl fmt::Display for TenantStreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.platform, self.trace_id())
    }
}

/// Opaque vendor credentials. Values never show up in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self(values)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

/// One enabled tenant connection as handed out by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantAccount {
    pub tenant_id: i64,
    pub account_id: String,
    pub platform: String,
    #[serde(default)]
    pub credentials: Credentials,
}

impl TenantAccount {
    pub fn key_for(&self, stream: &str) -> TenantStreamKey {
        TenantStreamKey::new(self.tenant_id, &self.account_id, &self.platform, stream)
    }

    pub fn trace_id(&self) -> String {
        format!("{}-{}", self.tenant_id, self.account_id)
    }
}

/// A vendor record as landed in the raw warehouse. The payload stays opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub tenant_id: i64,
    pub raw_id: String,
    pub payload: Vec<u8>,
    pub extracted_at: DateTime<Utc>,
    pub loaded_at: DateTime<Utc>,
    pub meta: serde_json::Value,
    pub generation_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    #[default]
    Success,
    Running,
    Failed,
    PartialSuccess,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
            Self::PartialSuccess => "PARTIAL_SUCCESS",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Some(Self::Success),
            "RUNNING" => Some(Self::Running),
            "FAILED" => Some(Self::Failed),
            "PARTIAL_SUCCESS" => Some(Self::PartialSuccess),
            _ => None,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of "now" for everything that compares timestamps against leases or watermarks.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
