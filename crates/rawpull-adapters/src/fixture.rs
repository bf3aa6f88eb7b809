//! Fixture-first adapter serving records from a JSON bundle on disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rawpull_core::{TenantAccount, TimeWindow};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{build_raw_row, json_id, json_timestamp, AdapterError, Page, StreamSpec, VendorAdapter};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub streams: Vec<StreamSpec>,
    #[serde(default)]
    pub records: BTreeMap<String, Vec<JsonValue>>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_event_time_field")]
    pub event_time_field: String,
    /// Only records of this tenant are served; all tenants see them when absent.
    #[serde(default)]
    pub tenant_id: Option<i64>,
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_event_time_field() -> String {
    "created_at".to_string()
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    platform: String,
    bundle: FixtureBundle,
}

impl FixtureAdapter {
    pub fn new(platform: impl Into<String>, bundle: FixtureBundle) -> Self {
        Self {
            platform: platform.into(),
            bundle,
        }
    }

    fn records(&self, account: &TenantAccount, stream: &StreamSpec) -> Result<&[JsonValue], AdapterError> {
        if self.stream(&stream.name).is_none() {
            return Err(AdapterError::UnsupportedStream(stream.name.clone()));
        }
        if self.bundle.tenant_id.is_some_and(|t| t != account.tenant_id) {
            return Ok(&[]);
        }
        Ok(self
            .bundle
            .records
            .get(&stream.name)
            .map(Vec::as_slice)
            .unwrap_or_default())
    }

    fn keyed(&self, stream: &StreamSpec, record: &JsonValue) -> Result<(String, Option<DateTime<Utc>>), AdapterError> {
        let id = json_id(record, &self.bundle.id_field).ok_or_else(|| {
            AdapterError::decode(&stream.name, format!("record without {:?}", self.bundle.id_field))
        })?;
        Ok((id, json_timestamp(record, &self.bundle.event_time_field)))
    }
}

#[async_trait]
impl VendorAdapter for FixtureAdapter {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn streams(&self) -> &[StreamSpec] {
        &self.bundle.streams
    }

    async fn list_incremental(
        &self,
        account: &TenantAccount,
        stream: &StreamSpec,
        window: &TimeWindow,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page, AdapterError> {
        let mut in_window = Vec::new();
        for record in self.records(account, stream)? {
            let (id, event_at) = self.keyed(stream, record)?;
            let event_at = event_at.ok_or_else(|| {
                AdapterError::decode(&stream.name, format!("record {id} without event time"))
            })?;
            if window.contains(event_at) {
                in_window.push((event_at, id, record));
            }
        }
        in_window.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| AdapterError::decode(&stream.name, format!("bad cursor {c:?}")))?,
            None => 0,
        };
        let page_size = page_size.max(1);
        let end = (offset + page_size).min(in_window.len());
        let extracted_at = Utc::now();

        let mut rows = Vec::new();
        for (event_at, id, record) in in_window.iter().skip(offset).take(page_size) {
            rows.push(build_raw_row(account, stream, id.clone(), record, Some(*event_at), extracted_at)?);
        }
        Ok(Page {
            rows,
            next_cursor: (end < in_window.len()).then(|| end.to_string()),
        })
    }

    async fn list_full(
        &self,
        account: &TenantAccount,
        stream: &StreamSpec,
    ) -> Result<Page, AdapterError> {
        let extracted_at = Utc::now();
        let mut rows = Vec::new();
        for record in self.records(account, stream)? {
            let (id, event_at) = self.keyed(stream, record)?;
            rows.push(build_raw_row(account, stream, id, record, event_at, extracted_at)?);
        }
        Ok(Page {
            rows,
            next_cursor: None,
        })
    }
}
