//! Vendor adapter contract plus the configuration-driven and fixture-backed adapters.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rawpull_core::{RawRow, TenantAccount, TimeWindow};
use rawpull_storage::{FetchError, HttpFetcher, RetryDisposition};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub mod fixture;
pub mod json_api;

pub use fixture::{load_fixture_bundle, FixtureAdapter, FixtureBundle};
pub use json_api::{AuthConfig, JsonApiAdapter, JsonApiConfig};

pub const CRATE_NAME: &str = "rawpull-adapters";

/// Longest raw id stored verbatim; longer composite ids are replaced by their sha256.
pub const MAX_RAW_ID_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Incremental,
    FullRefresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    pub mode: SyncMode,
    pub raw_table: String,
    /// Endpoint path relative to the platform base url. Defaults to the stream name.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub rows: Vec<RawRow>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("decoding {stream} response: {message}")]
    Decode { stream: String, message: String },
    #[error("stream {0} is not supported by this adapter")]
    UnsupportedStream(String),
    #[error("missing credential {0}")]
    MissingCredential(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn decode(stream: &str, message: impl fmt::Display) -> Self {
        Self::Decode {
            stream: stream.to_string(),
            message: message.to_string(),
        }
    }

    /// Transport failures, 5xx, 408 and 429 are worth retrying; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(err) if err.disposition() == RetryDisposition::Retryable)
    }
}

#[async_trait]
pub trait VendorAdapter: Send + Sync {
    fn platform(&self) -> &str;

    fn streams(&self) -> &[StreamSpec];

    fn stream(&self, name: &str) -> Option<&StreamSpec> {
        self.streams().iter().find(|s| s.name == name)
    }

    /// One page of records whose event time falls in `window`.
    async fn list_incremental(
        &self,
        account: &TenantAccount,
        stream: &StreamSpec,
        window: &TimeWindow,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page, AdapterError>;

    /// The whole collection in one call.
    async fn list_full(
        &self,
        account: &TenantAccount,
        stream: &StreamSpec,
    ) -> Result<Page, AdapterError>;
}

/// Pulls the cursor out of a vendor `next` link. Plain tokens are passed through as-is.
pub fn extract_after_cursor(next: &str, cursor_param: &str) -> Option<String> {
    let next = next.trim();
    if next.is_empty() {
        return None;
    }
    let url = match reqwest::Url::parse(next) {
        Ok(url) => url,
        Err(_) if next.starts_with('/') || next.contains('?') => {
            match reqwest::Url::parse("http://relative.invalid/").and_then(|base| base.join(next)) {
                Ok(url) => url,
                Err(_) => return Some(next.to_string()),
            }
        }
        Err(_) => return Some(next.to_string()),
    };
    url.query_pairs()
        .find(|(name, _)| name == cursor_param)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

pub fn composite_raw_id(parts: &[&str]) -> String {
    let joined = parts.join(":");
    if joined.len() <= MAX_RAW_ID_LEN {
        joined
    } else {
        rawpull_storage::sha256_hex(joined.as_bytes())
    }
}

pub fn json_id(record: &JsonValue, field: &str) -> Option<String> {
    match record.get(field)? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn json_timestamp(record: &JsonValue, field: &str) -> Option<DateTime<Utc>> {
    let raw = record.get(field)?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Wraps one vendor record as a raw row. `meta.event_at` feeds the daily series on the read side.
pub fn build_raw_row(
    account: &TenantAccount,
    stream: &StreamSpec,
    raw_id: String,
    record: &JsonValue,
    event_at: Option<DateTime<Utc>>,
    extracted_at: DateTime<Utc>,
) -> Result<RawRow, AdapterError> {
    let payload = serde_json::to_vec(record).map_err(|e| AdapterError::decode(&stream.name, e))?;
    Ok(RawRow {
        tenant_id: account.tenant_id,
        raw_id: composite_raw_id(&[&raw_id]),
        payload,
        extracted_at,
        loaded_at: extracted_at,
        meta: serde_json::json!({
            "platform": account.platform,
            "account_id": account.account_id,
            "stream": stream.name,
            "event_at": event_at.map(|ts| ts.to_rfc3339()),
        }),
        generation_id: 0,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformsFile {
    pub platforms: Vec<PlatformConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlatformConfig {
    JsonApi(JsonApiConfig),
    Fixture(FixturePlatformConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixturePlatformConfig {
    pub platform: String,
    pub bundle: PathBuf,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

pub(crate) fn default_enabled() -> bool {
    true
}

impl PlatformConfig {
    pub fn platform(&self) -> &str {
        match self {
            Self::JsonApi(c) => &c.platform,
            Self::Fixture(c) => &c.platform,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Self::JsonApi(c) => c.enabled,
            Self::Fixture(c) => c.enabled,
        }
    }
}

pub fn load_platforms_file(path: impl AsRef<Path>) -> Result<PlatformsFile> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Adapters keyed by platform name.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn VendorAdapter>>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("platforms", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn VendorAdapter>) {
        self.adapters.insert(adapter.platform().to_string(), adapter);
    }

    pub fn adapter_for_platform(&self, platform: &str) -> Option<Arc<dyn VendorAdapter>> {
        self.adapters.get(platform).cloned()
    }

    pub fn platforms(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    /// Every `(platform, stream)` pair across registered adapters.
    pub fn streams(&self) -> Vec<(String, StreamSpec)> {
        self.adapters
            .iter()
            .flat_map(|(platform, adapter)| {
                adapter
                    .streams()
                    .iter()
                    .map(move |s| (platform.clone(), s.clone()))
            })
            .collect()
    }

    /// Builds adapters for every enabled platform in `platforms.yaml`. Relative fixture paths
    /// resolve against the file's directory.
    pub fn from_platforms_file(path: impl AsRef<Path>, http: Arc<HttpFetcher>) -> Result<Self> {
        let path = path.as_ref();
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let file = load_platforms_file(path)?;
        let mut registry = Self::new();

        for config in file.platforms {
            if !config.enabled() {
                warn!(platform = config.platform(), "platform disabled in config");
                continue;
            }
            match config {
                PlatformConfig::JsonApi(c) => {
                    registry.register(Arc::new(JsonApiAdapter::new(c, Arc::clone(&http))));
                }
                PlatformConfig::Fixture(c) => {
                    let bundle_path = if c.bundle.is_absolute() {
                        c.bundle.clone()
                    } else {
                        base_dir.join(&c.bundle)
                    };
                    let bundle = load_fixture_bundle(&bundle_path)?;
                    registry.register(Arc::new(FixtureAdapter::new(&c.platform, bundle)));
                }
            }
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rawpull_core::Credentials;
    use rawpull_storage::HttpClientConfig;
    use std::io::Write;

    fn account() -> TenantAccount {
        TenantAccount {
            tenant_id: 11,
            account_id: "acct".into(),
            platform: "survey".into(),
            credentials: Credentials::default(),
        }
    }

    #[test]
    fn cursor_is_read_from_next_link() {
        assert_eq!(
            extract_after_cursor("https://api.vendor.test/v1/responses?limit=100&after=abc%3D%3D", "after"),
            Some("abc==".to_string())
        );
        assert_eq!(
            extract_after_cursor("https://api.vendor.test/v1/responses?limit=100", "after"),
            None
        );
        assert_eq!(extract_after_cursor("opaque-token", "after"), Some("opaque-token".into()));
        assert_eq!(extract_after_cursor("   ", "after"), None);
    }

    #[test]
    fn cursor_is_read_from_relative_next_link() {
        assert_eq!(
            extract_after_cursor("/v1/responses?limit=100&after=x", "after"),
            Some("x".to_string())
        );
        assert_eq!(extract_after_cursor("?after=page-2", "after"), Some("page-2".to_string()));
        assert_eq!(extract_after_cursor("/v1/responses?limit=100", "after"), None);
    }

    #[test]
    fn long_composite_ids_are_hashed() {
        assert_eq!(composite_raw_id(&["a", "b"]), "a:b");
        let long = "x".repeat(300);
        let id = composite_raw_id(&[&long]);
        assert_eq!(id.len(), 64);
        assert_eq!(id, composite_raw_id(&[&long]));
    }

    #[test]
    fn ids_accept_strings_and_numbers() {
        let record = serde_json::json!({"id": 42, "uid": "r-1", "empty": ""});
        assert_eq!(json_id(&record, "id").as_deref(), Some("42"));
        assert_eq!(json_id(&record, "uid").as_deref(), Some("r-1"));
        assert_eq!(json_id(&record, "empty"), None);
        assert_eq!(json_id(&record, "missing"), None);
    }

    #[test]
    fn raw_row_carries_event_time_in_meta() {
        let stream = StreamSpec {
            name: "responses".into(),
            mode: SyncMode::Incremental,
            raw_table: "raw_responses".into(),
            path: None,
        };
        let record = serde_json::json!({"id": "r1", "inserted_at": "2025-01-06T10:00:00Z"});
        let event_at = json_timestamp(&record, "inserted_at");
        let row = build_raw_row(&account(), &stream, "r1".into(), &record, event_at, Utc::now()).unwrap();
        assert_eq!(row.tenant_id, 11);
        assert_eq!(row.raw_id, "r1");
        assert_eq!(row.meta["event_at"], "2025-01-06T10:00:00+00:00");
        assert_eq!(row.meta["stream"], "responses");
        let payload: JsonValue = serde_json::from_slice(&row.payload).unwrap();
        assert_eq!(payload, record);
    }

    #[test]
    fn decode_errors_are_not_retryable() {
        assert!(!AdapterError::decode("responses", "bad json").is_retryable());
        let http = AdapterError::Http(FetchError::HttpStatus {
            status: 502,
            url: "https://vendor.test".into(),
        });
        assert!(http.is_retryable());
        let auth = AdapterError::Http(FetchError::HttpStatus {
            status: 401,
            url: "https://vendor.test".into(),
        });
        assert!(!auth.is_retryable());
    }

    #[test]
    fn registry_loads_platforms_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle.json");
        std::fs::write(
            &bundle,
            r#"{"streams":[{"name":"responses","mode":"incremental","raw_table":"raw_fx_responses"}],"records":{"responses":[]}}"#,
        )
        .unwrap();
        let yaml = dir.path().join("platforms.yaml");
        let mut file = std::fs::File::create(&yaml).unwrap();
        write!(
            file,
            r#"
platforms:
  - kind: json_api
    platform: survey
    base_url: https://api.vendor.test/v1
    streams:
      - name: responses
        mode: incremental
        raw_table: raw_survey_responses
      - name: questions
        mode: full_refresh
        raw_table: raw_survey_questions
  - kind: fixture
    platform: fx
    bundle: bundle.json
  - kind: fixture
    platform: disabled_fx
    bundle: missing.json
    enabled: false
"#
        )
        .unwrap();

        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let registry = AdapterRegistry::from_platforms_file(&yaml, http).unwrap();
        assert_eq!(registry.platforms(), vec!["fx".to_string(), "survey".to_string()]);
        let survey = registry.adapter_for_platform("survey").unwrap();
        assert_eq!(survey.stream("questions").unwrap().mode, SyncMode::FullRefresh);
        assert_eq!(registry.streams().len(), 3);
        assert!(registry.adapter_for_platform("disabled_fx").is_none());
    }
}
