//! Adapter for cursor-paginated JSON APIs whose shape is described in `platforms.yaml`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rawpull_core::{TenantAccount, TimeWindow};
use rawpull_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{
    build_raw_row, default_enabled, extract_after_cursor, json_id, json_timestamp, AdapterError,
    Page, StreamSpec, VendorAdapter,
};

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_header")]
    pub header: String,
    #[serde(default = "default_auth_credential")]
    pub credential: String,
    /// Prepended to the credential value, e.g. `"Bearer "`.
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonApiConfig {
    pub platform: String,
    pub base_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default = "default_since_param")]
    pub since_param: String,
    #[serde(default = "default_until_param")]
    pub until_param: String,
    #[serde(default = "default_page_size_param")]
    pub page_size_param: String,
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,
    #[serde(default = "default_data_field")]
    pub data_field: String,
    #[serde(default = "default_next_field")]
    pub next_field: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default)]
    pub event_time_field: Option<String>,
    pub streams: Vec<StreamSpec>,
}

fn default_auth_header() -> String {
    "Authorization".to_string()
}

fn default_auth_credential() -> String {
    "access_token".to_string()
}

fn default_since_param() -> String {
    "since".to_string()
}

fn default_until_param() -> String {
    "until".to_string()
}

fn default_page_size_param() -> String {
    "limit".to_string()
}

fn default_cursor_param() -> String {
    "after".to_string()
}

fn default_data_field() -> String {
    "results".to_string()
}

fn default_next_field() -> String {
    "next".to_string()
}

fn default_id_field() -> String {
    "id".to_string()
}

#[derive(Debug)]
pub struct JsonApiAdapter {
    config: JsonApiConfig,
    http: Arc<HttpFetcher>,
}

impl JsonApiAdapter {
    pub fn new(config: JsonApiConfig, http: Arc<HttpFetcher>) -> Self {
        Self { config, http }
    }

    fn endpoint(&self, stream: &StreamSpec) -> String {
        let path = stream.path.as_deref().unwrap_or(&stream.name);
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn headers(&self, account: &TenantAccount) -> Result<Vec<(String, String)>, AdapterError> {
        let Some(auth) = &self.config.auth else {
            return Ok(Vec::new());
        };
        let value = account
            .credentials
            .get(&auth.credential)
            .ok_or_else(|| AdapterError::MissingCredential(auth.credential.clone()))?;
        Ok(vec![(auth.header.clone(), format!("{}{}", auth.prefix, value))])
    }

    fn ensure_stream<'a>(&self, stream: &'a StreamSpec) -> Result<&'a StreamSpec, AdapterError> {
        if self.config.streams.iter().any(|s| s.name == stream.name) {
            Ok(stream)
        } else {
            Err(AdapterError::UnsupportedStream(stream.name.clone()))
        }
    }

    /// Decodes `{ <data_field>: [...], <next_field>: "..." }`; a bare array is accepted too.
    pub fn parse_page(
        &self,
        account: &TenantAccount,
        stream: &StreamSpec,
        body: &[u8],
    ) -> Result<Page, AdapterError> {
        let value: JsonValue =
            serde_json::from_slice(body).map_err(|e| AdapterError::decode(&stream.name, e))?;
        let (records, next) = match &value {
            JsonValue::Array(records) => (records.as_slice(), None),
            JsonValue::Object(map) => {
                let records = map
                    .get(&self.config.data_field)
                    .and_then(JsonValue::as_array)
                    .ok_or_else(|| {
                        AdapterError::decode(
                            &stream.name,
                            format!("missing array field {:?}", self.config.data_field),
                        )
                    })?;
                let next = map.get(&self.config.next_field).and_then(JsonValue::as_str);
                (records.as_slice(), next)
            }
            _ => return Err(AdapterError::decode(&stream.name, "unexpected response shape")),
        };

        let extracted_at = Utc::now();
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let raw_id = json_id(record, &self.config.id_field).ok_or_else(|| {
                AdapterError::decode(
                    &stream.name,
                    format!("record without {:?}", self.config.id_field),
                )
            })?;
            let event_at = self
                .config
                .event_time_field
                .as_deref()
                .and_then(|field| json_timestamp(record, field));
            rows.push(build_raw_row(account, stream, raw_id, record, event_at, extracted_at)?);
        }

        Ok(Page {
            rows,
            next_cursor: next.and_then(|n| extract_after_cursor(n, &self.config.cursor_param)),
        })
    }
}

#[async_trait]
impl VendorAdapter for JsonApiAdapter {
    fn platform(&self) -> &str {
        &self.config.platform
    }

    fn streams(&self) -> &[StreamSpec] {
        &self.config.streams
    }

    async fn list_incremental(
        &self,
        account: &TenantAccount,
        stream: &StreamSpec,
        window: &TimeWindow,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page, AdapterError> {
        let stream = self.ensure_stream(stream)?;
        let mut query = vec![
            (self.config.since_param.clone(), window.since().to_rfc3339()),
            (self.config.until_param.clone(), window.until().to_rfc3339()),
            (self.config.page_size_param.clone(), page_size.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push((self.config.cursor_param.clone(), cursor.to_string()));
        }
        let headers = self.headers(account)?;
        let resp = self
            .http
            .get(&self.config.platform, &self.endpoint(stream), &query, &headers)
            .await?;
        self.parse_page(account, stream, &resp.body)
    }

    async fn list_full(
        &self,
        account: &TenantAccount,
        stream: &StreamSpec,
    ) -> Result<Page, AdapterError> {
        let stream = self.ensure_stream(stream)?;
        let headers = self.headers(account)?;
        let resp = self
            .http
            .get(&self.config.platform, &self.endpoint(stream), &[], &headers)
            .await?;
        let mut page = self.parse_page(account, stream, &resp.body)?;
        page.next_cursor = None;
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncMode;
    use rawpull_core::Credentials;
    use rawpull_storage::HttpClientConfig;

    fn adapter() -> JsonApiAdapter {
        let config: JsonApiConfig = serde_yaml::from_str(
            r#"
platform: survey
base_url: https://api.vendor.test/v1/
auth:
  prefix: "Token "
event_time_field: inserted_at
streams:
  - name: responses
    mode: incremental
    raw_table: raw_survey_responses
    path: /responses
"#,
        )
        .unwrap();
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        JsonApiAdapter::new(config, http)
    }

    fn account(with_token: bool) -> TenantAccount {
        let mut credentials = Credentials::default();
        if with_token {
            credentials.insert("access_token", "t0k");
        }
        TenantAccount {
            tenant_id: 5,
            account_id: "acct".into(),
            platform: "survey".into(),
            credentials,
        }
    }

    fn responses() -> StreamSpec {
        StreamSpec {
            name: "responses".into(),
            mode: SyncMode::Incremental,
            raw_table: "raw_survey_responses".into(),
            path: Some("/responses".into()),
        }
    }

    #[test]
    fn endpoint_joins_base_and_path() {
        assert_eq!(adapter().endpoint(&responses()), "https://api.vendor.test/v1/responses");
    }

    #[test]
    fn auth_header_uses_configured_credential() {
        let a = adapter();
        let headers = a.headers(&account(true)).unwrap();
        assert_eq!(headers, vec![("Authorization".to_string(), "Token t0k".to_string())]);
        assert!(matches!(
            a.headers(&account(false)),
            Err(AdapterError::MissingCredential(_))
        ));
    }

    #[test]
    fn page_envelope_is_decoded() {
        let body = br#"{
            "results": [
                {"id": 1, "inserted_at": "2025-01-06T10:00:00Z"},
                {"id": "b", "inserted_at": "2025-01-06T11:00:00Z"}
            ],
            "next": "https://api.vendor.test/v1/responses?limit=2&after=c2"
        }"#;
        let page = adapter().parse_page(&account(true), &responses(), body).unwrap();
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.rows[0].raw_id, "1");
        assert_eq!(page.next_cursor.as_deref(), Some("c2"));
    }

    #[test]
    fn last_page_has_no_cursor() {
        let body = br#"{"results": [], "next": null}"#;
        let page = adapter().parse_page(&account(true), &responses(), body).unwrap();
        assert!(page.rows.is_empty());
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn schema_drift_is_a_decode_error() {
        let a = adapter();
        let missing_data = a.parse_page(&account(true), &responses(), br#"{"items": []}"#);
        assert!(matches!(missing_data, Err(AdapterError::Decode { .. })));
        let missing_id = a.parse_page(&account(true), &responses(), br#"{"results": [{"x": 1}]}"#);
        assert!(matches!(missing_id, Err(AdapterError::Decode { .. })));
        let not_json = a.parse_page(&account(true), &responses(), b"<html>");
        assert!(matches!(not_json, Err(AdapterError::Decode { .. })));
    }

    #[tokio::test]
    async fn unknown_stream_is_rejected_before_any_request() {
        let a = adapter();
        let other = StreamSpec {
            name: "orders".into(),
            mode: SyncMode::FullRefresh,
            raw_table: "raw_orders".into(),
            path: None,
        };
        let err = a.list_full(&account(true), &other).await.unwrap_err();
        assert!(matches!(err, AdapterError::UnsupportedStream(_)));
    }
}
