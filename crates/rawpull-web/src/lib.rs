//! JSON read API for the operator dashboard: per-tenant series verdicts and sync-state rows.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rawpull_adapters::{AdapterRegistry, StreamSpec, SyncMode};
use rawpull_core::{Clock, SlicePlanner, StateDefaults, SyncStatus, SystemClock};
use rawpull_storage::{connect_pool, migrate_with_lock, HttpFetcher, PgStateStore, StateStore};
use rawpull_sync::{ConfigError, SyncConfig, MAX_DAYS};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;

pub mod analyzer;
pub mod source;

pub use analyzer::{
    classify, classify_with_context, fill_missing_days, sort_for_dashboard, AnalyzerConfig, Level,
    TenantSeries, Verdict, CONCAVE_DIP, ZERO_DROP,
};
pub use source::{series_window, DailyCount, MemorySeriesSource, PgSeriesSource, SeriesError, SeriesSource};

pub const CRATE_NAME: &str = "rawpull-web";
/// Longest `?days=` window served unless the configured default is longer.
pub const MAX_SERIES_DAYS: i64 = 366;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub series_days: i64,
    /// Verdicts older than this are recomputed on the next request.
    pub cache_ttl: Duration,
    pub analyzer: AnalyzerConfig,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            series_days: 90,
            cache_ttl: Duration::hours(1),
            analyzer: AnalyzerConfig::default(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| ConfigError::Parse {
            name: name.to_string(),
            value: raw,
        }),
        _ => Ok(default),
    }
}

impl WebConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            port: parse_env(&lookup, "RAWPULL_WEB_PORT", d.port)?,
            series_days: parse_env(&lookup, "RAWPULL_SERIES_DAYS", d.series_days)?,
            cache_ttl: Duration::seconds(parse_env(
                &lookup,
                "RAWPULL_SERIES_CACHE_TTL_SECS",
                d.cache_ttl.num_seconds(),
            )?),
            analyzer: AnalyzerConfig {
                suppress_small_series: parse_env(
                    &lookup,
                    "RAWPULL_SUPPRESS_SMALL_SERIES",
                    d.analyzer.suppress_small_series,
                )?,
                ..d.analyzer
            },
        };
        if config.series_days < 1 {
            return Err(ConfigError::Invalid("RAWPULL_SERIES_DAYS must be at least 1".into()));
        }
        if config.series_days > MAX_DAYS {
            return Err(ConfigError::Invalid(format!("RAWPULL_SERIES_DAYS exceeds {MAX_DAYS}")));
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
struct CachedVerdicts {
    computed_at: DateTime<Utc>,
    tenants: Arc<Vec<TenantSeries>>,
}

pub struct AppState {
    pub config: WebConfig,
    /// `(platform, stream)` pairs the dashboard can chart.
    pub streams: Vec<(String, StreamSpec)>,
    pub series: Arc<dyn SeriesSource>,
    pub store: Arc<dyn StateStore>,
    pub clock: Arc<dyn Clock>,
    cache: RwLock<HashMap<(String, i64), CachedVerdicts>>,
}

impl AppState {
    pub fn new(
        config: WebConfig,
        streams: Vec<(String, StreamSpec)>,
        series: Arc<dyn SeriesSource>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            streams,
            series,
            store,
            clock,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Requested window, clamped so the cache holds a bounded set of keys.
    fn window_days(&self, requested: Option<i64>) -> i64 {
        let max = self.config.series_days.max(MAX_SERIES_DAYS);
        requested.unwrap_or(self.config.series_days).clamp(1, max)
    }

    fn find_stream(&self, name: &str, platform: Option<&str>) -> Option<&(String, StreamSpec)> {
        self.streams
            .iter()
            .find(|(p, s)| s.name == name && platform.map_or(true, |want| p == want))
    }

    async fn verdicts(
        &self,
        platform: &str,
        spec: &StreamSpec,
        days: i64,
        refresh: bool,
    ) -> Result<Arc<Vec<TenantSeries>>, SeriesError> {
        let key = (spec.raw_table.clone(), days);
        let now = self.clock.now();
        if !refresh {
            if let Some(cached) = self.cache.read().await.get(&key) {
                if now - cached.computed_at < self.config.cache_ttl {
                    return Ok(Arc::clone(&cached.tenants));
                }
            }
        }

        let tenants = Arc::new(self.compute_verdicts(platform, spec, days, now).await?);
        self.cache.write().await.insert(
            key,
            CachedVerdicts {
                computed_at: now,
                tenants: Arc::clone(&tenants),
            },
        );
        Ok(tenants)
    }

    async fn tenant_totals(&self, platform: &str, days: i64, now: DateTime<Utc>) -> Result<HashMap<i64, i64>, SeriesError> {
        let mut totals = HashMap::new();
        for (_, spec) in self.streams.iter().filter(|(p, _)| p == platform) {
            for point in self.series.daily_counts(&spec.raw_table, days, now).await? {
                *totals.entry(point.tenant_id).or_insert(0) += point.count;
            }
        }
        Ok(totals)
    }

    async fn compute_verdicts(
        &self,
        platform: &str,
        spec: &StreamSpec,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<TenantSeries>, SeriesError> {
        let analyzer = &self.config.analyzer;
        let counts = self.series.daily_counts(&spec.raw_table, days, now).await?;
        let totals = if analyzer.suppress_small_series {
            self.tenant_totals(platform, days, now).await?
        } else {
            HashMap::new()
        };

        let mut by_tenant = BTreeMap::<i64, Vec<(NaiveDate, i64)>>::new();
        for point in counts {
            by_tenant.entry(point.tenant_id).or_default().push((point.day, point.count));
        }

        let (_, end) = series_window(days, now);
        let mut tenants = Vec::with_capacity(by_tenant.len());
        for (tenant_id, points) in by_tenant {
            let Some(first) = points.iter().map(|(day, _)| *day).min() else {
                continue;
            };
            let (dates, counts) = fill_missing_days(&points, first, end);
            let own_total = counts.iter().sum::<i64>();
            let tenant_total = totals.get(&tenant_id).copied().unwrap_or(own_total);
            let verdict = classify_with_context(&counts, tenant_total, analyzer);
            tenants.push(TenantSeries {
                tenant_id,
                dates,
                counts,
                verdict,
            });
        }
        sort_for_dashboard(&mut tenants);
        info!(platform, stream = %spec.name, days, tenants = tenants.len(), "series verdicts computed");
        Ok(tenants)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/streams", get(streams_handler))
        .route("/api/series/{stream}", get(series_handler))
        .route("/api/series/{stream}/{tenant_id}", get(tenant_series_handler))
        .route("/api/sync-state", get(sync_state_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let sync = SyncConfig::from_env()?;
    let config = WebConfig::from_env()?;
    let pool = connect_pool(&sync.database_url, sync.db_max_connections).await?;
    migrate_with_lock(&pool).await?;
    let http = Arc::new(HttpFetcher::new(sync.http_client_config())?);
    let registry = AdapterRegistry::from_platforms_file(&sync.platforms_file, http)
        .with_context(|| format!("loading {}", sync.platforms_file.display()))?;

    let port = config.port;
    let state = AppState::new(
        config,
        registry.streams(),
        Arc::new(PgSeriesSource::new(pool.clone())),
        Arc::new(PgStateStore::new(pool)),
        Arc::new(SystemClock),
    );
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct StreamView {
    platform: String,
    stream: String,
    mode: SyncMode,
    raw_table: String,
}

async fn streams_handler(State(state): State<Arc<AppState>>) -> Json<Vec<StreamView>> {
    Json(
        state
            .streams
            .iter()
            .map(|(platform, spec)| StreamView {
                platform: platform.clone(),
                stream: spec.name.clone(),
                mode: spec.mode,
                raw_table: spec.raw_table.clone(),
            })
            .collect(),
    )
}

#[derive(Debug, Default, Deserialize)]
struct SeriesQuery {
    days: Option<i64>,
    #[serde(default)]
    refresh: bool,
    platform: Option<String>,
}

#[derive(Debug, Serialize)]
struct SeriesView {
    platform: String,
    stream: String,
    raw_table: String,
    days: i64,
    tenants: Vec<TenantSeries>,
}

async fn series_handler(
    State(state): State<Arc<AppState>>,
    Path(stream): Path<String>,
    Query(query): Query<SeriesQuery>,
) -> Response {
    let Some((platform, spec)) = state.find_stream(&stream, query.platform.as_deref()) else {
        return not_found(format!("unknown stream {stream}"));
    };
    let days = state.window_days(query.days);
    match state.verdicts(platform, spec, days, query.refresh).await {
        Ok(tenants) => Json(SeriesView {
            platform: platform.clone(),
            stream: spec.name.clone(),
            raw_table: spec.raw_table.clone(),
            days,
            tenants: tenants.to_vec(),
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn tenant_series_handler(
    State(state): State<Arc<AppState>>,
    Path((stream, tenant_id)): Path<(String, i64)>,
    Query(query): Query<SeriesQuery>,
) -> Response {
    let Some((platform, spec)) = state.find_stream(&stream, query.platform.as_deref()) else {
        return not_found(format!("unknown stream {stream}"));
    };
    let days = state.window_days(query.days);
    match state.verdicts(platform, spec, days, query.refresh).await {
        Ok(tenants) => match tenants.iter().find(|t| t.tenant_id == tenant_id) {
            Some(series) => Json(series.clone()).into_response(),
            None => not_found(format!("no rows for tenant {tenant_id} in {stream}")),
        },
        Err(err) => server_error(err.into()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct SyncStateQuery {
    platform: Option<String>,
}

#[derive(Debug, Serialize)]
struct SyncStateView {
    tenant_id: i64,
    account_id: String,
    platform: String,
    stream: String,
    is_running: bool,
    lease_started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    status: SyncStatus,
    message: String,
    record_count: i64,
    last_sync_time: Option<DateTime<Utc>>,
    current_slice_date: Option<DateTime<Utc>>,
    completed_slices: i64,
    total_slices: i64,
    progress: f64,
}

async fn sync_state_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncStateQuery>,
) -> Response {
    let rows = match state.store.list_states(query.platform.as_deref()).await {
        Ok(rows) => rows,
        Err(err) => return server_error(err.into()),
    };
    let now = state.clock.now();
    let planner = SlicePlanner::default();
    let views = rows
        .into_iter()
        .map(|row| {
            let decoded = rawpull_core::state::decode(row.sync_blob.as_deref(), now, StateDefaults::default());
            SyncStateView {
                progress: planner.progress(&decoded),
                tenant_id: row.key.tenant_id,
                account_id: row.key.account_id,
                platform: row.key.platform,
                stream: row.key.stream,
                is_running: row.is_running,
                lease_started_at: row.lease_started_at,
                updated_at: row.updated_at,
                status: decoded.status,
                message: decoded.message,
                record_count: decoded.record_count,
                last_sync_time: decoded.last_sync_time,
                current_slice_date: decoded.current_slice_date,
                completed_slices: decoded.completed_slices,
                total_slices: decoded.total_slices,
            }
        })
        .collect::<Vec<_>>();
    Json(views).into_response()
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use rawpull_core::{FixedClock, RawRow, SyncState, TenantStreamKey};
    use rawpull_storage::{MemoryRawSink, MemoryStateStore, RawSink};
    use serde_json::Value;
    use tower::ServiceExt;

    const TABLE: &str = "raw_fixture_survey_responses";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 12, 0, 0).unwrap()
    }

    fn streams() -> Vec<(String, StreamSpec)> {
        vec![(
            "fixture_survey".to_string(),
            StreamSpec {
                name: "responses".into(),
                mode: SyncMode::Incremental,
                raw_table: TABLE.into(),
                path: None,
            },
        )]
    }

    /// One row per unit of `counts[i]`, dated 2025-01-01 plus `i` days.
    fn rows_for(tenant_id: i64, counts: &[usize]) -> Vec<RawRow> {
        let first = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        let mut rows = Vec::new();
        for (offset, count) in counts.iter().enumerate() {
            let event_at = first + Duration::days(offset as i64);
            for n in 0..*count {
                rows.push(RawRow {
                    tenant_id,
                    raw_id: format!("{offset}-{n}"),
                    payload: b"{}".to_vec(),
                    extracted_at: event_at,
                    loaded_at: now(),
                    meta: serde_json::json!({ "event_at": event_at.to_rfc3339() }),
                    generation_id: 0,
                });
            }
        }
        rows
    }

    struct Fixture {
        sink: Arc<MemoryRawSink>,
        store: Arc<MemoryStateStore>,
        router: Router,
    }

    async fn fixture() -> Fixture {
        let sink = Arc::new(MemoryRawSink::default());
        sink.upsert(TABLE, &rows_for(1, &[10, 10, 10, 0, 0, 0, 10, 10, 10])).await.unwrap();
        sink.upsert(TABLE, &rows_for(2, &[10, 10, 10, 10, 10, 0, 10, 10, 10])).await.unwrap();
        sink.upsert(TABLE, &rows_for(3, &[5; 9])).await.unwrap();
        let store = Arc::new(MemoryStateStore::new());
        let state = AppState::new(
            WebConfig::default(),
            streams(),
            Arc::new(MemorySeriesSource::new(Arc::clone(&sink))),
            store.clone(),
            Arc::new(FixedClock::new(now())),
        );
        Fixture {
            sink,
            store,
            router: app(state),
        }
    }

    async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
        let resp = router
            .clone()
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn tenant_ids(body: &Value) -> Vec<i64> {
        body["tenants"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["tenant_id"].as_i64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn handler_smoke_healthz_and_streams() {
        let f = fixture().await;
        let (status, body) = get_json(&f.router, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = get_json(&f.router, "/api/streams").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["platform"], "fixture_survey");
        assert_eq!(body[0]["stream"], "responses");
        assert_eq!(body[0]["mode"], "incremental");
        assert_eq!(body[0]["raw_table"], TABLE);
    }

    #[tokio::test]
    async fn series_are_ranked_worst_first() {
        let f = fixture().await;
        let (status, body) = get_json(&f.router, "/api/series/responses").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["days"], 90);
        assert_eq!(tenant_ids(&body), vec![1, 2, 3]);

        let tenants = body["tenants"].as_array().unwrap();
        assert_eq!(tenants[0]["verdict"]["level"], "critical");
        assert_eq!(tenants[0]["verdict"]["concave_count"], 3);
        assert_eq!(
            tenants[0]["verdict"]["processed"],
            serde_json::json!([10, 10, 10, -200, -200, -200, 10, 10, 10])
        );
        assert_eq!(tenants[0]["dates"][0], "2025-01-01");
        assert_eq!(tenants[1]["verdict"]["level"], "warning");
        assert_eq!(tenants[1]["verdict"]["processed"][5], -100);
        assert_eq!(tenants[2]["verdict"]["level"], "normal");
    }

    #[tokio::test]
    async fn cached_verdicts_are_reused_until_refresh() {
        let f = fixture().await;
        let (_, first) = get_json(&f.router, "/api/series/responses").await;
        assert_eq!(tenant_ids(&first), vec![1, 2, 3]);

        f.sink.upsert(TABLE, &rows_for(4, &[1, 0, 1])).await.unwrap();
        let (_, cached) = get_json(&f.router, "/api/series/responses").await;
        assert_eq!(tenant_ids(&cached), vec![1, 2, 3]);

        let (_, refreshed) = get_json(&f.router, "/api/series/responses?refresh=true").await;
        assert_eq!(tenant_ids(&refreshed), vec![1, 4, 2, 3]);

        let (_, narrower) = get_json(&f.router, "/api/series/responses?days=3").await;
        assert_eq!(narrower["days"], 3);
        assert_eq!(narrower["tenants"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn oversized_day_windows_are_clamped() {
        let f = fixture().await;
        let (status, body) = get_json(&f.router, "/api/series/responses?days=100000000000").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["days"], MAX_SERIES_DAYS);
        assert_eq!(tenant_ids(&body), vec![1, 2, 3]);

        let (status, body) = get_json(&f.router, "/api/series/responses/1?days=9223372036854775807").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tenant_id"], 1);

        let (_, body) = get_json(&f.router, "/api/series/responses?days=-5").await;
        assert_eq!(body["days"], 1);
    }

    #[tokio::test]
    async fn tenant_series_and_missing_resources() {
        let f = fixture().await;
        let (status, body) = get_json(&f.router, "/api/series/responses/2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tenant_id"], 2);
        assert_eq!(body["verdict"]["zero_days"], 1);

        let (status, _) = get_json(&f.router, "/api/series/responses/999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = get_json(&f.router, "/api/series/orders").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("orders"));
        let (status, _) = get_json(&f.router, "/api/series/responses?platform=other").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sync_state_rows_carry_decoded_status() {
        let f = fixture().await;
        let mut failed = SyncState::fresh(now(), StateDefaults::default());
        failed.mark_failed("vendor returned 403 for /responses", now());
        let key = TenantStreamKey::new(1, "demo-account", "fixture_survey", "responses");
        f.store
            .create_initial(&key, &rawpull_core::state::encode(&failed).unwrap(), now())
            .await
            .unwrap();
        let other = TenantStreamKey::new(9, "elsewhere", "other_vendor", "orders");
        f.store
            .create_initial(&other, &rawpull_core::state::encode(&SyncState::fresh(now(), StateDefaults::default())).unwrap(), now())
            .await
            .unwrap();

        let (status, body) = get_json(&f.router, "/api/sync-state?platform=fixture_survey").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], "FAILED");
        assert_eq!(rows[0]["message"], "vendor returned 403 for /responses");
        assert_eq!(rows[0]["is_running"], false);

        let (_, all) = get_json(&f.router, "/api/sync-state").await;
        assert_eq!(all.as_array().unwrap().len(), 2);
    }

    #[test]
    fn web_config_reads_overrides() {
        let config = WebConfig::from_lookup(|name| match name {
            "RAWPULL_WEB_PORT" => Some("9100".into()),
            "RAWPULL_SUPPRESS_SMALL_SERIES" => Some("true".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.series_days, 90);
        assert!(config.analyzer.suppress_small_series);

        let err = WebConfig::from_lookup(|name| (name == "RAWPULL_SERIES_DAYS").then(|| "0".into())).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = WebConfig::from_lookup(|name| (name == "RAWPULL_SERIES_DAYS").then(|| "100000000000".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
