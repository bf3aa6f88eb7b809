//! Persistence (sync state, leases, locks, raw warehouse) and HTTP plumbing for rawpull.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub mod lock;
pub mod state;
pub mod warehouse;

pub use lock::{LockError, LockInfo, Locker, MemoryLocker, PgLocker};
pub use state::{
    try_lease, Lease, LeaseGuard, LeaseOutcome, MemoryStateStore, PgStateStore, StateStore,
    StoreError, StoredStateRow,
};
pub use warehouse::{MemoryRawSink, PgRawSink, RawSink, SinkError, UpsertReport};

pub const CRATE_NAME: &str = "rawpull-storage";

const MIGRATION_LOCK_KEY: &str = "rawpull:migrate";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub async fn connect_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

/// Applies embedded migrations while holding the `distributed_locks` row for migrations, so
/// concurrently started instances do not race on DDL.
pub async fn migrate_with_lock(pool: &PgPool) -> anyhow::Result<()> {
    // The lock table itself has to exist before it can guard anything.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS distributed_locks (
            lock_key   TEXT        PRIMARY KEY,
            owner_id   TEXT        NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("bootstrapping distributed_locks")?;

    let locker = PgLocker::new(pool.clone());
    let clock = rawpull_core::SystemClock;
    let owner = Uuid::new_v4().to_string();
    locker
        .lock(&clock, MIGRATION_LOCK_KEY, &owner, chrono::Duration::minutes(10), 600)
        .await
        .context("acquiring migration lock")?;
    info!(owner = %owner, "migration lock acquired");

    let result = sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("running migrations");

    if let Err(err) = locker.unlock(MIGRATION_LOCK_KEY, &owner).await {
        tracing::warn!(error = %err, "releasing migration lock");
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else if let Some(status) = err.status() {
        classify_status(status)
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(15),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_platform_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_platform_concurrency: 4,
        }
    }
}

/// Token bucket used to space requests. With capacity 1 it degenerates into a fixed minimum
/// gap between consecutive calls.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    /// One request every `1000 / rate_per_second` milliseconds.
    pub fn per_second(rate_per_second: u32) -> Self {
        let gap = Duration::from_millis(1000 / u64::from(rate_per_second.max(1)));
        Self::new(1, gap)
    }

    pub fn refill_every(&self) -> Duration {
        self.refill_every
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if self.refill_every.is_zero() {
                return;
            }
            if elapsed >= self.refill_every {
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client is shutting down")]
    Closed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Closed => RetryDisposition::NonRetryable,
        }
    }
}

/// Shared HTTP client. Every request is bounded by a global and a per-platform concurrency
/// limit; retries are left to the caller, which knows how far a slice has progressed.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_platform_limit: usize,
    per_platform: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_platform_limit: config.per_platform_concurrency.max(1),
            per_platform: Mutex::new(HashMap::new()),
        })
    }

    async fn per_platform_semaphore(&self, platform: &str) -> Arc<Semaphore> {
        let mut map = self.per_platform.lock().await;
        map.entry(platform.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_platform_limit)))
            .clone()
    }

    pub async fn get(
        &self,
        platform: &str,
        url: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_platform = self.per_platform_semaphore(platform).await;
        let _platform = per_platform.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", platform, url);
        async move {
            let mut request = self.client.get(url).query(query);
            for (name, value) in headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                debug!(status = status.as_u16(), "vendor returned error status");
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
