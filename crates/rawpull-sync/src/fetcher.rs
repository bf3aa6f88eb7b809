//! Pulls one slice (or a whole full-refresh stream) out of a vendor adapter: pagination,
//! request spacing, the page cap and retries of transient failures.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rawpull_adapters::{AdapterError, Page, StreamSpec, VendorAdapter};
use rawpull_core::{RawRow, TenantAccount, TimeWindow};
use rawpull_storage::{BackoffPolicy, TokenBucket};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSettings {
    pub page_size: usize,
    pub max_pages: usize,
    pub rate_per_second: u32,
    pub backoff: BackoffPolicy,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 1000,
            rate_per_second: 10,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SliceError {
    #[error("{stream}: more than {max_pages} pages between {since} and {until}")]
    PageCap {
        stream: String,
        max_pages: usize,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    },
    #[error("{stream}: adapter failed after {attempts} attempt(s): {source}")]
    Adapter {
        stream: String,
        attempts: usize,
        #[source]
        source: AdapterError,
    },
}

pub struct SliceFetcher {
    adapter: Arc<dyn VendorAdapter>,
    settings: FetchSettings,
    bucket: TokenBucket,
}

impl std::fmt::Debug for SliceFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceFetcher")
            .field("platform", &self.adapter.platform())
            .field("settings", &self.settings)
            .finish()
    }
}

impl SliceFetcher {
    /// One fetcher serves one stream run; its token bucket spaces that stream's requests.
    pub fn new(adapter: Arc<dyn VendorAdapter>, settings: FetchSettings) -> Self {
        Self {
            adapter,
            bucket: TokenBucket::per_second(settings.rate_per_second),
            settings,
        }
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Every row of `window`, following cursors until the vendor reports no next page.
    pub async fn fetch_slice(
        &self,
        account: &TenantAccount,
        stream: &StreamSpec,
        window: &TimeWindow,
    ) -> Result<Vec<RawRow>, SliceError> {
        let mut rows = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            if pages >= self.settings.max_pages {
                return Err(SliceError::PageCap {
                    stream: stream.name.clone(),
                    max_pages: self.settings.max_pages,
                    since: window.since(),
                    until: window.until(),
                });
            }
            let current = cursor.as_deref();
            let page = self
                .with_retry(stream, move || {
                    self.adapter.list_incremental(
                        account,
                        stream,
                        window,
                        current,
                        self.settings.page_size,
                    )
                })
                .await?;
            pages += 1;
            rows.extend(page.rows);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(stream = %stream.name, pages, rows = rows.len(), "slice fetched");
        Ok(rows)
    }

    pub async fn fetch_full(
        &self,
        account: &TenantAccount,
        stream: &StreamSpec,
    ) -> Result<Vec<RawRow>, SliceError> {
        let page = self
            .with_retry(stream, move || self.adapter.list_full(account, stream))
            .await?;
        debug!(stream = %stream.name, rows = page.rows.len(), "full refresh fetched");
        Ok(page.rows)
    }

    async fn with_retry<F, Fut>(&self, stream: &StreamSpec, mut call: F) -> Result<Page, SliceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Page, AdapterError>>,
    {
        let max_retries = self.settings.backoff.max_retries;
        let mut attempt = 0usize;
        loop {
            self.bucket.take().await;
            match call().await {
                Ok(page) => return Ok(page),
                Err(err) if err.is_retryable() && attempt < max_retries => {
                    let delay = self.settings.backoff.delay_for_attempt(attempt);
                    warn!(
                        stream = %stream.name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient adapter failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(SliceError::Adapter {
                        stream: stream.name.clone(),
                        attempts: attempt + 1,
                        source,
                    })
                }
            }
        }
    }
}
