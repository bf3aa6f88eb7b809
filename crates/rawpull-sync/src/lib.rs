//! Sync orchestration: configuration, tenant catalog, slice fetching, the per-stream ingestion
//! driver and the worker pool that fans tenants out.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rawpull_adapters::AdapterRegistry;
use rawpull_core::{Clock, SystemClock};
use rawpull_storage::{
    connect_pool, migrate_with_lock, HttpFetcher, PgRawSink, PgStateStore, RawSink, StateStore,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod fetcher;

pub use catalog::{CatalogError, PgCatalog, TenantCatalog, YamlCatalog};
pub use config::{ConfigError, SyncConfig, MAX_DAYS};
pub use dispatcher::{RunStats, RunStatsSnapshot, SyncTask, TenantDispatcher};
pub use driver::{
    content_digest, DriverError, DriverSettings, IngestionDriver, RunOutcome, SkipReason,
};
pub use fetcher::{FetchSettings, SliceError, SliceFetcher};

pub const CRATE_NAME: &str = "rawpull-sync";

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub platforms: usize,
    pub tasks: usize,
    pub stats: RunStatsSnapshot,
}

pub struct SyncJob {
    config: SyncConfig,
    catalog: Arc<dyn TenantCatalog>,
    registry: AdapterRegistry,
    dispatcher: TenantDispatcher,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SyncJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncJob")
            .field("registry", &self.registry)
            .field("workers", &self.dispatcher.workers())
            .finish()
    }
}

impl SyncJob {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn RawSink>,
        catalog: Arc<dyn TenantCatalog>,
        registry: AdapterRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let driver = IngestionDriver::new(store, sink, Arc::clone(&clock), config.driver_settings());
        let dispatcher = TenantDispatcher::new(Arc::new(driver), config.workers);
        Self {
            config,
            catalog,
            registry,
            dispatcher,
            clock,
        }
    }

    /// Connects to Postgres, applies migrations, loads `platforms.yaml` and the tenant catalog
    /// and makes sure every raw table exists.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let pool = connect_pool(&config.database_url, config.db_max_connections).await?;
        migrate_with_lock(&pool).await?;

        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let registry = AdapterRegistry::from_platforms_file(&config.platforms_file, http)
            .with_context(|| format!("loading {}", config.platforms_file.display()))?;

        let sink = PgRawSink::new(pool.clone(), config.upsert_batch_size);
        for (platform, stream) in registry.streams() {
            sink.ensure_table(&stream.raw_table)
                .await
                .with_context(|| format!("preparing raw table for {platform}/{}", stream.name))?;
        }

        let catalog: Arc<dyn TenantCatalog> = match &config.tenants_file {
            Some(path) => Arc::new(YamlCatalog::from_path(path)?),
            None => Arc::new(PgCatalog::new(pool.clone())),
        };

        Ok(Self::new(
            config,
            Arc::new(PgStateStore::new(pool)),
            Arc::new(sink),
            catalog,
            registry,
            Arc::new(SystemClock),
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One task per enabled account and stream. Catalog platforms without an adapter are skipped.
    pub async fn plan_tasks(&self) -> Result<(usize, Vec<SyncTask>)> {
        let mut platforms = 0;
        let mut tasks = Vec::new();
        for platform in self.catalog.platforms().await.context("listing catalog platforms")? {
            let Some(adapter) = self.registry.adapter_for_platform(&platform) else {
                warn!(platform, "no adapter registered for platform; skipping");
                continue;
            };
            platforms += 1;
            let accounts = self
                .catalog
                .accounts_for_platform(&platform)
                .await
                .with_context(|| format!("listing accounts for {platform}"))?;
            for account in accounts {
                for stream in adapter.streams() {
                    tasks.push(SyncTask {
                        account: account.clone(),
                        adapter: Arc::clone(&adapter),
                        stream: stream.clone(),
                    });
                }
            }
        }
        Ok((platforms, tasks))
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = self.clock.now();
        let run_id = Uuid::new_v4();
        let (platforms, tasks) = self.plan_tasks().await?;
        let task_count = tasks.len();
        info!(%run_id, platforms, tasks = task_count, workers = self.dispatcher.workers(), "sync run started");

        let stats = self.dispatcher.dispatch(tasks).await;
        let finished_at = self.clock.now();
        info!(
            %run_id,
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            "sync run finished"
        );
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            platforms,
            tasks: task_count,
            stats,
        })
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.as_str();
        let job = Arc::clone(self);
        let scheduled = Job::new_async(cron, move |_uuid, _l| {
            let job = Arc::clone(&job);
            Box::pin(async move {
                match job.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync completed"),
                    Err(err) => error!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(scheduled).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let job = SyncJob::from_config(config).await?;
    job.run_once().await
}
