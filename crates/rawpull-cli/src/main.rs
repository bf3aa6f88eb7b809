use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rawpull_sync::{SyncConfig, SyncJob};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rawpull")]
#[command(about = "Tenant-parallel raw ingestion from vendor APIs")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass over every tenant and stream, then exit.
    Sync,
    /// Run syncs on `SYNC_CRON` until interrupted.
    Schedule,
    /// Apply database migrations.
    Migrate,
    /// Serve the dashboard JSON API.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rawpull=debug"));
    let json = std::env::var("RAWPULL_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = rawpull_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} platforms={} tasks={} succeeded={} failed={} skipped={}",
                summary.run_id,
                summary.platforms,
                summary.tasks,
                summary.stats.succeeded,
                summary.stats.failed,
                summary.stats.skipped
            );
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env()?;
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let job = Arc::new(SyncJob::from_config(config).await?);
            let mut sched = job
                .maybe_build_scheduler()
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started; waiting for ctrl-c");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let pool = rawpull_storage::connect_pool(&config.database_url, config.db_max_connections).await?;
            rawpull_storage::migrate_with_lock(&pool).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            rawpull_web::serve_from_env().await?;
        }
    }

    Ok(())
}
