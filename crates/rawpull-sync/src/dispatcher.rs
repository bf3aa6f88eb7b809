//! Bounded pool of workers draining a queue of `(account, stream)` tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rawpull_adapters::{StreamSpec, VendorAdapter};
use rawpull_core::TenantAccount;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info_span, warn, Instrument};

use crate::driver::IngestionDriver;

/// Counters shared by all workers of one dispatch. `processed` counts driver runs that
/// reached a verdict (succeeded + failed); lease contention and min-interval gating are skips.
#[derive(Debug, Default)]
pub struct RunStats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl RunStats {
    pub fn record_succeeded(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RunStatsSnapshot {
        RunStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct SyncTask {
    pub account: TenantAccount,
    pub adapter: Arc<dyn VendorAdapter>,
    pub stream: StreamSpec,
}

impl std::fmt::Debug for SyncTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTask")
            .field("key", &self.account.key_for(&self.stream.name))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TenantDispatcher {
    driver: Arc<IngestionDriver>,
    workers: usize,
}

impl TenantDispatcher {
    pub fn new(driver: Arc<IngestionDriver>, workers: usize) -> Self {
        Self {
            driver,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs every task once and returns the final counters. Individual failures, including
    /// panicking drivers, are counted and never abort the dispatch.
    pub async fn dispatch(&self, tasks: Vec<SyncTask>) -> RunStatsSnapshot {
        let stats = Arc::new(RunStats::default());
        let (tx, rx) = mpsc::unbounded_channel();
        for task in tasks {
            // The receiver is alive until the workers below finish.
            let _ = tx.send(task);
        }
        drop(tx);

        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let rx = Arc::clone(&rx);
            let driver = Arc::clone(&self.driver);
            let stats = Arc::clone(&stats);
            let work = async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(task) = next else {
                        break;
                    };
                    run_task(Arc::clone(&driver), task, &stats).await;
                }
                debug!("queue drained");
            };
            handles.push(tokio::spawn(work.instrument(info_span!("worker", worker))));
        }

        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "worker task aborted");
            }
        }
        stats.snapshot()
    }
}

async fn run_task(driver: Arc<IngestionDriver>, task: SyncTask, stats: &RunStats) {
    let trace_id = task.account.key_for(&task.stream.name).trace_id();
    let run = tokio::spawn(async move {
        driver
            .run(&task.account, Arc::clone(&task.adapter), &task.stream)
            .await
    });
    match run.await {
        Ok(Ok(outcome)) if outcome.is_skipped() => {
            debug!(trace_id, ?outcome, "task skipped");
            stats.record_skipped();
        }
        Ok(Ok(outcome)) => {
            debug!(trace_id, ?outcome, "task finished");
            stats.record_succeeded();
        }
        Ok(Err(err)) => {
            warn!(trace_id, error = %err, "task failed");
            stats.record_failed();
        }
        Err(err) => {
            error!(trace_id, error = %err, "driver panicked");
            stats.record_failed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_results() {
        let stats = RunStats::default();
        stats.record_succeeded();
        stats.record_succeeded();
        stats.record_failed();
        stats.record_skipped();
        assert_eq!(
            stats.snapshot(),
            RunStatsSnapshot {
                processed: 3,
                succeeded: 2,
                failed: 1,
                skipped: 1,
            }
        );
    }

    #[tokio::test]
    async fn counters_are_safe_across_tasks() {
        let stats = Arc::new(RunStats::default());
        let mut handles = Vec::new();
        for i in 0..64 {
            let stats = Arc::clone(&stats);
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    stats.record_succeeded();
                } else {
                    stats.record_skipped();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.processed, 32);
        assert_eq!(snapshot.skipped, 32);
    }
}
