//! Background status reporting for a worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backends::{WorkerStatusBackend, WorkerStatusUpdate};
use crate::dispatcher::DispatcherStats;
use crate::network::PublicIpCache;
use crate::sandbox::SandboxPool;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub concurrency: usize,
    pub in_flight: usize,
    pub active_sandboxes: usize,
    pub peak_sandboxes: usize,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub last_job_at: Option<DateTime<Utc>>,
}

pub trait WorkerStats: Send + Sync {
    fn stats_snapshot(&self) -> WorkerStatsSnapshot;
}

/// Dispatcher counters joined with the sandbox pool's occupancy.
pub struct DispatcherStatsSource {
    pub concurrency: usize,
    pub dispatcher: Arc<DispatcherStats>,
    pub pool: Arc<SandboxPool>,
}

impl WorkerStats for DispatcherStatsSource {
    fn stats_snapshot(&self) -> WorkerStatsSnapshot {
        let dispatch = self.dispatcher.snapshot();
        let pool = self.pool.stats();
        WorkerStatsSnapshot {
            concurrency: self.concurrency,
            in_flight: dispatch.in_flight,
            active_sandboxes: pool.active,
            peak_sandboxes: pool.peak_active,
            jobs_succeeded: dispatch.succeeded,
            jobs_failed: dispatch.failed,
            jobs_retried: dispatch.retried,
            last_job_at: dispatch.last_job_at,
        }
    }
}

pub fn build_update(
    worker_id: Uuid,
    public_ip: Option<String>,
    stats: WorkerStatsSnapshot,
) -> WorkerStatusUpdate {
    WorkerStatusUpdate {
        worker_id,
        public_ip,
        concurrency: stats.concurrency,
        in_flight: stats.in_flight,
        active_sandboxes: stats.active_sandboxes,
        peak_sandboxes: stats.peak_sandboxes,
        jobs_succeeded: stats.jobs_succeeded,
        jobs_failed: stats.jobs_failed,
        jobs_retried: stats.jobs_retried,
        last_job_at: stats.last_job_at,
        reported_at: Utc::now(),
    }
}

/// Spawn a background task that reports worker status to the backend.
pub fn spawn_status_reporter<S>(
    worker_id: Uuid,
    backend: Arc<dyn WorkerStatusBackend>,
    stats: S,
    public_ip: PublicIpCache,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()>
where
    S: WorkerStats + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            worker_id = %worker_id,
            interval_ms = interval.as_millis(),
            "status reporter started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ip = public_ip.get().await;
                    let status = build_update(worker_id, ip, stats.stats_snapshot());
                    debug!(in_flight = status.in_flight, active_sandboxes = status.active_sandboxes, "reporting worker status");
                    if let Err(err) = backend.upsert_worker_status(&status).await {
                        warn!(error = %err, "failed to update worker status");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("status reporter shutting down");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use std::sync::Mutex;

    struct FixedStats(Mutex<WorkerStatsSnapshot>);

    impl WorkerStats for FixedStats {
        fn stats_snapshot(&self) -> WorkerStatsSnapshot {
            self.0.lock().unwrap().clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reports_on_every_tick_until_shutdown() {
        let backend = MemoryBackend::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_id = Uuid::new_v4();
        let stats = FixedStats(Mutex::new(WorkerStatsSnapshot {
            concurrency: 4,
            in_flight: 2,
            jobs_succeeded: 7,
            ..WorkerStatsSnapshot::default()
        }));

        let handle = spawn_status_reporter(
            worker_id,
            Arc::new(backend.clone()),
            stats,
            PublicIpCache::fixed("192.0.2.10"),
            Duration::from_secs(10),
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let updates = backend.worker_status_updates();
        assert_eq!(updates.len(), 1, "upserts replace the worker's row");
        let update = &updates[0];
        assert_eq!(update.worker_id, worker_id);
        assert_eq!(update.public_ip.as_deref(), Some("192.0.2.10"));
        assert_eq!(update.concurrency, 4);
        assert_eq!(update.jobs_succeeded, 7);
    }
}
