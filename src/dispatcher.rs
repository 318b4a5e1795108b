//! Job dispatcher.
//!
//! Leases jobs from the queue and runs each through its executor under a
//! global concurrency ceiling. A permit is acquired *before* dequeuing, so
//! excess jobs wait in the queue in order. Outcomes are classified into ack,
//! requeue with backoff, or dead-letter, and reported to the backend.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, watch},
    task::JoinHandle,
    time::{Instant, sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::backends::{JobReport, JobStatus};
use crate::executors::{DispatchError, ExecutorRegistry, JobOutcome};
use crate::flow::FlowRunStatus;
use crate::jobs::{FailureReason, Job, JobType};
use crate::queue::JobQueue;
use crate::retry::RetryPolicy;
use crate::runs::{FlowRunService, RunOutcome};

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    /// Maximum number of jobs executing at once.
    pub concurrency: usize,
    pub retry_policy: RetryPolicy,
    /// Time granted on top of a job's own timeout (sandbox startup, reporting)
    /// before the dispatcher abandons the execution.
    pub timeout_grace: Duration,
    /// Attempts per outcome report or queue call (requeue, ack, dead-letter)
    /// before falling back to the next way of settling the job.
    pub report_attempts: u32,
    pub report_backoff: Duration,
    /// Leases older than this are returned to the queue. `None` disables reclaiming.
    pub lease_ttl: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            concurrency: num_cpus::get().max(1),
            retry_policy: RetryPolicy::default(),
            timeout_grace: Duration::from_secs(20),
            report_attempts: 3,
            report_backoff: Duration::from_millis(100),
            lease_ttl: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatcherStats {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    last_job_at: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatcherStatsSnapshot {
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub last_job_at: Option<DateTime<Utc>>,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
            last_job_at: *self.last_job_at.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn begin(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn end(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        *self.last_job_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }
}

pub struct Dispatcher {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    stats: Arc<DispatcherStats>,
}

impl Dispatcher {
    pub fn start(
        config: DispatcherConfig,
        queue: Arc<dyn JobQueue>,
        executors: ExecutorRegistry,
        runs: Arc<FlowRunService>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(DispatcherStats::default());
        let context = Arc::new(DispatchContext {
            config,
            queue,
            executors,
            runs,
            stats: Arc::clone(&stats),
        });
        let handle = tokio::spawn(async move {
            DispatcherTask {
                context,
                shutdown_rx,
            }
            .run()
            .await;
        });
        Self {
            shutdown_tx,
            handle,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<DispatcherStats> {
        Arc::clone(&self.stats)
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stops leasing new jobs and waits for in-flight jobs to settle.
    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        self.handle
            .await
            .map_err(|err| anyhow!("dispatcher task panicked: {err}"))
    }
}

struct DispatchContext {
    config: DispatcherConfig,
    queue: Arc<dyn JobQueue>,
    executors: ExecutorRegistry,
    runs: Arc<FlowRunService>,
    stats: Arc<DispatcherStats>,
}

struct DispatcherTask {
    context: Arc<DispatchContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DispatcherTask {
    async fn run(mut self) {
        let config = &self.context.config;
        let concurrency = config.concurrency.max(1);
        info!(
            concurrency,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            max_attempts = config.retry_policy.max_attempts,
            "starting dispatcher"
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut last_reclaim = Instant::now();

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown_rx.changed() => break,
            };
            if self.shutting_down() {
                break;
            }

            let Some(job) = self.next_job(&mut last_reclaim).await else {
                break;
            };
            let context = Arc::clone(&self.context);
            tokio::spawn(async move {
                context.dispatch(job, permit).await;
            });
        }

        info!("dispatcher shutting down");
        self.wait_for_inflight(&semaphore, concurrency).await;
        info!("dispatcher stopped");
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Waits until a job can be leased. `None` means shutdown was requested.
    async fn next_job(&mut self, last_reclaim: &mut Instant) -> Option<Job> {
        loop {
            self.maybe_reclaim(last_reclaim).await;
            match self.context.queue.dequeue().await {
                Ok(Some(job)) => return Some(job),
                Ok(None) => {}
                Err(err) => {
                    metrics::counter!("flowrunner_dispatch_errors_total").increment(1);
                    error!(error = %err, "failed to dequeue job");
                }
            }
            tokio::select! {
                _ = self.context.queue.wait_for_jobs(self.context.config.poll_interval) => {}
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        return None;
                    }
                }
            }
            if self.shutting_down() {
                return None;
            }
        }
    }

    async fn maybe_reclaim(&self, last_reclaim: &mut Instant) {
        let Some(ttl) = self.context.config.lease_ttl else {
            return;
        };
        if last_reclaim.elapsed() < ttl / 2 {
            return;
        }
        *last_reclaim = Instant::now();
        match self.context.queue.reclaim_expired(ttl).await {
            Ok(0) => {}
            Ok(count) => warn!(count, "reclaimed expired job leases"),
            Err(err) => error!(error = %err, "failed to reclaim expired leases"),
        }
    }

    async fn wait_for_inflight(&self, semaphore: &Arc<Semaphore>, expected: usize) {
        while semaphore.available_permits() < expected {
            sleep(Duration::from_millis(20)).await;
        }
    }
}

impl DispatchContext {
    async fn dispatch(&self, job: Job, _permit: OwnedSemaphorePermit) {
        self.stats.begin();
        let deadline = job.timeout();
        debug!(job_id = %job.id, job_type = job.job_type.as_str(), attempt = job.attempt, "dispatching job");

        let result = match self.executors.get(job.job_type) {
            Ok(executor) => {
                match timeout(deadline + self.config.timeout_grace, executor.execute(&job, deadline)).await {
                    Ok(result) => result,
                    Err(_) => Err(DispatchError::TimedOut(deadline)),
                }
            }
            Err(err) => Err(err),
        };
        self.settle(job, result).await;
        self.stats.end();
    }

    async fn settle(&self, job: Job, result: Result<JobOutcome, DispatchError>) {
        let err = match result {
            Ok(outcome) => {
                if let JobOutcome::FlowRun(result) = outcome
                    && let Some(run_id) = job.payload.run_id()
                    && let Err(message) = self
                        .with_retries("run outcome", || {
                            self.runs.record_outcome(run_id, RunOutcome::Executed(result.clone()))
                        })
                        .await
                {
                    self.dead_letter_unreported(job, message).await;
                    return;
                }
                metrics::counter!("flowrunner_jobs_succeeded_total").increment(1);
                self.stats.succeeded.fetch_add(1, Ordering::SeqCst);
                self.finish(job, JobStatus::Succeeded, None, false).await;
                return;
            }
            Err(err) => err,
        };

        let mut reason = err.failure_reason();
        let mut message = err.to_string();
        let mut dead_letter = err.is_recoverable();
        if err.is_recoverable() {
            let decision = self.config.retry_policy.decide(job.attempt + 1);
            if decision.should_retry {
                warn!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    reason = reason.as_str(),
                    delay_ms = decision.delay.as_millis() as u64,
                    error = %message,
                    "job failed, requeueing"
                );
                let retry = job.clone().next_attempt();
                match self
                    .with_retries("requeue", || self.queue.requeue(retry.clone(), decision.delay))
                    .await
                {
                    Ok(()) => {
                        metrics::counter!("flowrunner_jobs_retried_total").increment(1);
                        self.stats.retried.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                    Err(requeue_err) => {
                        error!(job_id = %job.id, error = %requeue_err, "failed to requeue job, giving up on it");
                        reason = FailureReason::Internal;
                        message = format!("failed to requeue ({requeue_err}) after: {message}");
                        dead_letter = true;
                    }
                }
            }
        }

        error!(
            job_id = %job.id,
            job_type = job.job_type.as_str(),
            attempt = job.attempt,
            reason = reason.as_str(),
            error = %message,
            "job failed"
        );
        let timed_out = reason == FailureReason::TimedOut;
        if job.job_type == JobType::FlowRun
            && let Some(run_id) = job.payload.run_id()
        {
            let status = if timed_out {
                FlowRunStatus::TimedOut
            } else {
                FlowRunStatus::Failed
            };
            let reported = self
                .with_retries("run outcome", || {
                    self.runs.record_outcome(
                        run_id,
                        RunOutcome::DispatchFailed {
                            status,
                            reason,
                            message: message.clone(),
                        },
                    )
                })
                .await;
            if let Err(report_err) = reported {
                self.dead_letter_unreported(job, report_err).await;
                return;
            }
        }

        metrics::counter!("flowrunner_jobs_failed_total", "reason" => reason.as_str()).increment(1);
        self.stats.failed.fetch_add(1, Ordering::SeqCst);
        let status = if timed_out {
            JobStatus::TimedOut
        } else {
            JobStatus::Failed
        };
        self.finish(job, status, Some((reason, message)), dead_letter).await;
    }

    /// Records the job report, then acks or dead-letters the job.
    async fn finish(
        &self,
        job: Job,
        status: JobStatus,
        failure: Option<(FailureReason, String)>,
        dead_letter: bool,
    ) {
        let report = JobReport {
            job_id: job.id,
            job_type: job.job_type,
            run_id: job.payload.run_id(),
            status,
            attempt: job.attempt,
            failure_reason: failure.as_ref().map(|(reason, _)| *reason),
            message: failure.as_ref().map(|(_, message)| message.clone()),
            finished_at: Utc::now(),
        };
        let backend = self.runs.backend();
        if let Err(message) = self
            .with_retries("job report", || backend.save_job_finished(&report))
            .await
        {
            self.dead_letter_unreported(job, message).await;
            return;
        }

        match (dead_letter, failure) {
            (true, Some((reason, message))) => self.dead_letter(job, reason, message).await,
            _ => {
                let job_id = job.id;
                if let Err(err) = self.with_retries("ack", || self.queue.ack(job_id)).await {
                    metrics::counter!("flowrunner_settle_failures_total").increment(1);
                    error!(%job_id, error = %err, "failed to ack job, its lease stays open");
                }
            }
        }
    }

    async fn dead_letter_unreported(&self, job: Job, report_error: String) {
        metrics::counter!("flowrunner_report_failures_total").increment(1);
        let message = format!("failed to report outcome: {report_error}");
        self.dead_letter(job, FailureReason::Internal, message).await;
    }

    /// Moves the job to the dead-letter store. When the queue keeps refusing,
    /// the lease stays open for `lease_ttl` reclaiming.
    async fn dead_letter(&self, job: Job, reason: FailureReason, message: String) {
        let job_id = job.id;
        let moved = self
            .with_retries("dead letter", || {
                self.queue.dead_letter(job.clone(), reason, message.clone())
            })
            .await;
        match moved {
            Ok(()) => {
                self.stats.dead_lettered.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                metrics::counter!("flowrunner_settle_failures_total").increment(1);
                error!(%job_id, error = %err, "failed to dead-letter job, its lease stays open");
            }
        }
    }

    /// Runs a queue or backend call up to `report_attempts` times with linear backoff.
    async fn with_retries<F, Fut, E>(&self, what: &'static str, mut call: F) -> Result<(), String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Display,
    {
        let attempts = self.config.report_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match call().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last_error = err.to_string();
                    warn!(what, attempt, error = %last_error, "call failed");
                    if attempt < attempts {
                        sleep(self.config.report_backoff * attempt).await;
                    }
                }
            }
        }
        Err(last_error)
    }
}
