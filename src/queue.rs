//! Job queue consumed by the dispatcher.
//!
//! Dequeue hands out a lease: the job stays owned by the queue until it is
//! acked, requeued, or dead-lettered. Leases older than the configured TTL
//! (a consumer that died mid-job) are put back by [`JobQueue::reclaim_expired`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::jobs::{FailureReason, Job, JobId};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job {0} is not leased")]
    NotLeased(JobId),
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Clone, Debug)]
pub struct DeadLetter {
    pub job: Job,
    pub reason: FailureReason,
    pub message: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> QueueResult<JobId>;

    /// Makes the job visible once `delay` has elapsed.
    async fn enqueue_delayed(&self, job: Job, delay: Duration) -> QueueResult<JobId>;

    /// Leases the oldest visible job, if any.
    async fn dequeue(&self) -> QueueResult<Option<Job>>;

    async fn ack(&self, id: JobId) -> QueueResult<()>;

    /// Releases the lease and schedules `job` (usually with a bumped attempt) again.
    async fn requeue(&self, job: Job, delay: Duration) -> QueueResult<()>;

    async fn dead_letter(&self, job: Job, reason: FailureReason, message: String) -> QueueResult<()>;

    /// Returns jobs leased longer than `lease_ttl` to the queue; yields how many.
    async fn reclaim_expired(&self, lease_ttl: Duration) -> QueueResult<usize>;

    /// Resolves when new work may be available or `max_wait` elapsed.
    async fn wait_for_jobs(&self, max_wait: Duration);
}

struct Lease {
    job: Job,
    leased_at: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Job>,
    delayed: Vec<(Instant, Job)>,
    leased: HashMap<JobId, Lease>,
    dead: Vec<DeadLetter>,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(visible_at, _)| *visible_at <= now);
        self.delayed = pending;
        due.sort_by_key(|(visible_at, _)| *visible_at);
        self.ready.extend(due.into_iter().map(|(_, job)| job));
    }
}

/// Queue kept in process memory, for local runs and tests.
#[derive(Clone, Default)]
pub struct MemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready_len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).ready.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).delayed.len()
    }

    pub fn leased_len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).leased.len()
    }

    /// Jobs waiting out a delay, with their remaining delay.
    pub fn delayed_jobs(&self) -> Vec<(Duration, Job)> {
        let now = Instant::now();
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .delayed
            .iter()
            .map(|(visible_at, job)| (visible_at.saturating_duration_since(now), job.clone()))
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).dead.clone()
    }

    /// True when nothing is ready, delayed, or leased.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.ready.is_empty() && state.delayed.is_empty() && state.leased.is_empty()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: Job) -> QueueResult<JobId> {
        let id = job.id;
        debug!(job_id = %id, job_type = job.job_type.as_str(), "job enqueued");
        self.state.lock().unwrap_or_else(PoisonError::into_inner).ready.push_back(job);
        self.notify.notify_one();
        Ok(id)
    }

    async fn enqueue_delayed(&self, job: Job, delay: Duration) -> QueueResult<JobId> {
        if delay.is_zero() {
            return self.enqueue(job).await;
        }
        let id = job.id;
        debug!(job_id = %id, delay_ms = delay.as_millis() as u64, "job enqueued with delay");
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .delayed
            .push((Instant::now() + delay, job));
        Ok(id)
    }

    async fn dequeue(&self) -> QueueResult<Option<Job>> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.promote_due(now);
        let Some(job) = state.ready.pop_front() else {
            return Ok(None);
        };
        state.leased.insert(
            job.id,
            Lease {
                job: job.clone(),
                leased_at: now,
            },
        );
        Ok(Some(job))
    }

    async fn ack(&self, id: JobId) -> QueueResult<()> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .leased
            .remove(&id)
            .map(|_| ())
            .ok_or(QueueError::NotLeased(id))
    }

    async fn requeue(&self, job: Job, delay: Duration) -> QueueResult<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.leased.remove(&job.id).is_none() {
                return Err(QueueError::NotLeased(job.id));
            }
            if delay.is_zero() {
                state.ready.push_back(job);
            } else {
                state.delayed.push((Instant::now() + delay, job));
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(&self, job: Job, reason: FailureReason, message: String) -> QueueResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.leased.remove(&job.id);
        warn!(job_id = %job.id, reason = reason.as_str(), %message, "job dead-lettered");
        state.dead.push(DeadLetter {
            job,
            reason,
            message,
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }

    async fn reclaim_expired(&self, lease_ttl: Duration) -> QueueResult<usize> {
        let now = Instant::now();
        let reclaimed = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let expired: Vec<JobId> = state
                .leased
                .iter()
                .filter(|(_, lease)| now.saturating_duration_since(lease.leased_at) >= lease_ttl)
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                if let Some(lease) = state.leased.remove(id) {
                    warn!(job_id = %id, "reclaiming expired lease");
                    state.ready.push_front(lease.job);
                }
            }
            expired.len()
        };
        if reclaimed > 0 {
            self.notify.notify_one();
        }
        Ok(reclaimed)
    }

    async fn wait_for_jobs(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }
}
