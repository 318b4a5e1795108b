//! Backend interfaces for persisting flow runs, job outcomes, and worker status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use async_trait::async_trait;
use uuid::Uuid;

use crate::engine::ExecutionState;
use crate::flow::{
    FailedStep, FlowGraph, FlowRun, FlowRunStatus, PauseMetadata, RunTransitionError,
};
use crate::jobs::{FailureReason, JobId, JobType};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),
    #[error("flow run {0} not found")]
    RunNotFound(Uuid),
    #[error("flow run {run_id} is {actual:?}, expected {expected:?}")]
    Conflict {
        run_id: Uuid,
        expected: FlowRunStatus,
        actual: FlowRunStatus,
    },
    #[error(transparent)]
    Transition(#[from] RunTransitionError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A run together with the flow version it executes and its latest state snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowRunRecord {
    pub run: FlowRun,
    pub flow: FlowGraph,
    #[serde(default)]
    pub state: ExecutionState,
}

/// Final outcome of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: FlowRunStatus,
    pub execution_state: ExecutionState,
    pub duration_ms: u64,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Set when the run ended because its job could not be executed.
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub failed_step: Option<FailedStep>,
    /// Response carried by a stop directive.
    #[serde(default)]
    pub response: Option<Value>,
}

/// Snapshot of a run that paused.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PausedRun {
    pub run_id: Uuid,
    pub execution_state: ExecutionState,
    pub pause_metadata: PauseMetadata,
    pub duration_ms: u64,
}

impl PausedRun {
    pub fn status(&self) -> FlowRunStatus {
        FlowRunStatus::Paused
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Succeeded,
    Failed,
    TimedOut,
}

/// Outcome of one job, recorded once the job leaves the queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub job_type: JobType,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    pub status: JobStatus,
    pub attempt: u32,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub message: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Worker status update for persistence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatusUpdate {
    pub worker_id: Uuid,
    #[serde(default)]
    pub public_ip: Option<String>,
    pub concurrency: usize,
    pub in_flight: usize,
    pub active_sandboxes: usize,
    pub peak_sandboxes: usize,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    #[serde(default)]
    pub last_job_at: Option<DateTime<Utc>>,
    pub reported_at: DateTime<Utc>,
}

/// Backend capability for recording worker status metrics.
#[async_trait]
pub trait WorkerStatusBackend: Send + Sync {
    async fn upsert_worker_status(&self, status: &WorkerStatusUpdate) -> BackendResult<()>;
}

/// Persistence for flow runs and job outcomes.
#[async_trait]
pub trait CoreBackend: Send + Sync {
    async fn create_run(&self, record: FlowRunRecord) -> BackendResult<()>;

    async fn get_run(&self, run_id: Uuid) -> BackendResult<FlowRunRecord>;

    /// Moves a run from `expected` to `next` atomically; fails with
    /// [`BackendError::Conflict`] when the run is no longer in `expected`.
    async fn update_run_status(
        &self,
        run_id: Uuid,
        expected: FlowRunStatus,
        next: FlowRunStatus,
    ) -> BackendResult<FlowRun>;

    async fn save_run_finished(&self, report: &RunReport) -> BackendResult<()>;

    async fn save_run_paused(&self, paused: &PausedRun) -> BackendResult<()>;

    async fn save_job_finished(&self, report: &JobReport) -> BackendResult<()>;
}
