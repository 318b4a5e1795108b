//! Run lifecycle entrypoints: starting runs, resuming paused runs, and
//! recording what an execution produced.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backends::{
    BackendError, CoreBackend, FlowRunRecord, PausedRun, RunReport,
};
use crate::engine::{ExecutionState, FlowExecutionResult};
use crate::flow::{
    ExecutionType, FlowGraph, FlowRun, FlowRunStatus, GraphError, PauseMetadata, RunEnvironment,
};
use crate::jobs::{
    DelayedResumeJob, FailureReason, FlowRunJob, Job, JobId, JobPayload, JobType, TriggerPollJob,
    WebhookJob,
};
use crate::queue::{JobQueue, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum RunServiceError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("invalid flow: {0}")]
    InvalidFlow(#[from] GraphError),
    #[error("flow run {run_id} is {status:?}; only paused runs can be resumed")]
    NotPaused { run_id: Uuid, status: FlowRunStatus },
    #[error("flow run {run_id} executes version {current}, resume requested {requested}")]
    VersionMismatch {
        run_id: Uuid,
        current: Uuid,
        requested: Uuid,
    },
    #[error("{actual:?} payload submitted as a {expected:?} job")]
    PayloadMismatch { expected: JobType, actual: JobType },
    #[error("flow {0} has no polling trigger")]
    NotPolling(Uuid),
    #[error("engine reported a paused run without pause metadata")]
    MissingPauseMetadata,
}

impl RunServiceError {
    /// Errors that say the request no longer applies, as opposed to a store being unavailable.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            RunServiceError::NotPaused { .. } | RunServiceError::VersionMismatch { .. }
        )
    }
}

/// Per-job-type deadlines used when this service enqueues work.
#[derive(Clone, Copy, Debug)]
pub struct JobTimeouts {
    pub flow_run_seconds: u64,
    pub trigger_poll_seconds: u64,
    pub webhook_seconds: u64,
}

impl Default for JobTimeouts {
    fn default() -> Self {
        Self {
            flow_run_seconds: 600,
            trigger_poll_seconds: 60,
            webhook_seconds: 30,
        }
    }
}

/// What became of a flow run job.
#[derive(Clone, Debug)]
pub enum RunOutcome {
    /// The engine ran the flow; its status is the run's new status.
    Executed(Box<FlowExecutionResult>),
    /// No result could be produced (retries exhausted or the engine refused the job).
    DispatchFailed {
        status: FlowRunStatus,
        reason: FailureReason,
        message: String,
    },
}

pub struct FlowRunService {
    backend: Arc<dyn CoreBackend>,
    queue: Arc<dyn JobQueue>,
    timeouts: JobTimeouts,
}

impl FlowRunService {
    pub fn new(backend: Arc<dyn CoreBackend>, queue: Arc<dyn JobQueue>, timeouts: JobTimeouts) -> Self {
        Self {
            backend,
            queue,
            timeouts,
        }
    }

    pub fn backend(&self) -> &Arc<dyn CoreBackend> {
        &self.backend
    }

    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: JobPayload,
        timeout_seconds: u64,
    ) -> Result<JobId, RunServiceError> {
        let actual = payload.job_type();
        if actual != job_type {
            return Err(RunServiceError::PayloadMismatch {
                expected: job_type,
                actual,
            });
        }
        Ok(self.queue.enqueue(Job::new(payload, timeout_seconds)).await?)
    }

    /// Creates a RUNNING run for `flow` and enqueues its BEGIN execution.
    pub async fn start_run(
        &self,
        flow: FlowGraph,
        payload: Value,
        environment: RunEnvironment,
    ) -> Result<FlowRun, RunServiceError> {
        flow.validate()?;
        let run = FlowRun::new(&flow, environment);
        self.backend
            .create_run(FlowRunRecord {
                run: run.clone(),
                flow: flow.clone(),
                state: ExecutionState::default(),
            })
            .await?;
        let job_id = self
            .enqueue(
                JobType::FlowRun,
                JobPayload::FlowRun(Box::new(FlowRunJob {
                    run_id: run.id,
                    flow,
                    execution_type: ExecutionType::Begin,
                    payload,
                    state: ExecutionState::default(),
                    environment,
                })),
                self.timeouts.flow_run_seconds,
            )
            .await?;
        info!(run_id = %run.id, flow_id = %run.flow_id, %job_id, "flow run started");
        Ok(run)
    }

    pub async fn enqueue_trigger_poll(
        &self,
        flow: FlowGraph,
        last_polled_at: Option<DateTime<Utc>>,
        environment: RunEnvironment,
    ) -> Result<JobId, RunServiceError> {
        if !matches!(flow.trigger.kind, crate::flow::TriggerKind::Polling { .. }) {
            return Err(RunServiceError::NotPolling(flow.flow_id));
        }
        self.enqueue(
            JobType::TriggerPoll,
            JobPayload::TriggerPoll(Box::new(TriggerPollJob {
                flow,
                last_polled_at,
                environment,
            })),
            self.timeouts.trigger_poll_seconds,
        )
        .await
    }

    /// Enqueues an HTTP delivery. `event_destination` selects the
    /// EVENT_DESTINATION job type instead of OUTGOING_WEBHOOK.
    pub async fn deliver(&self, hook: WebhookJob, event_destination: bool) -> Result<JobId, RunServiceError> {
        let (job_type, payload) = if event_destination {
            (JobType::EventDestination, JobPayload::EventDestination(hook))
        } else {
            (JobType::OutgoingWebhook, JobPayload::OutgoingWebhook(hook))
        };
        self.enqueue(job_type, payload, self.timeouts.webhook_seconds).await
    }

    /// Moves a PAUSED run back to RUNNING and enqueues its RESUME execution
    /// with the stored state snapshot.
    pub async fn resume(
        &self,
        run_id: Uuid,
        flow_version_id: Uuid,
        payload: Value,
    ) -> Result<JobId, RunServiceError> {
        let record = self.backend.get_run(run_id).await?;
        if record.run.status != FlowRunStatus::Paused {
            return Err(RunServiceError::NotPaused {
                run_id,
                status: record.run.status,
            });
        }
        if record.run.flow_version_id != flow_version_id {
            return Err(RunServiceError::VersionMismatch {
                run_id,
                current: record.run.flow_version_id,
                requested: flow_version_id,
            });
        }
        match self
            .backend
            .update_run_status(run_id, FlowRunStatus::Paused, FlowRunStatus::Running)
            .await
        {
            Ok(_) => {}
            Err(BackendError::Conflict { actual, .. }) => {
                return Err(RunServiceError::NotPaused {
                    run_id,
                    status: actual,
                });
            }
            Err(err) => return Err(err.into()),
        }

        let job_id = self
            .enqueue(
                JobType::FlowRun,
                JobPayload::FlowRun(Box::new(FlowRunJob {
                    run_id,
                    flow: record.flow,
                    execution_type: ExecutionType::Resume,
                    payload,
                    state: record.state,
                    environment: record.run.environment,
                })),
                self.timeouts.flow_run_seconds,
            )
            .await?;
        info!(%run_id, %job_id, "flow run resumed");
        Ok(job_id)
    }

    pub async fn record_outcome(&self, run_id: Uuid, outcome: RunOutcome) -> Result<(), RunServiceError> {
        match outcome {
            RunOutcome::Executed(result) => self.record_execution(run_id, *result).await,
            RunOutcome::DispatchFailed {
                status,
                reason,
                message,
            } => {
                let record = self.backend.get_run(run_id).await?;
                warn!(%run_id, status = status.as_str(), reason = reason.as_str(), %message, "flow run could not be executed");
                self.backend
                    .save_run_finished(&RunReport {
                        run_id,
                        status,
                        execution_state: record.state,
                        duration_ms: 0,
                        error_message: Some(message),
                        failure_reason: Some(reason),
                        failed_step: None,
                        response: None,
                    })
                    .await?;
                Ok(())
            }
        }
    }

    async fn record_execution(&self, run_id: Uuid, result: FlowExecutionResult) -> Result<(), RunServiceError> {
        if result.status != FlowRunStatus::Paused {
            let error_message = result.failed_step.as_ref().map(|step| step.message.clone());
            self.backend
                .save_run_finished(&RunReport {
                    run_id,
                    status: result.status,
                    execution_state: result.state,
                    duration_ms: result.duration_ms,
                    error_message,
                    failure_reason: None,
                    failed_step: result.failed_step,
                    response: result.response,
                })
                .await?;
            info!(%run_id, status = result.status.as_str(), duration_ms = result.duration_ms, "flow run finished");
            return Ok(());
        }

        let metadata = result
            .pause_metadata
            .ok_or(RunServiceError::MissingPauseMetadata)?;
        self.backend
            .save_run_paused(&PausedRun {
                run_id,
                execution_state: result.state,
                pause_metadata: metadata.clone(),
                duration_ms: result.duration_ms,
            })
            .await?;
        info!(%run_id, "flow run paused");

        if let PauseMetadata::Delay { resume_at } = metadata {
            let record = self.backend.get_run(run_id).await?;
            let delay = (resume_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            let job = Job::new(
                JobPayload::DelayedResume(DelayedResumeJob {
                    run_id,
                    flow_version_id: record.run.flow_version_id,
                    payload: Value::Null,
                }),
                self.timeouts.flow_run_seconds,
            );
            let job_id = self.queue.enqueue_delayed(job, delay).await?;
            info!(%run_id, %job_id, %resume_at, "scheduled delayed resume");
        }
        Ok(())
    }
}
