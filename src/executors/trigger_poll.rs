use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::{DispatchError, JobExecutor, JobOutcome, payload_mismatch};
use crate::engine::decode_response;
use crate::flow::{FlowGraph, RunEnvironment, TriggerKind};
use crate::jobs::{Job, JobPayload};
use crate::messages::{EngineOperation, ResponseStatus, TriggerPollOperation, TriggerPollResult};
use crate::runs::FlowRunService;
use crate::sandbox::{SandboxError, SandboxPool};

/// Polls a flow's trigger inside a sandbox and starts one run per new event.
pub struct TriggerPollExecutor {
    pool: Arc<SandboxPool>,
    runs: Arc<FlowRunService>,
}

impl TriggerPollExecutor {
    pub fn new(pool: Arc<SandboxPool>, runs: Arc<FlowRunService>) -> Self {
        Self { pool, runs }
    }
}

#[async_trait]
impl JobExecutor for TriggerPollExecutor {
    async fn execute(&self, job: &Job, deadline: Duration) -> Result<JobOutcome, DispatchError> {
        let JobPayload::TriggerPoll(poll) = &job.payload else {
            return Err(payload_mismatch(job));
        };
        let TriggerKind::Polling {
            piece,
            trigger,
            input,
        } = &poll.flow.trigger.kind
        else {
            return Err(DispatchError::Rejected(format!(
                "flow {} has no polling trigger",
                poll.flow.flow_id
            )));
        };
        let operation = EngineOperation::ExecuteTriggerPoll(TriggerPollOperation {
            flow_version_id: poll.flow.version_id,
            piece: piece.clone(),
            trigger: trigger.clone(),
            input: input.clone(),
            last_polled_at: poll.last_polled_at,
        });

        let mut sandbox = self.pool.acquire().await?;
        let submitted = sandbox.submit(operation, deadline).await;
        sandbox.release().await;
        let response = submitted?;
        if response.status == ResponseStatus::Error {
            return Err(DispatchError::Rejected(
                response.error_message().unwrap_or("trigger poll failed").to_string(),
            ));
        }
        let TriggerPollResult { events } = decode_response(response.response)
            .map_err(|err| SandboxError::Protocol(format!("undecodable poll result: {err}")))?;

        let runs_started = start_event_runs(&self.runs, &poll.flow, events, poll.environment).await?;
        info!(flow_id = %poll.flow.flow_id, runs_started, "trigger poll finished");
        Ok(JobOutcome::Polled { runs_started })
    }
}

/// Starts one run per event. A failure before any run started can be retried;
/// after that a retry would poll the same events again and start duplicates,
/// so the job is rejected instead.
async fn start_event_runs(
    runs: &FlowRunService,
    flow: &FlowGraph,
    events: Vec<Value>,
    environment: RunEnvironment,
) -> Result<usize, DispatchError> {
    let total = events.len();
    let mut runs_started = 0;
    for event in events {
        if let Err(err) = runs.start_run(flow.clone(), event, environment).await {
            if runs_started == 0 {
                return Err(DispatchError::Transient(err.to_string()));
            }
            warn!(flow_id = %flow.flow_id, runs_started, total, error = %err, "trigger poll partially started");
            return Err(DispatchError::Rejected(format!(
                "started {runs_started} of {total} runs before: {err}"
            )));
        }
        runs_started += 1;
    }
    Ok(runs_started)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    use crate::backends::{
        BackendError, BackendResult, CoreBackend, FlowRunRecord, JobReport, MemoryBackend,
        PausedRun, RunReport,
    };
    use crate::flow::{FlowRun, FlowRunStatus, PieceRef, TriggerNode};
    use crate::queue::MemoryJobQueue;
    use crate::runs::JobTimeouts;

    /// Accepts the first `limit` runs, then refuses to create more.
    struct LimitedBackend {
        inner: MemoryBackend,
        limit: usize,
        created: AtomicUsize,
    }

    #[async_trait]
    impl CoreBackend for LimitedBackend {
        async fn create_run(&self, record: FlowRunRecord) -> BackendResult<()> {
            if self.created.fetch_add(1, Ordering::SeqCst) >= self.limit {
                return Err(BackendError::Message("run store unavailable".to_string()));
            }
            self.inner.create_run(record).await
        }

        async fn get_run(&self, run_id: Uuid) -> BackendResult<FlowRunRecord> {
            self.inner.get_run(run_id).await
        }

        async fn update_run_status(
            &self,
            run_id: Uuid,
            expected: FlowRunStatus,
            next: FlowRunStatus,
        ) -> BackendResult<FlowRun> {
            self.inner.update_run_status(run_id, expected, next).await
        }

        async fn save_run_finished(&self, report: &RunReport) -> BackendResult<()> {
            self.inner.save_run_finished(report).await
        }

        async fn save_run_paused(&self, paused: &PausedRun) -> BackendResult<()> {
            self.inner.save_run_paused(paused).await
        }

        async fn save_job_finished(&self, report: &JobReport) -> BackendResult<()> {
            self.inner.save_job_finished(report).await
        }
    }

    fn service(limit: usize) -> (FlowRunService, MemoryJobQueue) {
        let queue = MemoryJobQueue::new();
        let backend = LimitedBackend {
            inner: MemoryBackend::new(),
            limit,
            created: AtomicUsize::new(0),
        };
        let runs = FlowRunService::new(
            Arc::new(backend),
            Arc::new(queue.clone()),
            JobTimeouts::default(),
        );
        (runs, queue)
    }

    fn polling_flow() -> FlowGraph {
        FlowGraph::new(
            TriggerNode {
                name: "trigger".to_string(),
                kind: TriggerKind::Polling {
                    piece: PieceRef::new("core", "0.1.0"),
                    trigger: "items".to_string(),
                    input: json!({}),
                },
            },
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn starts_one_run_per_event() {
        let (runs, queue) = service(usize::MAX);
        let started = start_event_runs(
            &runs,
            &polling_flow(),
            vec![json!({"id": 1}), json!({"id": 2})],
            RunEnvironment::Production,
        )
        .await
        .unwrap();
        assert_eq!(started, 2);
        assert_eq!(queue.ready_len(), 2);
    }

    #[tokio::test]
    async fn failure_before_any_run_is_retryable() {
        let (runs, queue) = service(0);
        let err = start_event_runs(&runs, &polling_flow(), vec![json!({"id": 1})], RunEnvironment::Production)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(queue.ready_len(), 0);
    }

    #[tokio::test]
    async fn partial_start_is_not_retried() {
        let (runs, queue) = service(1);
        let err = start_event_runs(
            &runs,
            &polling_flow(),
            vec![json!({"id": 1}), json!({"id": 2})],
            RunEnvironment::Production,
        )
        .await
        .unwrap_err();
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("started 1 of 2"));
        assert_eq!(queue.ready_len(), 1);
    }
}
