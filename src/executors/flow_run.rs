use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{DispatchError, JobExecutor, JobOutcome, payload_mismatch};
use crate::engine::{FlowExecutionResult, decode_response};
use crate::jobs::{Job, JobPayload};
use crate::messages::{EngineOperation, ExecuteFlowOperation, ResponseStatus};
use crate::sandbox::{SandboxError, SandboxPool};

/// Runs BEGIN and RESUME executions inside a sandbox.
pub struct FlowRunExecutor {
    pool: Arc<SandboxPool>,
}

impl FlowRunExecutor {
    pub fn new(pool: Arc<SandboxPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobExecutor for FlowRunExecutor {
    async fn execute(&self, job: &Job, deadline: Duration) -> Result<JobOutcome, DispatchError> {
        let JobPayload::FlowRun(run) = &job.payload else {
            return Err(payload_mismatch(job));
        };
        let operation = EngineOperation::ExecuteFlow(Box::new(ExecuteFlowOperation {
            run_id: run.run_id,
            flow: run.flow.clone(),
            execution_type: run.execution_type,
            state: run.state.clone(),
            payload: run.payload.clone(),
        }));

        let mut sandbox = self.pool.acquire().await?;
        let submitted = sandbox.submit(operation, deadline).await;
        sandbox.release().await;
        let response = submitted?;

        match response.status {
            ResponseStatus::Ok => {
                let result: FlowExecutionResult = decode_response(response.response)
                    .map_err(|err| SandboxError::Protocol(format!("undecodable flow result: {err}")))?;
                debug!(run_id = %run.run_id, status = result.status.as_str(), "flow run executed");
                Ok(JobOutcome::FlowRun(Box::new(result)))
            }
            ResponseStatus::Error => {
                let message = response.error_message().unwrap_or("engine error").to_string();
                warn!(run_id = %run.run_id, %message, "engine refused flow run");
                Err(DispatchError::Rejected(message))
            }
        }
    }
}
