//! Per-job-type executors behind one dispatch path.
//!
//! Every executor turns a leased [`Job`] into a [`JobOutcome`] or a
//! [`DispatchError`]; the dispatcher decides what the error means for the job.

mod flow_run;
mod resume;
mod trigger_poll;
mod webhook;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use flow_run::FlowRunExecutor;
pub use resume::ResumeExecutor;
pub use trigger_poll::TriggerPollExecutor;
pub use webhook::WebhookExecutor;

use crate::engine::FlowExecutionResult;
use crate::jobs::{FailureReason, Job, JobId, JobType};
use crate::sandbox::SandboxError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("job rejected: {0}")]
    Rejected(String),
    #[error("job exceeded its {0:?} deadline")]
    TimedOut(Duration),
    #[error("no executor registered for {0:?} jobs")]
    NoExecutor(JobType),
}

impl DispatchError {
    /// Whether another attempt could produce a different outcome.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DispatchError::Sandbox(_) | DispatchError::Transient(_) | DispatchError::TimedOut(_)
        )
    }

    pub fn failure_reason(&self) -> FailureReason {
        match self {
            DispatchError::Sandbox(err) => err.failure_reason(),
            DispatchError::Transient(_) | DispatchError::NoExecutor(_) => FailureReason::Internal,
            DispatchError::Rejected(_) => FailureReason::Rejected,
            DispatchError::TimedOut(_) => FailureReason::TimedOut,
        }
    }
}

#[derive(Clone, Debug)]
pub enum JobOutcome {
    FlowRun(Box<FlowExecutionResult>),
    Delivered { status_code: u16 },
    Polled { runs_started: usize },
    Resumed { job_id: JobId },
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Runs `job`, which must finish within `deadline`.
    async fn execute(&self, job: &Job, deadline: Duration) -> Result<JobOutcome, DispatchError>;
}

#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<JobType, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, job_type: JobType, executor: Arc<dyn JobExecutor>) -> Self {
        self.executors.insert(job_type, executor);
        self
    }

    pub fn get(&self, job_type: JobType) -> Result<Arc<dyn JobExecutor>, DispatchError> {
        self.executors
            .get(&job_type)
            .cloned()
            .ok_or(DispatchError::NoExecutor(job_type))
    }
}

fn payload_mismatch(job: &Job) -> DispatchError {
    DispatchError::Rejected(format!(
        "{} job carries a {} payload",
        job.job_type.as_str(),
        job.payload.job_type().as_str()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_faults_are_recoverable_with_their_reason() {
        let oom = DispatchError::from(SandboxError::OutOfMemory);
        assert!(oom.is_recoverable());
        assert_eq!(oom.failure_reason(), FailureReason::Oom);

        let cpu = DispatchError::from(SandboxError::CpuLimitExceeded);
        assert_eq!(cpu.failure_reason(), FailureReason::TimedOut);

        let protocol = DispatchError::from(SandboxError::Protocol("garbage".into()));
        assert_eq!(protocol.failure_reason(), FailureReason::ProtocolError);
    }

    #[test]
    fn rejections_are_final() {
        let rejected = DispatchError::Rejected("bad input".into());
        assert!(!rejected.is_recoverable());
        assert!(!DispatchError::NoExecutor(JobType::FlowRun).is_recoverable());
    }

    #[test]
    fn missing_executor_is_reported() {
        let registry = ExecutorRegistry::new();
        assert!(matches!(
            registry.get(JobType::TriggerPoll),
            Err(DispatchError::NoExecutor(JobType::TriggerPoll))
        ));
    }
}
