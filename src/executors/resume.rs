use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{DispatchError, JobExecutor, JobOutcome, payload_mismatch};
use crate::jobs::{Job, JobPayload};
use crate::runs::FlowRunService;

/// Resumes runs whose delay pause has elapsed. A run that was already resumed
/// some other way rejects the job.
pub struct ResumeExecutor {
    runs: Arc<FlowRunService>,
}

impl ResumeExecutor {
    pub fn new(runs: Arc<FlowRunService>) -> Self {
        Self { runs }
    }
}

#[async_trait]
impl JobExecutor for ResumeExecutor {
    async fn execute(&self, job: &Job, _deadline: Duration) -> Result<JobOutcome, DispatchError> {
        let JobPayload::DelayedResume(resume) = &job.payload else {
            return Err(payload_mismatch(job));
        };
        match self
            .runs
            .resume(resume.run_id, resume.flow_version_id, resume.payload.clone())
            .await
        {
            Ok(job_id) => Ok(JobOutcome::Resumed { job_id }),
            Err(err) if err.is_stale() => Err(DispatchError::Rejected(err.to_string())),
            Err(err) => Err(DispatchError::Transient(err.to_string())),
        }
    }
}
