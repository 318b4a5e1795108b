//! Jobs pulled off the queue by the dispatcher.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::ExecutionState;
use crate::flow::{ExecutionType, FlowGraph, RunEnvironment};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    FlowRun,
    TriggerPoll,
    OutgoingWebhook,
    EventDestination,
    /// Resumes a run whose delay pause has elapsed.
    DelayedResume,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::FlowRun => "FLOW_RUN",
            JobType::TriggerPoll => "TRIGGER_POLL",
            JobType::OutgoingWebhook => "OUTGOING_WEBHOOK",
            JobType::EventDestination => "EVENT_DESTINATION",
            JobType::DelayedResume => "DELAYED_RESUME",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowRunJob {
    pub run_id: Uuid,
    pub flow: FlowGraph,
    pub execution_type: ExecutionType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub state: ExecutionState,
    #[serde(default)]
    pub environment: RunEnvironment,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerPollJob {
    pub flow: FlowGraph,
    #[serde(default)]
    pub last_polled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub environment: RunEnvironment,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookJob {
    pub url: String,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DelayedResumeJob {
    pub run_id: Uuid,
    pub flow_version_id: Uuid,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPayload {
    FlowRun(Box<FlowRunJob>),
    TriggerPoll(Box<TriggerPollJob>),
    OutgoingWebhook(WebhookJob),
    EventDestination(WebhookJob),
    DelayedResume(DelayedResumeJob),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::FlowRun(_) => JobType::FlowRun,
            JobPayload::TriggerPoll(_) => JobType::TriggerPoll,
            JobPayload::OutgoingWebhook(_) => JobType::OutgoingWebhook,
            JobPayload::EventDestination(_) => JobType::EventDestination,
            JobPayload::DelayedResume(_) => JobType::DelayedResume,
        }
    }

    /// The flow run this job belongs to, when it belongs to one.
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            JobPayload::FlowRun(job) => Some(job.run_id),
            JobPayload::DelayedResume(job) => Some(job.run_id),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: JobPayload,
    pub timeout_seconds: u64,
    /// Zero-based; grows by one each time the job is requeued.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(payload: JobPayload, timeout_seconds: u64) -> Self {
        Self {
            id: JobId::new(),
            job_type: payload.job_type(),
            payload,
            timeout_seconds,
            attempt: 0,
            created_at: Utc::now(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Same job, next attempt.
    pub fn next_attempt(mut self) -> Self {
        self.attempt += 1;
        self
    }
}

/// Reason code attached to a job that did not produce a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    Oom,
    Crashed,
    ProtocolError,
    TimedOut,
    Internal,
    Rejected,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Oom => "OOM",
            FailureReason::Crashed => "CRASHED",
            FailureReason::ProtocolError => "PROTOCOL_ERROR",
            FailureReason::TimedOut => "TIMED_OUT",
            FailureReason::Internal => "INTERNAL",
            FailureReason::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_type_follows_payload() {
        let job = Job::new(
            JobPayload::OutgoingWebhook(WebhookJob {
                url: "http://localhost/hook".to_string(),
                headers: IndexMap::new(),
                body: json!({}),
            }),
            30,
        );
        assert_eq!(job.job_type, JobType::OutgoingWebhook);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn next_attempt_keeps_identity() {
        let job = Job::new(
            JobPayload::DelayedResume(DelayedResumeJob {
                run_id: Uuid::nil(),
                flow_version_id: Uuid::nil(),
                payload: Value::Null,
            }),
            5,
        );
        let retried = job.clone().next_attempt();
        assert_eq!(retried.id, job.id);
        assert_eq!(retried.attempt, 1);
        assert_eq!(retried.payload.run_id(), Some(Uuid::nil()));
    }

    #[test]
    fn payload_is_tagged_by_job_type() {
        let payload = JobPayload::EventDestination(WebhookJob {
            url: "http://localhost/events".to_string(),
            headers: IndexMap::new(),
            body: json!({"event": "run.finished"}),
        });
        let raw = serde_json::to_value(&payload).unwrap();
        assert_eq!(raw["type"], json!("EVENT_DESTINATION"));
        assert_eq!(serde_json::from_value::<JobPayload>(raw).unwrap(), payload);
    }
}
