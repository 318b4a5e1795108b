//! Flow run records and the run status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::graph::FlowGraph;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowRunStatus {
    Running,
    Succeeded,
    Failed,
    Paused,
    Stopped,
    TimedOut,
}

impl FlowRunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, FlowRunStatus::Running | FlowRunStatus::Paused)
    }

    /// RUNNING may end in any other status; PAUSED may only go back to RUNNING.
    pub fn can_transition_to(self, next: FlowRunStatus) -> bool {
        match (self, next) {
            (FlowRunStatus::Running, FlowRunStatus::Running) => false,
            (FlowRunStatus::Running, _) => true,
            (FlowRunStatus::Paused, FlowRunStatus::Running) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlowRunStatus::Running => "RUNNING",
            FlowRunStatus::Succeeded => "SUCCEEDED",
            FlowRunStatus::Failed => "FAILED",
            FlowRunStatus::Paused => "PAUSED",
            FlowRunStatus::Stopped => "STOPPED",
            FlowRunStatus::TimedOut => "TIMED_OUT",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunEnvironment {
    Testing,
    #[default]
    Production,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    Begin,
    Resume,
}

/// Why a run is suspended, as requested by the pausing piece.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseMetadata {
    /// Wait for an inbound webhook call carrying `request_id`.
    Webhook {
        #[serde(default)]
        request_id: String,
        /// Response handed back to the caller that triggered the pause.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },
    /// Resume automatically once `resume_at` has passed.
    Delay { resume_at: DateTime<Utc> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStep {
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("flow run {run_id} cannot move from {from:?} to {to:?}")]
pub struct RunTransitionError {
    pub run_id: Uuid,
    pub from: FlowRunStatus,
    pub to: FlowRunStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowRun {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub flow_version_id: Uuid,
    pub status: FlowRunStatus,
    pub environment: RunEnvironment,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs_file_id: Option<Uuid>,
    #[serde(default)]
    pub failed_step: Option<FailedStep>,
    #[serde(default)]
    pub pause_metadata: Option<PauseMetadata>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl FlowRun {
    pub fn new(flow: &FlowGraph, environment: RunEnvironment) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id: flow.flow_id,
            flow_version_id: flow.version_id,
            status: FlowRunStatus::Running,
            environment,
            started_at: Utc::now(),
            finished_at: None,
            logs_file_id: None,
            failed_step: None,
            pause_metadata: None,
            tags: Vec::new(),
        }
    }

    pub fn transition(&mut self, next: FlowRunStatus) -> Result<(), RunTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(RunTransitionError {
                run_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        if next == FlowRunStatus::Running {
            self.pause_metadata = None;
        }
        Ok(())
    }
}
