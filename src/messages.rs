//! Line-framed JSON protocol between a sandbox handle and its engine process.
//!
//! Each frame is one JSON object on one line. The worker writes
//! `engine-operation` frames to the engine's stdin; the engine answers each with
//! exactly one `engine-response` frame on stdout, after announcing itself with a
//! single `engine-ready` frame.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::LinesCodecError;
use uuid::Uuid;

use crate::engine::ExecutionState;
use crate::flow::{ExecutionType, FlowGraph, PieceRef};

/// Upper bound for a single frame; an execution state travels in one line.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Codec(#[from] LinesCodecError),
    #[error("channel closed")]
    ChannelClosed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    ExecuteFlow,
    ExecuteTriggerPoll,
    ExtractPieceMetadata,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Frames written by the worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SandboxMessage {
    EngineOperation {
        operation_type: OperationType,
        #[serde(default)]
        operation: Value,
    },
}

/// Frames written by the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineMessage {
    EngineReady { pid: u32 },
    EngineResponse {
        status: ResponseStatus,
        #[serde(default)]
        response: Value,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineResponse {
    pub status: ResponseStatus,
    pub response: Value,
}

impl EngineResponse {
    pub fn ok(response: Value) -> Self {
        Self {
            status: ResponseStatus::Ok,
            response,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            response: serde_json::json!({ "message": message.into() }),
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.response.get("message").and_then(Value::as_str)
    }

    pub fn into_message(self) -> EngineMessage {
        EngineMessage::EngineResponse {
            status: self.status,
            response: self.response,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecuteFlowOperation {
    pub run_id: Uuid,
    pub flow: FlowGraph,
    pub execution_type: ExecutionType,
    #[serde(default)]
    pub state: ExecutionState,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerPollOperation {
    pub flow_version_id: Uuid,
    pub piece: PieceRef,
    pub trigger: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub last_polled_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerPollResult {
    pub events: Vec<Value>,
}

/// Typed view of an `engine-operation` frame.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineOperation {
    ExecuteFlow(Box<ExecuteFlowOperation>),
    ExecuteTriggerPoll(TriggerPollOperation),
    ExtractPieceMetadata,
}

impl EngineOperation {
    pub fn operation_type(&self) -> OperationType {
        match self {
            EngineOperation::ExecuteFlow(_) => OperationType::ExecuteFlow,
            EngineOperation::ExecuteTriggerPoll(_) => OperationType::ExecuteTriggerPoll,
            EngineOperation::ExtractPieceMetadata => OperationType::ExtractPieceMetadata,
        }
    }

    pub fn into_message(self) -> Result<SandboxMessage, MessageError> {
        let operation_type = self.operation_type();
        let operation = match self {
            EngineOperation::ExecuteFlow(op) => serde_json::to_value(op),
            EngineOperation::ExecuteTriggerPoll(op) => serde_json::to_value(op),
            EngineOperation::ExtractPieceMetadata => Ok(Value::Null),
        }
        .map_err(MessageError::Encode)?;
        Ok(SandboxMessage::EngineOperation {
            operation_type,
            operation,
        })
    }

    pub fn from_message(message: SandboxMessage) -> Result<Self, MessageError> {
        let SandboxMessage::EngineOperation {
            operation_type,
            operation,
        } = message;
        Ok(match operation_type {
            OperationType::ExecuteFlow => EngineOperation::ExecuteFlow(Box::new(
                serde_json::from_value(operation).map_err(MessageError::Decode)?,
            )),
            OperationType::ExecuteTriggerPoll => EngineOperation::ExecuteTriggerPoll(
                serde_json::from_value(operation).map_err(MessageError::Decode)?,
            ),
            OperationType::ExtractPieceMetadata => EngineOperation::ExtractPieceMetadata,
        })
    }
}

pub fn encode_message<T: Serialize>(message: &T) -> Result<String, MessageError> {
    serde_json::to_string(message).map_err(MessageError::Encode)
}

pub fn decode_message<T: DeserializeOwned>(line: &str) -> Result<T, MessageError> {
    serde_json::from_str(line).map_err(MessageError::Decode)
}
