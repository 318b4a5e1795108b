//! Engine-side handling of `engine-operation` frames.

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::executor::FlowExecutor;
use crate::messages::{
    EngineOperation, EngineResponse, ExecuteFlowOperation, TriggerPollOperation, TriggerPollResult,
};
use crate::pieces::TriggerContext;

/// Turns one decoded operation into exactly one response. Failures of the
/// operation itself become `ERROR` responses; nothing here ends the process.
pub struct OperationHandler {
    executor: FlowExecutor,
}

impl OperationHandler {
    pub fn new(executor: FlowExecutor) -> Self {
        Self { executor }
    }

    pub async fn handle(&self, operation: EngineOperation) -> EngineResponse {
        match operation {
            EngineOperation::ExecuteFlow(op) => self.execute_flow(*op).await,
            EngineOperation::ExecuteTriggerPoll(op) => self.poll_trigger(op).await,
            EngineOperation::ExtractPieceMetadata => {
                to_response(&self.executor.registry().metadata())
            }
        }
    }

    async fn execute_flow(&self, op: ExecuteFlowOperation) -> EngineResponse {
        let ExecuteFlowOperation {
            run_id,
            flow,
            execution_type,
            state,
            payload,
        } = op;
        match self
            .executor
            .execute(run_id, &flow, execution_type, state, payload)
            .await
        {
            Ok(result) => {
                info!(%run_id, status = result.status.as_str(), duration_ms = result.duration_ms, "flow executed");
                to_response(&result)
            }
            Err(err) => {
                warn!(%run_id, error = %err, "flow execution rejected");
                EngineResponse::error(err.to_string())
            }
        }
    }

    async fn poll_trigger(&self, op: TriggerPollOperation) -> EngineResponse {
        let trigger = match self.executor.registry().trigger(&op.piece, &op.trigger) {
            Ok(trigger) => trigger,
            Err(err) => return EngineResponse::error(err.to_string()),
        };
        let ctx = TriggerContext {
            input: op.input,
            last_polled_at: op.last_polled_at,
        };
        match trigger.poll(ctx).await {
            Ok(events) => {
                info!(flow_version_id = %op.flow_version_id, events = events.len(), "trigger polled");
                to_response(&TriggerPollResult { events })
            }
            Err(err) => EngineResponse::error(err.to_string()),
        }
    }
}

fn to_response<T: Serialize>(value: &T) -> EngineResponse {
    match serde_json::to_value(value) {
        Ok(value) => EngineResponse::ok(value),
        Err(err) => EngineResponse::error(format!("failed to encode response: {err}")),
    }
}

/// Reads a successful response body back into its typed form.
pub fn decode_response<T: serde::de::DeserializeOwned>(response: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecutionState;
    use crate::engine::executor::FlowExecutionResult;
    use crate::flow::{ExecutionType, FlowGraph, FlowRunStatus, PieceRef, TriggerKind, TriggerNode};
    use crate::messages::ResponseStatus;
    use crate::pieces::{PieceMetadata, builtin};
    use serde_json::json;
    use uuid::Uuid;

    fn trigger() -> TriggerNode {
        TriggerNode {
            name: "trigger".to_string(),
            kind: TriggerKind::Webhook,
        }
    }

    fn handler() -> OperationHandler {
        OperationHandler::new(FlowExecutor::new(builtin::registry()))
    }

    #[tokio::test]
    async fn execute_flow_returns_the_result_body() {
        let graph = FlowGraph::new(trigger(), vec![]);
        let response = handler()
            .handle(EngineOperation::ExecuteFlow(Box::new(ExecuteFlowOperation {
                run_id: Uuid::new_v4(),
                flow: graph,
                execution_type: ExecutionType::Begin,
                state: ExecutionState::default(),
                payload: json!({"hello": "world"}),
            })))
            .await;
        assert_eq!(response.status, ResponseStatus::Ok);
        let result: FlowExecutionResult = decode_response(response.response).unwrap();
        assert_eq!(result.status, FlowRunStatus::Succeeded);
        assert_eq!(result.state.steps["trigger"].output, Some(json!({"hello": "world"})));
    }

    #[tokio::test]
    async fn resume_without_pause_is_an_error_response() {
        let graph = FlowGraph::new(trigger(), vec![]);
        let response = handler()
            .handle(EngineOperation::ExecuteFlow(Box::new(ExecuteFlowOperation {
                run_id: Uuid::new_v4(),
                flow: graph,
                execution_type: ExecutionType::Resume,
                state: ExecutionState::default(),
                payload: json!({}),
            })))
            .await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert!(response.error_message().unwrap().contains("no paused step"));
    }

    #[tokio::test]
    async fn unknown_trigger_is_an_error_response() {
        let response = handler()
            .handle(EngineOperation::ExecuteTriggerPoll(TriggerPollOperation {
                flow_version_id: Uuid::nil(),
                piece: PieceRef::new("core", "0.1.0"),
                trigger: "missing".to_string(),
                input: Value::Null,
                last_polled_at: None,
            }))
            .await;
        assert_eq!(response.status, ResponseStatus::Error);
    }

    #[tokio::test]
    async fn metadata_lists_builtin_pieces() {
        let response = handler().handle(EngineOperation::ExtractPieceMetadata).await;
        let metadata: Vec<PieceMetadata> = decode_response(response.response).unwrap();
        assert_eq!(metadata.len(), 1);
        assert!(metadata[0].actions.contains(&"wait_for_webhook".to_string()));
    }
}
