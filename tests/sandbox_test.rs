//! Drives the real `flowrunner-engine` binary through sandbox handles.

use std::time::{Duration, Instant};

use serde_json::{Value, json};
use uuid::Uuid;

use flowrunner::engine::{ExecutionState, FlowExecutionResult, StepExecutionPath, decode_response};
use flowrunner::flow::{
    ErrorHandlingOptions, ExecutionType, FlowGraph, FlowRunStatus, PieceRef, Step, StepKind,
    TriggerKind, TriggerNode,
};
use flowrunner::messages::{EngineOperation, ExecuteFlowOperation, ResponseStatus};
use flowrunner::pieces::builtin::{CORE_PIECE, CORE_VERSION};
use flowrunner::sandbox::{SandboxConfig, SandboxError, SandboxHandle, SandboxLimits, SandboxState};

fn engine_config() -> SandboxConfig {
    SandboxConfig::new(env!("CARGO_BIN_EXE_flowrunner-engine"))
}

fn core(name: &str, action: &str, input: Value) -> Step {
    Step::new(
        name,
        StepKind::Action {
            piece: PieceRef::new(CORE_PIECE, CORE_VERSION),
            action: action.to_string(),
            input,
            error_handling: ErrorHandlingOptions::default(),
        },
    )
}

fn flow(steps: Vec<Step>) -> FlowGraph {
    FlowGraph::new(
        TriggerNode {
            name: "trigger".to_string(),
            kind: TriggerKind::Webhook,
        },
        steps,
    )
}

fn execute(flow: FlowGraph, payload: Value) -> EngineOperation {
    EngineOperation::ExecuteFlow(Box::new(ExecuteFlowOperation {
        run_id: Uuid::new_v4(),
        flow,
        execution_type: ExecutionType::Begin,
        state: ExecutionState::default(),
        payload,
    }))
}

#[tokio::test]
async fn executes_a_flow_in_a_sandbox() {
    let mut handle = SandboxHandle::spawn(&engine_config(), SandboxLimits::default())
        .await
        .expect("engine starts");
    assert_eq!(handle.state(), SandboxState::Ready);

    let op = execute(
        flow(vec![
            core("first", "echo", json!("{{trigger.name}}")),
            core("twice", "double", json!({"value": "{{trigger.value}}"})),
        ]),
        json!({"name": "flow", "value": 21}),
    );
    let response = handle
        .submit(op, Duration::from_secs(10))
        .await
        .expect("engine answers");
    assert_eq!(response.status, ResponseStatus::Ok);

    let result: FlowExecutionResult = decode_response(response.response).unwrap();
    assert_eq!(result.status, FlowRunStatus::Succeeded);
    let root = StepExecutionPath::root();
    assert_eq!(
        result.state.get_step_output(&root, "first").unwrap().output,
        Some(json!("flow"))
    );
    assert_eq!(
        result.state.get_step_output(&root, "twice").unwrap().output,
        Some(json!(42))
    );
    assert_eq!(handle.state(), SandboxState::Ready);
    assert_eq!(handle.executions(), 1);
    handle.destroy().await;
}

#[tokio::test]
async fn deadline_kills_a_sleeping_engine() {
    let mut handle = SandboxHandle::spawn(&engine_config(), SandboxLimits::default())
        .await
        .expect("engine starts");
    let op = execute(flow(vec![core("nap", "sleep", json!({"millis": 10_000}))]), Value::Null);

    let started = Instant::now();
    let err = handle.submit(op, Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, SandboxError::TimedOut(d) if d == Duration::from_secs(1)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(handle.state(), SandboxState::Killed);

    let again = execute(flow(vec![core("a", "echo", json!(1))]), Value::Null);
    assert!(matches!(
        handle.submit(again, Duration::from_secs(1)).await,
        Err(SandboxError::Killed)
    ));
}

#[tokio::test]
async fn allocation_beyond_the_memory_limit_reports_oom() {
    let limits = SandboxLimits {
        memory_limit_mb: Some(512),
        cpu_time_limit: None,
    };
    let mut handle = SandboxHandle::spawn(&engine_config(), limits)
        .await
        .expect("engine starts under the limit");
    let op = execute(flow(vec![core("hog", "allocate", json!({"megabytes": 2048}))]), Value::Null);

    let err = handle.submit(op, Duration::from_secs(30)).await.unwrap_err();
    assert!(matches!(err, SandboxError::OutOfMemory), "unexpected error: {err}");
    assert_eq!(handle.state(), SandboxState::Killed);
}

#[tokio::test]
async fn handle_serves_multiple_operations_in_order() {
    let mut handle = SandboxHandle::spawn(&engine_config(), SandboxLimits::default())
        .await
        .expect("engine starts");
    for value in [1, 2, 3] {
        let op = execute(
            flow(vec![core("twice", "double", json!({"value": value}))]),
            Value::Null,
        );
        let response = handle.submit(op, Duration::from_secs(10)).await.unwrap();
        let result: FlowExecutionResult = decode_response(response.response).unwrap();
        assert_eq!(
            result
                .state
                .get_step_output(&StepExecutionPath::root(), "twice")
                .unwrap()
                .output,
            Some(json!(value * 2))
        );
    }
    assert_eq!(handle.executions(), 3);
    handle.destroy().await;
}

#[tokio::test]
async fn missing_engine_binary_fails_to_spawn() {
    let config = SandboxConfig::new("/nonexistent/flowrunner-engine");
    let err = SandboxHandle::spawn(&config, SandboxLimits::default())
        .await
        .err()
        .expect("spawn fails");
    assert!(matches!(err, SandboxError::Spawn(_)));
}
