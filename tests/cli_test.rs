//! Runs the `flowrunner` CLI against a flow file.

use std::process::Command;

use serde_json::{Value, json};

use flowrunner::flow::{
    ErrorHandlingOptions, FlowGraph, PieceRef, Step, StepKind, TriggerKind, TriggerNode,
};
use flowrunner::pieces::builtin::{CORE_PIECE, CORE_VERSION};

fn cli() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_flowrunner"));
    command
        .env("FLOWRUNNER_ENGINE_PATH", env!("CARGO_BIN_EXE_flowrunner-engine"))
        .env("FLOWRUNNER_CGROUP_ROOT", "")
        .env("FLOWRUNNER_SANDBOX_MEMORY_MB", "512")
        .env("RUST_LOG", "warn");
    command
}

#[test]
fn run_prints_the_finished_report() {
    let flow = FlowGraph::new(
        TriggerNode {
            name: "trigger".to_string(),
            kind: TriggerKind::Webhook,
        },
        vec![Step::new(
            "twice",
            StepKind::Action {
                piece: PieceRef::new(CORE_PIECE, CORE_VERSION),
                action: "double".to_string(),
                input: json!({"value": "{{trigger.value}}"}),
                error_handling: ErrorHandlingOptions::default(),
            },
        )],
    );
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flow.json");
    std::fs::write(&path, serde_json::to_vec(&flow).unwrap()).unwrap();

    let output = cli()
        .args(["run", path.to_str().unwrap(), "--payload", r#"{"value": 5}"#])
        .output()
        .expect("cli runs");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["status"], json!("SUCCEEDED"));
}

#[test]
fn pieces_lists_the_core_piece() {
    let output = cli().arg("pieces").output().expect("cli runs");
    assert!(output.status.success());
    let pieces: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(pieces[0]["name"], json!(CORE_PIECE));
    assert!(
        pieces[0]["actions"]
            .as_array()
            .unwrap()
            .contains(&json!("double"))
    );
}

#[test]
fn invalid_payload_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flow.json");
    std::fs::write(&path, "{}").unwrap();
    let output = cli()
        .args(["run", path.to_str().unwrap()])
        .output()
        .expect("cli runs");
    assert!(!output.status.success());
}
