//! Flow interpreter.
//!
//! Walks the step tree depth-first in declaration order and records one
//! [`StepOutput`] per visited step. A resume replays the same walk: terminal
//! leaf outputs are kept and skipped, recorded branch/router decisions and loop
//! item lists are reused, and the paused step receives the resume payload as
//! its output before traversal continues.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::condition::{evaluate_groups, resolve_groups};
use super::path::StepExecutionPath;
use super::resolver::InputResolver;
use super::retry::{PieceRetryPolicy, run_with_retries};
use super::state::{ExecutionState, PauseRecord, StateError, StepOutput, StepOutputStatus};
use crate::flow::{
    Condition, ErrorHandlingOptions, ExecutionType, FailedStep, FlowGraph, FlowRunStatus,
    GraphError, PauseMetadata, RouterBranch, RouterBranchKind, RouterExecution, Step, StepKind,
    StepType,
};
use crate::pieces::{
    Action, ControlSignal, PieceContext, PieceError, PieceRegistry, RunHooks, TagHooks,
};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid flow graph: {0}")]
    Graph(#[from] GraphError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("cannot resume: execution state holds no paused step")]
    NotPaused,
    #[error("paused step {0} is not part of this flow version")]
    UnknownPausedStep(String),
    #[error("paused step {name} has no paused output at {path}")]
    PausedOutputMissing { name: String, path: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowExecutionResult {
    pub status: FlowRunStatus,
    pub state: ExecutionState,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub pause_metadata: Option<PauseMetadata>,
    #[serde(default)]
    pub failed_step: Option<FailedStep>,
    pub duration_ms: u64,
}

enum Verdict {
    Continue,
    Paused,
    Stopped(Value),
    Failed(FailedStep),
}

struct ResumeTarget {
    step_name: String,
    path: StepExecutionPath,
    payload: Value,
}

/// Mutable state of one `execute` call.
struct RunCursor {
    run_id: Uuid,
    execution_type: ExecutionType,
    state: ExecutionState,
    trigger_payload: Value,
    resume_payload: Option<Value>,
    resume: Option<ResumeTarget>,
}

impl RunCursor {
    fn piece_context(&self, step: &Step, path: &StepExecutionPath, input: Value) -> PieceContext {
        PieceContext {
            run_id: self.run_id,
            step_name: step.name.clone(),
            input,
            execution_type: self.execution_type,
            trigger_payload: self.trigger_payload.clone(),
            resume_payload: self.resume_payload.clone(),
            steps: InputResolver::new(&self.state, path).snapshot(),
            run: RunHooks::default(),
            tags: TagHooks::default(),
        }
    }
}

pub struct FlowExecutor {
    registry: Arc<PieceRegistry>,
    retry_policy: PieceRetryPolicy,
}

impl FlowExecutor {
    pub fn new(registry: Arc<PieceRegistry>) -> Self {
        Self {
            registry,
            retry_policy: PieceRetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: PieceRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn registry(&self) -> &Arc<PieceRegistry> {
        &self.registry
    }

    pub async fn execute(
        &self,
        run_id: Uuid,
        graph: &FlowGraph,
        execution_type: ExecutionType,
        mut state: ExecutionState,
        payload: Value,
    ) -> Result<FlowExecutionResult, EngineError> {
        graph.validate()?;
        let started = Instant::now();
        let root = StepExecutionPath::root();

        let (resume, resume_payload) = match execution_type {
            ExecutionType::Begin => {
                let trigger = StepOutput::new(StepType::Trigger, StepOutputStatus::Succeeded, Value::Null)
                    .with_output(payload);
                state.upsert_step(&root, &graph.trigger.name, trigger)?;
                (None, None)
            }
            ExecutionType::Resume => {
                let record = state.pause.take().ok_or(EngineError::NotPaused)?;
                if graph.find_step(&record.step_name).is_none() {
                    return Err(EngineError::UnknownPausedStep(record.step_name));
                }
                let paused = state
                    .get_step_output(&record.path, &record.step_name)
                    .is_some_and(|output| output.status == StepOutputStatus::Paused);
                if !paused {
                    return Err(EngineError::PausedOutputMissing {
                        name: record.step_name,
                        path: record.path.to_string(),
                    });
                }
                let target = ResumeTarget {
                    step_name: record.step_name,
                    path: record.path,
                    payload: payload.clone(),
                };
                (Some(target), Some(payload))
            }
        };

        let trigger_payload = state
            .get_step_output(&root, &graph.trigger.name)
            .and_then(|output| output.output.clone())
            .unwrap_or(Value::Null);

        info!(
            run_id = %run_id,
            flow_version_id = %graph.version_id,
            execution_type = ?execution_type,
            "executing flow"
        );

        let mut cursor = RunCursor {
            run_id,
            execution_type,
            state,
            trigger_payload,
            resume_payload,
            resume,
        };
        let verdict = self.execute_steps(&mut cursor, &graph.steps, &root).await?;

        let (status, response, failed_step) = match verdict {
            Verdict::Continue => (FlowRunStatus::Succeeded, None, None),
            Verdict::Paused => (FlowRunStatus::Paused, None, None),
            Verdict::Stopped(response) => (FlowRunStatus::Stopped, Some(response), None),
            Verdict::Failed(failed) => (FlowRunStatus::Failed, None, Some(failed)),
        };
        let pause_metadata = cursor
            .state
            .pause
            .as_ref()
            .filter(|_| status == FlowRunStatus::Paused)
            .map(|record| record.metadata.clone());
        let duration_ms = started.elapsed().as_millis() as u64;

        info!(
            run_id = %run_id,
            status = status.as_str(),
            steps = cursor.state.output_count(),
            duration_ms,
            "flow execution finished"
        );

        Ok(FlowExecutionResult {
            status,
            state: cursor.state,
            response,
            pause_metadata,
            failed_step,
            duration_ms,
        })
    }

    fn execute_steps<'a>(
        &'a self,
        cursor: &'a mut RunCursor,
        steps: &'a [Step],
        path: &'a StepExecutionPath,
    ) -> BoxFuture<'a, Result<Verdict, EngineError>> {
        Box::pin(async move {
            for step in steps {
                if step.skip {
                    debug!(step = %step.name, "skipping step");
                    continue;
                }
                let verdict = match &step.kind {
                    StepKind::Action {
                        piece,
                        action,
                        input,
                        error_handling,
                    } => {
                        let target = self.registry.action(piece, action);
                        self.execute_leaf(cursor, step, target, input, *error_handling, path)
                            .await?
                    }
                    StepKind::Code {
                        module,
                        input,
                        error_handling,
                    } => {
                        let target = self.registry.code_module(module);
                        self.execute_leaf(cursor, step, target, input, *error_handling, path)
                            .await?
                    }
                    StepKind::Branch {
                        conditions,
                        on_success,
                        on_failure,
                    } => {
                        self.execute_branch(cursor, step, conditions, on_success, on_failure, path)
                            .await?
                    }
                    StepKind::Loop { items, body } => {
                        self.execute_loop(cursor, step, items, body, path).await?
                    }
                    StepKind::Router {
                        execution,
                        branches,
                    } => {
                        self.execute_router(cursor, step, *execution, branches, path)
                            .await?
                    }
                };
                if !matches!(verdict, Verdict::Continue) {
                    return Ok(verdict);
                }
            }
            Ok(Verdict::Continue)
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_leaf(
        &self,
        cursor: &mut RunCursor,
        step: &Step,
        target: Result<Arc<dyn Action>, PieceError>,
        input: &Value,
        error_handling: ErrorHandlingOptions,
        path: &StepExecutionPath,
    ) -> Result<Verdict, EngineError> {
        let recorded = cursor
            .state
            .get_step_output(path, &step.name)
            .map(|output| (output.status, output.input.clone()));
        match recorded {
            Some((status, _)) if status.is_terminal() => return Ok(Verdict::Continue),
            Some((StepOutputStatus::Paused, recorded_input)) => {
                let is_target = cursor
                    .resume
                    .as_ref()
                    .is_some_and(|target| target.step_name == step.name && target.path == *path);
                if is_target && let Some(target) = cursor.resume.take() {
                    let resumed = StepOutput::new(step.step_type(), StepOutputStatus::Succeeded, recorded_input)
                        .with_output(target.payload);
                    cursor.state.upsert_step(path, &step.name, resumed)?;
                    info!(run_id = %cursor.run_id, step = %step.name, %path, "resumed paused step");
                    return Ok(Verdict::Continue);
                }
            }
            _ => {}
        }

        let resolved = InputResolver::new(&cursor.state, path).resolve(input);
        let action = match target {
            Ok(action) => action,
            Err(err) => {
                return self.record_failure(
                    cursor,
                    step,
                    path,
                    resolved,
                    err.to_string(),
                    Duration::ZERO,
                    error_handling,
                );
            }
        };

        let ctx = cursor.piece_context(step, path, resolved.clone());
        let started = Instant::now();
        debug!(run_id = %cursor.run_id, step = %step.name, %path, "running step");
        let result = run_with_retries(
            action.as_ref(),
            &ctx,
            &self.retry_policy,
            error_handling.retry_on_failure,
        )
        .await;
        let elapsed = started.elapsed();
        cursor.state.add_tags(ctx.tags.take());

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                return self.record_failure(
                    cursor,
                    step,
                    path,
                    resolved,
                    err.to_string(),
                    elapsed,
                    error_handling,
                );
            }
        };

        match ctx.run.take_signal() {
            Some(ControlSignal::Pause(metadata)) => {
                let output = StepOutput::new(step.step_type(), StepOutputStatus::Paused, resolved)
                    .with_duration(elapsed);
                cursor.state.upsert_step(path, &step.name, output)?;
                cursor.state.pause = Some(PauseRecord {
                    step_name: step.name.clone(),
                    path: path.clone(),
                    metadata,
                });
                info!(run_id = %cursor.run_id, step = %step.name, %path, "step paused the run");
                Ok(Verdict::Paused)
            }
            Some(ControlSignal::Stop(response)) => {
                let output = StepOutput::new(step.step_type(), StepOutputStatus::Stopped, resolved)
                    .with_output(value)
                    .with_duration(elapsed);
                cursor.state.upsert_step(path, &step.name, output)?;
                info!(run_id = %cursor.run_id, step = %step.name, "step stopped the run");
                Ok(Verdict::Stopped(response))
            }
            None => {
                let output = StepOutput::new(step.step_type(), StepOutputStatus::Succeeded, resolved)
                    .with_output(value)
                    .with_duration(elapsed);
                cursor.state.upsert_step(path, &step.name, output)?;
                Ok(Verdict::Continue)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_failure(
        &self,
        cursor: &mut RunCursor,
        step: &Step,
        path: &StepExecutionPath,
        input: Value,
        message: String,
        elapsed: Duration,
        error_handling: ErrorHandlingOptions,
    ) -> Result<Verdict, EngineError> {
        let output = StepOutput::new(step.step_type(), StepOutputStatus::Failed, input)
            .with_error(message.clone())
            .with_duration(elapsed);
        cursor.state.upsert_step(path, &step.name, output)?;
        if error_handling.continue_on_failure {
            warn!(
                run_id = %cursor.run_id,
                step = %step.name,
                error = %message,
                "step failed, continuing"
            );
            return Ok(Verdict::Continue);
        }
        warn!(run_id = %cursor.run_id, step = %step.name, error = %message, "step failed");
        Ok(Verdict::Failed(FailedStep {
            name: step.name.clone(),
            message,
        }))
    }

    async fn execute_branch(
        &self,
        cursor: &mut RunCursor,
        step: &Step,
        conditions: &[Vec<Condition>],
        on_success: &[Step],
        on_failure: &[Step],
        path: &StepExecutionPath,
    ) -> Result<Verdict, EngineError> {
        let recorded = cursor
            .state
            .get_step_output(path, &step.name)
            .filter(|output| output.status == StepOutputStatus::Succeeded)
            .map(|output| {
                output
                    .output
                    .as_ref()
                    .and_then(|value| value.get("condition"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            });

        let decision = match recorded {
            Some(decision) => decision,
            None => {
                let started = Instant::now();
                let resolved = resolve_groups(conditions, &InputResolver::new(&cursor.state, path));
                let decision = evaluate_groups(&resolved);
                let input = json!({ "conditions": serde_json::to_value(&resolved).unwrap_or(Value::Null) });
                let output = StepOutput::new(StepType::Branch, StepOutputStatus::Succeeded, input)
                    .with_output(json!({ "condition": decision }))
                    .with_duration(started.elapsed());
                cursor.state.upsert_step(path, &step.name, output)?;
                debug!(run_id = %cursor.run_id, step = %step.name, decision, "branch evaluated");
                decision
            }
        };

        let side = if decision { on_success } else { on_failure };
        self.execute_steps(cursor, side, path).await
    }

    async fn execute_loop(
        &self,
        cursor: &mut RunCursor,
        step: &Step,
        items: &Value,
        body: &[Step],
        path: &StepExecutionPath,
    ) -> Result<Verdict, EngineError> {
        let recorded = cursor.state.get_step_output(path, &step.name).map(|output| {
            (
                output.status,
                output.input.get("items").and_then(Value::as_array).cloned(),
            )
        });

        let items = match recorded {
            Some((status, _)) if status.is_terminal() => return Ok(Verdict::Continue),
            Some((_, Some(items))) => items,
            _ => match InputResolver::new(&cursor.state, path).resolve(items) {
                Value::Array(items) => {
                    let output = StepOutput::new(
                        StepType::Loop,
                        StepOutputStatus::Running,
                        json!({ "items": items }),
                    );
                    cursor.state.upsert_step(path, &step.name, output)?;
                    items
                }
                other => {
                    let message = format!("loop items must resolve to a list, got {}", json_kind(&other));
                    return self.record_failure(
                        cursor,
                        step,
                        path,
                        json!({ "items": other }),
                        message,
                        Duration::ZERO,
                        ErrorHandlingOptions::default(),
                    );
                }
            },
        };

        let started = Instant::now();
        let mut iteration_path = path.clone();
        for (index, item) in items.iter().enumerate() {
            {
                let owner = cursor.state.running_output_mut(path, &step.name)?;
                owner.status = StepOutputStatus::Running;
                owner.output = Some(json!({ "item": item, "index": index }));
                owner.iteration_mut(index);
            }
            iteration_path = iteration_path.loop_iteration(&step.name, index);
            let verdict = self.execute_steps(cursor, body, &iteration_path).await?;
            iteration_path = iteration_path.remove_last();

            let final_status = match &verdict {
                Verdict::Continue => continue,
                Verdict::Paused => StepOutputStatus::Paused,
                Verdict::Stopped(_) => StepOutputStatus::Succeeded,
                Verdict::Failed(_) => StepOutputStatus::Failed,
            };
            self.settle_loop(cursor, step, path, final_status, started.elapsed())?;
            return Ok(verdict);
        }

        self.settle_loop(cursor, step, path, StepOutputStatus::Succeeded, started.elapsed())?;
        Ok(Verdict::Continue)
    }

    fn settle_loop(
        &self,
        cursor: &mut RunCursor,
        step: &Step,
        path: &StepExecutionPath,
        status: StepOutputStatus,
        elapsed: Duration,
    ) -> Result<(), EngineError> {
        let owner = cursor.state.running_output_mut(path, &step.name)?;
        owner.status = status;
        owner.duration_ms += elapsed.as_millis() as u64;
        Ok(())
    }

    async fn execute_router(
        &self,
        cursor: &mut RunCursor,
        step: &Step,
        execution: RouterExecution,
        branches: &[RouterBranch],
        path: &StepExecutionPath,
    ) -> Result<Verdict, EngineError> {
        let recorded = cursor
            .state
            .get_step_output(path, &step.name)
            .filter(|output| output.status == StepOutputStatus::Succeeded)
            .and_then(|output| output.output.as_ref())
            .and_then(|value| value.get("branches"))
            .and_then(Value::as_array)
            .map(|evaluations| {
                evaluations
                    .iter()
                    .map(|entry| entry.get("evaluation").and_then(Value::as_bool).unwrap_or(false))
                    .collect::<Vec<bool>>()
            });

        let selected = match recorded {
            Some(selected) if selected.len() == branches.len() => selected,
            _ => {
                let started = Instant::now();
                let mut selected: Vec<bool> = {
                    let resolver = InputResolver::new(&cursor.state, path);
                    branches
                        .iter()
                        .map(|branch| {
                            branch.kind == RouterBranchKind::Condition
                                && evaluate_groups(&resolve_groups(&branch.conditions, &resolver))
                        })
                        .collect()
                };
                if execution == RouterExecution::ExecuteFirstMatch
                    && let Some(first) = selected.iter().position(|hit| *hit)
                {
                    for (idx, hit) in selected.iter_mut().enumerate() {
                        *hit = idx == first;
                    }
                }
                if !selected.iter().any(|hit| *hit) {
                    for (branch, hit) in branches.iter().zip(selected.iter_mut()) {
                        *hit = branch.kind == RouterBranchKind::Fallback;
                    }
                }
                let evaluations: Vec<Value> = branches
                    .iter()
                    .zip(&selected)
                    .enumerate()
                    .map(|(index, (branch, hit))| {
                        json!({ "name": branch.name, "index": index, "evaluation": hit })
                    })
                    .collect();
                let output = StepOutput::new(
                    StepType::Router,
                    StepOutputStatus::Succeeded,
                    json!({ "execution": execution }),
                )
                .with_output(json!({ "branches": evaluations }))
                .with_duration(started.elapsed());
                cursor.state.upsert_step(path, &step.name, output)?;
                selected
            }
        };

        for (branch, hit) in branches.iter().zip(selected) {
            if !hit {
                continue;
            }
            let verdict = self.execute_steps(cursor, &branch.steps, path).await?;
            if !matches!(verdict, Verdict::Continue) {
                return Ok(verdict);
            }
        }
        Ok(Verdict::Continue)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
