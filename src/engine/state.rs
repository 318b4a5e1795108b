//! Execution trace of a single run: ordered step outputs, tags and the pause record.

use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::path::StepExecutionPath;
use crate::flow::{PauseMetadata, StepType};

pub type StepMap = IndexMap<String, StepOutput>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("loop {loop_name} has no recorded output at {path}")]
    MissingLoop { loop_name: String, path: String },
    #[error("loop {loop_name} has no iteration {iteration} at {path}")]
    MissingIteration {
        loop_name: String,
        iteration: usize,
        path: String,
    },
    #[error("step {name} at {path} already has a terminal output")]
    TerminalOutput { name: String, path: String },
    #[error("step {name} at {path} has no recorded output")]
    MissingOutput { name: String, path: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutputStatus {
    Running,
    Succeeded,
    Failed,
    Paused,
    Stopped,
}

impl StepOutputStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepOutputStatus::Succeeded | StepOutputStatus::Failed | StepOutputStatus::Stopped
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub step_type: StepType,
    pub status: StepOutputStatus,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Per-iteration outputs of a loop step, indexed by iteration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iterations: Vec<StepMap>,
}

impl StepOutput {
    pub fn new(step_type: StepType, status: StepOutputStatus, input: Value) -> Self {
        Self {
            step_type,
            status,
            input,
            output: None,
            duration_ms: 0,
            error_message: None,
            iterations: Vec::new(),
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    /// Returns the map for `iteration`, creating empty maps up to it.
    pub fn iteration_mut(&mut self, iteration: usize) -> &mut StepMap {
        while self.iterations.len() <= iteration {
            self.iterations.push(StepMap::new());
        }
        &mut self.iterations[iteration]
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PauseRecord {
    pub step_name: String,
    pub path: StepExecutionPath,
    pub metadata: PauseMetadata,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    #[serde(default)]
    pub steps: StepMap,
    #[serde(default)]
    pub tags: IndexSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause: Option<PauseRecord>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step map addressed by `path`: the top level for the root path, otherwise
    /// the iteration map of the innermost loop frame.
    pub fn step_map(&self, path: &StepExecutionPath) -> Result<&StepMap, StateError> {
        let mut current = &self.steps;
        for frame in path.frames() {
            let owner = current
                .get(&frame.loop_name)
                .ok_or_else(|| StateError::MissingLoop {
                    loop_name: frame.loop_name.clone(),
                    path: path.to_string(),
                })?;
            current = owner
                .iterations
                .get(frame.iteration)
                .ok_or_else(|| StateError::MissingIteration {
                    loop_name: frame.loop_name.clone(),
                    iteration: frame.iteration,
                    path: path.to_string(),
                })?;
        }
        Ok(current)
    }

    fn step_map_mut(&mut self, path: &StepExecutionPath) -> Result<&mut StepMap, StateError> {
        let rendered = path.to_string();
        let mut current = &mut self.steps;
        for frame in path.frames() {
            let owner = current
                .get_mut(&frame.loop_name)
                .ok_or_else(|| StateError::MissingLoop {
                    loop_name: frame.loop_name.clone(),
                    path: rendered.clone(),
                })?;
            current = owner
                .iterations
                .get_mut(frame.iteration)
                .ok_or_else(|| StateError::MissingIteration {
                    loop_name: frame.loop_name.clone(),
                    iteration: frame.iteration,
                    path: rendered.clone(),
                })?;
        }
        Ok(current)
    }

    pub fn get_step_output(&self, path: &StepExecutionPath, name: &str) -> Option<&StepOutput> {
        self.step_map(path).ok()?.get(name)
    }

    /// Inserts or replaces the output of `name` at `path`. Terminal outputs are
    /// write-once; replacing keeps the original insertion position.
    pub fn upsert_step(
        &mut self,
        path: &StepExecutionPath,
        name: &str,
        output: StepOutput,
    ) -> Result<(), StateError> {
        let map = self.step_map_mut(path)?;
        if let Some(existing) = map.get(name)
            && existing.status.is_terminal()
        {
            return Err(StateError::TerminalOutput {
                name: name.to_string(),
                path: path.to_string(),
            });
        }
        map.insert(name.to_string(), output);
        Ok(())
    }

    /// Mutable access to a non-terminal output, used while a loop is in progress.
    pub fn running_output_mut(
        &mut self,
        path: &StepExecutionPath,
        name: &str,
    ) -> Result<&mut StepOutput, StateError> {
        let rendered = path.to_string();
        let output = self
            .step_map_mut(path)?
            .get_mut(name)
            .ok_or_else(|| StateError::MissingOutput {
                name: name.to_string(),
                path: rendered.clone(),
            })?;
        if output.status.is_terminal() {
            return Err(StateError::TerminalOutput {
                name: name.to_string(),
                path: rendered,
            });
        }
        Ok(output)
    }

    /// Every output visible from `path`: top level first, then each enclosing
    /// iteration in turn, so the innermost binding of a name wins.
    pub fn visible_outputs(&self, path: &StepExecutionPath) -> IndexMap<&str, &StepOutput> {
        let mut visible: IndexMap<&str, &StepOutput> = self
            .steps
            .iter()
            .map(|(name, output)| (name.as_str(), output))
            .collect();
        let mut current = &self.steps;
        for frame in path.frames() {
            let Some(iteration) = current
                .get(&frame.loop_name)
                .and_then(|owner| owner.iterations.get(frame.iteration))
            else {
                break;
            };
            for (name, output) in iteration {
                visible.insert(name.as_str(), output);
            }
            current = iteration;
        }
        visible
    }

    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
    }

    /// Number of outputs recorded anywhere in the trace, iterations included.
    pub fn output_count(&self) -> usize {
        fn count(map: &StepMap) -> usize {
            map.values()
                .map(|output| 1 + output.iterations.iter().map(count).sum::<usize>())
                .sum()
        }
        count(&self.steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn succeeded(value: Value) -> StepOutput {
        StepOutput::new(StepType::Action, StepOutputStatus::Succeeded, Value::Null)
            .with_output(value)
    }

    fn state_with_loop() -> ExecutionState {
        let mut state = ExecutionState::new();
        let root = StepExecutionPath::root();
        let mut owner = StepOutput::new(StepType::Loop, StepOutputStatus::Running, Value::Null);
        owner.iteration_mut(1);
        state.upsert_step(&root, "Loop", owner).unwrap();
        state
    }

    #[test]
    fn terminal_outputs_are_write_once() {
        let mut state = ExecutionState::new();
        let root = StepExecutionPath::root();
        state.upsert_step(&root, "a", succeeded(json!(1))).unwrap();
        let err = state.upsert_step(&root, "a", succeeded(json!(2))).unwrap_err();
        assert!(matches!(err, StateError::TerminalOutput { .. }));
        assert_eq!(
            state.get_step_output(&root, "a").and_then(|o| o.output.clone()),
            Some(json!(1))
        );
    }

    #[test]
    fn paused_outputs_can_be_replaced_in_place() {
        let mut state = ExecutionState::new();
        let root = StepExecutionPath::root();
        state.upsert_step(&root, "first", succeeded(json!(0))).unwrap();
        state
            .upsert_step(
                &root,
                "wait",
                StepOutput::new(StepType::Action, StepOutputStatus::Paused, Value::Null),
            )
            .unwrap();
        state.upsert_step(&root, "wait", succeeded(json!("done"))).unwrap();
        let names: Vec<&String> = state.steps.keys().collect();
        assert_eq!(names, vec!["first", "wait"]);
    }

    #[test]
    fn outputs_inside_iterations_are_addressed_by_path() {
        let mut state = state_with_loop();
        let inner = StepExecutionPath::root().loop_iteration("Loop", 1);
        state.upsert_step(&inner, "double", succeeded(json!(4))).unwrap();

        assert!(state.get_step_output(&StepExecutionPath::root(), "double").is_none());
        assert_eq!(
            state.get_step_output(&inner, "double").and_then(|o| o.output.clone()),
            Some(json!(4))
        );
        assert_eq!(state.output_count(), 2);
    }

    #[test]
    fn missing_iteration_is_reported() {
        let mut state = state_with_loop();
        let inner = StepExecutionPath::root().loop_iteration("Loop", 5);
        let err = state.upsert_step(&inner, "double", succeeded(json!(1))).unwrap_err();
        assert!(matches!(err, StateError::MissingIteration { iteration: 5, .. }));
    }

    #[test]
    fn visible_outputs_prefer_innermost_binding() {
        let mut state = state_with_loop();
        let root = StepExecutionPath::root();
        state.upsert_step(&root, "value", succeeded(json!("outer"))).unwrap();
        let inner = root.loop_iteration("Loop", 0);
        state.upsert_step(&inner, "value", succeeded(json!("inner"))).unwrap();

        let visible = state.visible_outputs(&inner);
        assert_eq!(visible["value"].output, Some(json!("inner")));
        assert!(visible.contains_key("Loop"));
        assert_eq!(
            state.visible_outputs(&root)["value"].output,
            Some(json!("outer"))
        );
    }

    #[test]
    fn running_output_mut_rejects_terminal_outputs() {
        let mut state = ExecutionState::new();
        let root = StepExecutionPath::root();
        state.upsert_step(&root, "done", succeeded(json!(true))).unwrap();
        assert!(state.running_output_mut(&root, "done").is_err());
        assert!(matches!(
            state.running_output_mut(&root, "absent"),
            Err(StateError::MissingOutput { .. })
        ));
    }
}
