//! Immutable description of a flow version: one trigger plus a tree of steps.
//!
//! The graph is authored elsewhere and only read by the engine. Child steps are
//! owned by their parent (branch sides, loop bodies, router branches), so the
//! structure is acyclic by construction; [`FlowGraph::validate`] checks the
//! remaining invariant that step names are unique within a version.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Raised when a flow version violates a structural invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("step name must not be empty")]
    EmptyName,
    #[error("duplicate step name: {0}")]
    DuplicateName(String),
    #[error("router {0} declares more than one fallback branch")]
    MultipleFallbacks(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PieceRef {
    pub name: String,
    pub version: String,
}

impl PieceRef {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PieceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    pub flow_id: Uuid,
    pub version_id: Uuid,
    #[serde(default)]
    pub display_name: String,
    pub trigger: TriggerNode,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerNode {
    pub name: String,
    #[serde(default)]
    pub kind: TriggerKind,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    #[default]
    Empty,
    Webhook,
    Polling {
        piece: PieceRef,
        trigger: String,
        #[serde(default)]
        input: Value,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    /// Skipped steps are bypassed without recording an output.
    #[serde(default)]
    pub skip: bool,
    pub kind: StepKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    Action {
        piece: PieceRef,
        action: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        error_handling: ErrorHandlingOptions,
    },
    Code {
        module: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        error_handling: ErrorHandlingOptions,
    },
    Branch {
        conditions: Vec<Vec<Condition>>,
        #[serde(default)]
        on_success: Vec<Step>,
        #[serde(default)]
        on_failure: Vec<Step>,
    },
    Loop {
        items: Value,
        #[serde(default)]
        body: Vec<Step>,
    },
    Router {
        #[serde(default)]
        execution: RouterExecution,
        branches: Vec<RouterBranch>,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHandlingOptions {
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub retry_on_failure: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Trigger,
    Action,
    Code,
    Branch,
    Loop,
    Router,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub first_value: Value,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub second_value: Value,
    #[serde(default)]
    pub case_sensitive: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOperator {
    TextContains,
    TextDoesNotContain,
    TextExactlyMatches,
    TextDoesNotExactlyMatch,
    TextStartsWith,
    TextEndsWith,
    NumberIsGreaterThan,
    NumberIsLessThan,
    NumberIsEqualTo,
    BooleanIsTrue,
    BooleanIsFalse,
    Exists,
    DoesNotExist,
    ListIsEmpty,
    ListIsNotEmpty,
    ListContains,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouterExecution {
    #[default]
    ExecuteFirstMatch,
    ExecuteAllMatch,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouterBranchKind {
    #[default]
    Condition,
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouterBranch {
    pub name: String,
    #[serde(default)]
    pub kind: RouterBranchKind,
    #[serde(default)]
    pub conditions: Vec<Vec<Condition>>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Step {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            skip: false,
            kind,
        }
    }

    pub fn step_type(&self) -> StepType {
        match &self.kind {
            StepKind::Action { .. } => StepType::Action,
            StepKind::Code { .. } => StepType::Code,
            StepKind::Branch { .. } => StepType::Branch,
            StepKind::Loop { .. } => StepType::Loop,
            StepKind::Router { .. } => StepType::Router,
        }
    }

    /// Direct children in declaration order (both branch sides, every router branch).
    pub fn children(&self) -> Vec<&Step> {
        match &self.kind {
            StepKind::Action { .. } | StepKind::Code { .. } => Vec::new(),
            StepKind::Branch {
                on_success,
                on_failure,
                ..
            } => on_success.iter().chain(on_failure.iter()).collect(),
            StepKind::Loop { body, .. } => body.iter().collect(),
            StepKind::Router { branches, .. } => branches
                .iter()
                .flat_map(|branch| branch.steps.iter())
                .collect(),
        }
    }
}

impl FlowGraph {
    pub fn new(trigger: TriggerNode, steps: Vec<Step>) -> Self {
        Self {
            flow_id: Uuid::new_v4(),
            version_id: Uuid::new_v4(),
            display_name: String::new(),
            trigger,
            steps,
        }
    }

    /// Depth-first walk over every step in declaration order.
    pub fn all_steps(&self) -> Vec<&Step> {
        fn walk<'a>(steps: &'a [Step], out: &mut Vec<&'a Step>) {
            for step in steps {
                out.push(step);
                for child in step.children() {
                    walk(std::slice::from_ref(child), out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.steps, &mut out);
        out
    }

    pub fn find_step(&self, name: &str) -> Option<&Step> {
        self.all_steps().into_iter().find(|step| step.name == name)
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        let mut seen = HashSet::new();
        if self.trigger.name.is_empty() {
            return Err(GraphError::EmptyName);
        }
        seen.insert(self.trigger.name.as_str());

        for step in self.all_steps() {
            if step.name.is_empty() {
                return Err(GraphError::EmptyName);
            }
            if !seen.insert(step.name.as_str()) {
                return Err(GraphError::DuplicateName(step.name.clone()));
            }
            if let StepKind::Router { branches, .. } = &step.kind {
                let fallbacks = branches
                    .iter()
                    .filter(|branch| branch.kind == RouterBranchKind::Fallback)
                    .count();
                if fallbacks > 1 {
                    return Err(GraphError::MultipleFallbacks(step.name.clone()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo(name: &str) -> Step {
        Step::new(
            name,
            StepKind::Action {
                piece: PieceRef::new("core", "0.1.0"),
                action: "echo".to_string(),
                input: Value::Null,
                error_handling: ErrorHandlingOptions::default(),
            },
        )
    }

    fn trigger() -> TriggerNode {
        TriggerNode {
            name: "trigger".to_string(),
            kind: TriggerKind::Webhook,
        }
    }

    #[test]
    fn all_steps_walks_depth_first_in_declaration_order() {
        let graph = FlowGraph::new(
            trigger(),
            vec![
                echo("a"),
                Step::new(
                    "loop",
                    StepKind::Loop {
                        items: json!([1, 2]),
                        body: vec![echo("b"), echo("c")],
                    },
                ),
                echo("d"),
            ],
        );
        let names: Vec<&str> = graph.all_steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "loop", "b", "c", "d"]);
    }

    #[test]
    fn validate_rejects_duplicate_names_in_nested_steps() {
        let graph = FlowGraph::new(
            trigger(),
            vec![
                echo("a"),
                Step::new(
                    "branch",
                    StepKind::Branch {
                        conditions: Vec::new(),
                        on_success: vec![echo("a")],
                        on_failure: Vec::new(),
                    },
                ),
            ],
        );
        assert_eq!(
            graph.validate(),
            Err(GraphError::DuplicateName("a".to_string()))
        );
    }

    #[test]
    fn validate_rejects_step_named_like_trigger() {
        let graph = FlowGraph::new(trigger(), vec![echo("trigger")]);
        assert!(matches!(
            graph.validate(),
            Err(GraphError::DuplicateName(_))
        ));
    }

    #[test]
    fn validate_rejects_second_fallback_branch() {
        let fallback = |name: &str| RouterBranch {
            name: name.to_string(),
            kind: RouterBranchKind::Fallback,
            conditions: Vec::new(),
            steps: Vec::new(),
        };
        let graph = FlowGraph::new(
            trigger(),
            vec![Step::new(
                "router",
                StepKind::Router {
                    execution: RouterExecution::ExecuteFirstMatch,
                    branches: vec![fallback("x"), fallback("y")],
                },
            )],
        );
        assert_eq!(
            graph.validate(),
            Err(GraphError::MultipleFallbacks("router".to_string()))
        );
    }

    #[test]
    fn graph_deserializes_from_tagged_json() {
        let raw = json!({
            "flow_id": Uuid::nil(),
            "version_id": Uuid::nil(),
            "trigger": {"name": "trigger", "kind": {"type": "WEBHOOK"}},
            "steps": [{
                "name": "loop",
                "kind": {
                    "type": "LOOP",
                    "items": "{{trigger.items}}",
                    "body": [{
                        "name": "double",
                        "kind": {
                            "type": "ACTION",
                            "piece": {"name": "core", "version": "0.1.0"},
                            "action": "double",
                            "input": {"value": "{{loop.item}}"},
                            "error_handling": {"continue_on_failure": true}
                        }
                    }]
                }
            }]
        });
        let graph: FlowGraph = serde_json::from_value(raw).expect("graph parses");
        assert!(graph.validate().is_ok());
        let double = graph.find_step("double").expect("nested step");
        let StepKind::Action { error_handling, .. } = &double.kind else {
            panic!("expected action");
        };
        assert!(error_handling.continue_on_failure);
        assert!(!error_handling.retry_on_failure);
    }
}
