//! Flow definitions and run records shared by the worker and the engine process.

pub mod graph;
pub mod run;

pub use graph::{
    Condition, ConditionOperator, ErrorHandlingOptions, FlowGraph, GraphError, PieceRef,
    RouterBranch, RouterBranchKind, RouterExecution, Step, StepKind, StepType, TriggerKind,
    TriggerNode,
};
pub use run::{
    ExecutionType, FailedStep, FlowRun, FlowRunStatus, PauseMetadata, RunEnvironment,
    RunTransitionError,
};
