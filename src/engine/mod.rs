//! The flow engine: interpreter, execution state, and the sandboxed process loop.

pub mod condition;
pub mod executor;
pub mod operation;
pub mod path;
pub mod process;
pub mod resolver;
pub mod retry;
pub mod state;

pub use executor::{EngineError, FlowExecutionResult, FlowExecutor};
pub use operation::{OperationHandler, decode_response};
pub use path::{LoopFrame, StepExecutionPath};
pub use retry::PieceRetryPolicy;
pub use state::{ExecutionState, PauseRecord, StateError, StepOutput, StepOutputStatus};
