//! flowrunner - flow interpreter, sandboxed engine processes, and the job
//! dispatcher that runs multi-tenant automation flows.

pub mod backends;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod executors;
pub mod flow;
pub mod jobs;
pub mod messages;
pub mod network;
pub mod observability;
pub mod pieces;
pub mod queue;
pub mod retry;
pub mod runs;
pub mod sandbox;
pub mod status;
pub mod worker;

pub use backends::{CoreBackend, MemoryBackend, WorkerStatusBackend};
pub use config::WorkerConfig;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use engine::{FlowExecutionResult, FlowExecutor};
pub use flow::{FlowGraph, FlowRun, FlowRunStatus};
pub use jobs::{Job, JobId, JobPayload, JobType};
pub use messages::MessageError;
pub use queue::{JobQueue, MemoryJobQueue};
pub use runs::FlowRunService;
pub use sandbox::{SandboxConfig, SandboxHandle, SandboxLimits, SandboxPool};
pub use worker::Worker;
