//! Backend implementations for run persistence.

mod base;
mod memory;

pub use base::{
    BackendError, BackendResult, CoreBackend, FlowRunRecord, JobReport, JobStatus, PausedRun,
    RunReport, WorkerStatusBackend, WorkerStatusUpdate,
};
pub use memory::MemoryBackend;
