//! Isolated, resource-bounded engine processes.
//!
//! Every flow execution and trigger poll runs inside a `flowrunner-engine`
//! child process owned by a [`SandboxHandle`]. The [`SandboxPool`] provisions
//! handles for the dispatcher and tracks how many are active.

pub mod handle;
pub mod limits;
pub mod pool;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

pub use handle::{SandboxHandle, SandboxState, classify_termination};
pub use limits::{CgroupController, SandboxLimits};
pub use pool::{PooledSandbox, SandboxPool, SandboxPoolStats};

use crate::jobs::FailureReason;

#[derive(Clone, Debug)]
pub struct SandboxConfig {
    /// Path to the `flowrunner-engine` binary.
    pub engine_path: PathBuf,
    /// How long a new engine may take to announce `engine-ready`.
    pub startup_timeout: Duration,
    /// Delegated cgroup v2 directory; `None` always uses rlimits.
    pub cgroup_root: Option<PathBuf>,
    /// Environment passed to the engine. The worker's own environment is not inherited.
    pub env: Vec<(String, String)>,
}

impl SandboxConfig {
    pub fn new(engine_path: impl Into<PathBuf>) -> Self {
        Self {
            engine_path: engine_path.into(),
            startup_timeout: Duration::from_secs(15),
            cgroup_root: None,
            env: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to spawn engine process: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to apply resource limits: {0}")]
    Limits(String),
    #[error("engine did not become ready within {0:?}")]
    StartupTimeout(Duration),
    #[error("engine failed during startup: {0}")]
    StartupFailed(String),
    #[error("operation exceeded its {0:?} deadline")]
    TimedOut(Duration),
    #[error("engine ran out of memory")]
    OutOfMemory,
    #[error("engine exceeded its CPU time limit")]
    CpuLimitExceeded,
    #[error("engine crashed (exit code {code:?}, signal {signal:?})")]
    Crashed {
        code: Option<i32>,
        signal: Option<i32>,
    },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("sandbox was killed and cannot accept operations")]
    Killed,
    #[error("sandbox is {0:?} and cannot accept an operation")]
    NotReady(SandboxState),
}

impl SandboxError {
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            SandboxError::OutOfMemory => FailureReason::Oom,
            SandboxError::TimedOut(_) | SandboxError::CpuLimitExceeded => FailureReason::TimedOut,
            SandboxError::Protocol(_) => FailureReason::ProtocolError,
            SandboxError::Crashed { .. }
            | SandboxError::StartupFailed(_)
            | SandboxError::StartupTimeout(_) => FailureReason::Crashed,
            SandboxError::Spawn(_)
            | SandboxError::Limits(_)
            | SandboxError::Killed
            | SandboxError::NotReady(_) => FailureReason::Internal,
        }
    }
}
