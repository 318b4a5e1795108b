//! One sandboxed engine process and its line channel.
//!
//! ## Lifecycle
//!
//! ```text
//! spawn ──► STARTING ──engine-ready──► READY ◄──response── BUSY
//!               │                        │ submit ──────────►│
//!               └──── failure ───► KILLED ◄── timeout / exit / bad frame
//! ```
//!
//! A handle carries one operation at a time. Any abnormal outcome kills the
//! whole process group and leaves the handle KILLED for good.

use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::limits::{Cgroup, CgroupController, SandboxLimits, apply_rlimits, rlimit_plan};
use super::{SandboxConfig, SandboxError};
use crate::messages::{
    EngineMessage, EngineOperation, EngineResponse, MAX_FRAME_BYTES, decode_message,
    encode_message,
};

const STDERR_TAIL_LINES: usize = 32;
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxState {
    Starting,
    Ready,
    Busy,
    Killed,
}

type StderrTail = Arc<StdMutex<VecDeque<String>>>;

pub struct SandboxHandle {
    id: Uuid,
    pid: u32,
    limits: SandboxLimits,
    state: SandboxState,
    executions: u32,
    child: Child,
    sink: FramedWrite<ChildStdin, LinesCodec>,
    lines: FramedRead<ChildStdout, LinesCodec>,
    stderr_tail: StderrTail,
    stderr_task: Option<JoinHandle<()>>,
    cgroup: Option<Cgroup>,
}

impl SandboxHandle {
    /// Starts an engine process and waits for its `engine-ready` frame.
    pub async fn spawn(config: &SandboxConfig, limits: SandboxLimits) -> Result<Self, SandboxError> {
        let id = Uuid::new_v4();
        let cgroup = match (&config.cgroup_root, limits.memory_limit_mb) {
            (Some(root), Some(_)) => CgroupController::detect(root).and_then(|controller| {
                controller
                    .create(id, &limits)
                    .inspect_err(|err| warn!(sandbox_id = %id, error = %err, "cgroup setup failed, using rlimits"))
                    .ok()
            }),
            _ => None,
        };
        let plan = rlimit_plan(&limits, cgroup.is_some());

        let mut command = Command::new(&config.engine_path);
        command
            .env_clear()
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Ok(filter) = std::env::var("RUST_LOG") {
            command.env("RUST_LOG", filter);
        }
        // SAFETY: the hook only calls setrlimit, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || apply_rlimits(&plan));
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                if let Some(cgroup) = &cgroup {
                    cgroup.remove();
                }
                return Err(SandboxError::Spawn(err));
            }
        };
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::StartupFailed("engine exited before it was tracked".into()))?;

        if let Some(cgroup) = &cgroup
            && let Err(err) = cgroup.attach(pid)
        {
            kill_group(pid);
            let _ = child.wait().await;
            cgroup.remove();
            return Err(SandboxError::Limits(format!("failed to attach cgroup: {err}")));
        }

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                kill_group(pid);
                let _ = child.wait().await;
                return Err(SandboxError::StartupFailed("engine stdio was not captured".into()));
            }
        };

        let stderr_tail: StderrTail = Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = tokio::spawn(collect_stderr(id, stderr, Arc::clone(&stderr_tail)));

        let mut handle = Self {
            id,
            pid,
            limits,
            state: SandboxState::Starting,
            executions: 0,
            child,
            sink: FramedWrite::new(stdin, LinesCodec::new_with_max_length(MAX_FRAME_BYTES)),
            lines: FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_FRAME_BYTES)),
            stderr_tail,
            stderr_task: Some(stderr_task),
            cgroup,
        };

        match timeout(config.startup_timeout, handle.lines.next()).await {
            Ok(Some(Ok(line))) => match decode_message::<EngineMessage>(&line) {
                Ok(EngineMessage::EngineReady { pid: engine_pid }) => {
                    handle.state = SandboxState::Ready;
                    info!(sandbox_id = %id, pid, engine_pid, cgroup = handle.cgroup.is_some(), "sandbox ready");
                    Ok(handle)
                }
                Ok(other) => {
                    handle.kill().await;
                    Err(SandboxError::Protocol(format!("expected engine-ready, got {other:?}")))
                }
                Err(err) => {
                    handle.kill().await;
                    Err(SandboxError::Protocol(err.to_string()))
                }
            },
            Ok(Some(Err(err))) => {
                handle.kill().await;
                Err(SandboxError::Protocol(err.to_string()))
            }
            Ok(None) => {
                let cause = handle.reap_and_classify().await;
                Err(SandboxError::StartupFailed(cause.to_string()))
            }
            Err(_) => {
                handle.kill().await;
                Err(SandboxError::StartupTimeout(config.startup_timeout))
            }
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn executions(&self) -> u32 {
        self.executions
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Sends one operation and waits for its response until `deadline` elapses.
    pub async fn submit(
        &mut self,
        operation: EngineOperation,
        deadline: Duration,
    ) -> Result<EngineResponse, SandboxError> {
        match self.state {
            SandboxState::Ready => {}
            SandboxState::Killed => return Err(SandboxError::Killed),
            state => return Err(SandboxError::NotReady(state)),
        }
        let line = operation
            .into_message()
            .and_then(|message| encode_message(&message))
            .map_err(|err| SandboxError::Protocol(err.to_string()))?;

        self.state = SandboxState::Busy;
        self.executions += 1;
        debug!(sandbox_id = %self.id, executions = self.executions, "submitting operation");

        let exchanged = timeout(deadline, exchange(&mut self.sink, &mut self.lines, line)).await;
        match exchanged {
            Err(_) => {
                warn!(sandbox_id = %self.id, pid = self.pid, deadline_ms = deadline.as_millis() as u64, "operation exceeded deadline, killing sandbox");
                self.kill().await;
                Err(SandboxError::TimedOut(deadline))
            }
            Ok(Ok(Some(reply))) => match decode_message::<EngineMessage>(&reply) {
                Ok(EngineMessage::EngineResponse { status, response }) => {
                    self.state = SandboxState::Ready;
                    Ok(EngineResponse { status, response })
                }
                Ok(other) => {
                    self.kill().await;
                    Err(SandboxError::Protocol(format!("expected engine-response, got {other:?}")))
                }
                Err(err) => {
                    self.kill().await;
                    Err(SandboxError::Protocol(err.to_string()))
                }
            },
            Ok(Ok(None)) => Err(self.reap_and_classify().await),
            Ok(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                self.kill().await;
                Err(SandboxError::Protocol("response frame exceeds maximum length".into()))
            }
            // A broken pipe means the engine is gone; classify how it ended.
            Ok(Err(LinesCodecError::Io(err))) => {
                debug!(sandbox_id = %self.id, error = %err, "engine channel failed");
                Err(self.reap_and_classify().await)
            }
        }
    }

    /// Kills the process group, reaps the engine, and removes its cgroup.
    pub async fn destroy(mut self) {
        self.kill().await;
        if let Some(cgroup) = self.cgroup.take() {
            cgroup.remove();
        }
    }

    async fn kill(&mut self) {
        kill_group(self.pid);
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        self.state = SandboxState::Killed;
    }

    /// Waits for the engine to exit after its channel closed and turns the
    /// exit into an error. The handle is KILLED afterwards.
    async fn reap_and_classify(&mut self) -> SandboxError {
        let status = match timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => None,
        };
        kill_group(self.pid);
        self.state = SandboxState::Killed;
        let Some(status) = status else {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
            return SandboxError::Protocol("engine closed its channel but kept running".into());
        };

        if let Some(task) = self.stderr_task.take() {
            let _ = timeout(Duration::from_secs(1), task).await;
        }
        let tail: Vec<String> = self
            .stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        let oom_kills = self.cgroup.as_ref().map(Cgroup::oom_kills).unwrap_or(0);
        let error = classify_termination(status, oom_kills, &tail, self.limits.memory_limit_mb.is_some());
        warn!(sandbox_id = %self.id, pid = self.pid, %status, error = %error, "sandbox terminated");
        error
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if self.state != SandboxState::Killed {
            kill_group(self.pid);
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        if let Some(cgroup) = self.cgroup.take() {
            cgroup.remove();
        }
    }
}

async fn exchange(
    sink: &mut FramedWrite<ChildStdin, LinesCodec>,
    lines: &mut FramedRead<ChildStdout, LinesCodec>,
    line: String,
) -> Result<Option<String>, LinesCodecError> {
    sink.send(line).await?;
    lines.next().await.transpose()
}

async fn collect_stderr(sandbox_id: Uuid, stderr: ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(%sandbox_id, engine = %line, "engine stderr");
        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

fn kill_group(pid: u32) {
    if let Ok(raw) = i32::try_from(pid) {
        let _ = killpg(Pid::from_raw(raw), Signal::SIGKILL);
    }
}

/// Maps how an engine process ended to the sandbox error reported for it.
pub fn classify_termination(
    status: ExitStatus,
    oom_kills: u64,
    stderr_tail: &[String],
    memory_limited: bool,
) -> SandboxError {
    if oom_kills > 0 {
        return SandboxError::OutOfMemory;
    }
    let allocation_failed = stderr_tail
        .iter()
        .any(|line| line.contains("memory allocation of") && line.contains("failed"));
    if memory_limited && allocation_failed {
        return SandboxError::OutOfMemory;
    }
    if status.signal() == Some(Signal::SIGXCPU as i32) {
        return SandboxError::CpuLimitExceeded;
    }
    SandboxError::Crashed {
        code: status.code(),
        signal: status.signal(),
    }
}
