//! Resource limits for engine processes.
//!
//! Memory is bounded by a cgroup v2 controller when the configured root is a
//! writable cgroup with the memory controller available; otherwise the engine
//! runs under `RLIMIT_AS`. CPU time is always bounded with `RLIMIT_CPU`, whose
//! soft limit delivers SIGXCPU.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::resource::{Resource, setrlimit};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MIB: u64 = 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Memory ceiling in MiB. `None` leaves memory unbounded.
    pub memory_limit_mb: Option<u64>,
    /// Total CPU time the engine process may consume.
    pub cpu_time_limit: Option<Duration>,
}

impl SandboxLimits {
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit_mb.map(|mb| mb.saturating_mul(MIB))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RlimitEntry {
    pub resource: Resource,
    pub soft: u64,
    pub hard: u64,
}

/// rlimits to install in the child before `exec`. The address-space limit is
/// only used when no cgroup enforces memory.
pub fn rlimit_plan(limits: &SandboxLimits, cgroup_enforces_memory: bool) -> Vec<RlimitEntry> {
    let mut plan = Vec::new();
    if !cgroup_enforces_memory && let Some(bytes) = limits.memory_limit_bytes() {
        plan.push(RlimitEntry {
            resource: Resource::RLIMIT_AS,
            soft: bytes,
            hard: bytes,
        });
    }
    if let Some(cpu) = limits.cpu_time_limit {
        let seconds = cpu.as_secs().max(1);
        plan.push(RlimitEntry {
            resource: Resource::RLIMIT_CPU,
            soft: seconds,
            hard: seconds + 1,
        });
    }
    plan
}

/// Runs between `fork` and `exec`; only calls `setrlimit`.
pub fn apply_rlimits(plan: &[RlimitEntry]) -> io::Result<()> {
    for entry in plan {
        setrlimit(entry.resource, entry.soft, entry.hard).map_err(io::Error::from)?;
    }
    Ok(())
}

/// A delegated cgroup v2 directory under which one child cgroup per sandbox is created.
#[derive(Clone, Debug)]
pub struct CgroupController {
    root: PathBuf,
}

impl CgroupController {
    /// Returns a controller when `root` is (or can be made) a cgroup v2
    /// directory whose children get the memory controller.
    pub fn detect(root: &Path) -> Option<Self> {
        if let Err(err) = fs::create_dir_all(root) {
            debug!(root = %root.display(), error = %err, "cgroup root unavailable");
            return None;
        }
        if !root.join("cgroup.procs").exists() {
            debug!(root = %root.display(), "not a cgroup v2 directory");
            return None;
        }
        let subtree = root.join("cgroup.subtree_control");
        let _ = fs::write(&subtree, "+memory");
        let enabled = fs::read_to_string(&subtree)
            .map(|controllers| controllers.split_whitespace().any(|c| c == "memory"))
            .unwrap_or(false);
        if !enabled {
            warn!(root = %root.display(), "memory controller not delegated, falling back to rlimits");
            return None;
        }
        info!(root = %root.display(), "using cgroup v2 memory limits");
        Some(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn create(&self, sandbox_id: Uuid, limits: &SandboxLimits) -> io::Result<Cgroup> {
        let path = self.root.join(format!("sandbox-{sandbox_id}"));
        fs::create_dir(&path)?;
        let cgroup = Cgroup { path };
        if let Some(bytes) = limits.memory_limit_bytes() {
            fs::write(cgroup.path.join("memory.max"), bytes.to_string())?;
            match fs::write(cgroup.path.join("memory.swap.max"), "0") {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
                _ => {}
            }
        }
        Ok(cgroup)
    }
}

/// One sandbox's cgroup. Removed by [`Cgroup::remove`] once its process is reaped.
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn attach(&self, pid: u32) -> io::Result<()> {
        fs::write(self.path.join("cgroup.procs"), pid.to_string())
    }

    /// Number of OOM kills recorded for this cgroup.
    pub fn oom_kills(&self) -> u64 {
        fs::read_to_string(self.path.join("memory.events"))
            .map(|events| parse_oom_kills(&events))
            .unwrap_or(0)
    }

    pub fn remove(&self) {
        if let Err(err) = fs::remove_dir(&self.path)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %err, "failed to remove sandbox cgroup");
        }
    }
}

fn parse_oom_kills(events: &str) -> u64 {
    events
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(key, _)| *key == "oom_kill")
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}
