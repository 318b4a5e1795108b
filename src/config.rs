//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `FLOWRUNNER_CONCURRENCY`: Max jobs executing at once (default: num_cpus)
//! - `FLOWRUNNER_POLL_INTERVAL_MS`: Dispatcher idle poll interval (default: 100)
//! - `FLOWRUNNER_ENGINE_PATH`: Path to the `flowrunner-engine` binary (default: next to the current executable)
//! - `FLOWRUNNER_CGROUP_ROOT`: Delegated cgroup v2 directory, empty to force rlimits (default: /sys/fs/cgroup/flowrunner)
//! - `FLOWRUNNER_SANDBOX_MEMORY_MB`: Engine memory ceiling, 0 disables (default: 1024)
//! - `FLOWRUNNER_SANDBOX_CPU_SECONDS`: Engine CPU time ceiling (default: unlimited)
//! - `FLOWRUNNER_SANDBOX_STARTUP_TIMEOUT_MS`: Engine startup deadline (default: 15000)
//! - `FLOWRUNNER_SANDBOX_MAX_EXECUTIONS`: Executions per engine before it is replaced (default: 1)
//! - `FLOWRUNNER_FLOW_TIMEOUT_SECONDS`: Flow run job deadline (default: 600)
//! - `FLOWRUNNER_POLL_TIMEOUT_SECONDS`: Trigger poll job deadline (default: 60)
//! - `FLOWRUNNER_WEBHOOK_TIMEOUT_SECONDS`: Outgoing webhook deadline (default: 30)
//! - `FLOWRUNNER_MAX_ATTEMPTS`: Tries per job, the first included (default: 4)
//! - `FLOWRUNNER_BACKOFF_KIND`: `none`, `linear` or `exponential` (default: exponential)
//! - `FLOWRUNNER_BACKOFF_BASE_MS`: Base requeue delay (default: 1000)
//! - `FLOWRUNNER_BACKOFF_MULTIPLIER`: Exponential multiplier (default: 2)
//! - `FLOWRUNNER_PIECE_RETRY_ATTEMPTS`: Tries for steps with retry on failure (default: 3)
//! - `FLOWRUNNER_STATUS_INTERVAL_MS`: Worker status report interval (default: 10000)
//! - `FLOWRUNNER_REPORT_ATTEMPTS`: Outcome report tries before dead-lettering (default: 3)
//! - `FLOWRUNNER_LEASE_TTL_SECONDS`: Reclaim leases older than this (default: disabled)
//! - `FLOWRUNNER_PUBLIC_IP_URL`: Endpoint returning this host's public IP (optional)

use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};

use crate::dispatcher::DispatcherConfig;
use crate::engine::retry::PIECE_RETRY_ATTEMPTS_ENV;
use crate::retry::{BackoffConfig, RetryPolicy};
use crate::runs::JobTimeouts;
use crate::sandbox::{SandboxConfig, SandboxLimits};

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/flowrunner";

pub const ENGINE_BINARY: &str = "flowrunner-engine";

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum number of jobs executing at once
    pub concurrency: usize,

    /// Dispatcher poll interval when the queue is idle
    pub poll_interval: Duration,

    /// Engine binary spawned for every sandbox
    pub engine_path: PathBuf,

    /// Delegated cgroup v2 root. None always limits memory with rlimits.
    pub cgroup_root: Option<PathBuf>,

    /// Memory ceiling per engine process, in MiB
    pub memory_limit_mb: Option<u64>,

    /// CPU time ceiling per engine process
    pub cpu_time_limit: Option<Duration>,

    pub startup_timeout: Duration,

    /// Executions an engine may serve before it is destroyed.
    /// 1 gives every execution a fresh process.
    pub max_executions: u32,

    pub flow_timeout_seconds: u64,
    pub poll_timeout_seconds: u64,
    pub webhook_timeout_seconds: u64,

    /// Tries per job, the first one included
    pub max_attempts: u32,

    pub backoff: BackoffConfig,

    /// Tries for steps that opt into retry on failure
    pub piece_retry_attempts: u32,

    /// Worker status report interval
    pub status_interval: Duration,

    /// Outcome report tries before the job is dead-lettered
    pub report_attempts: u32,

    /// Leases older than this go back to the queue
    pub lease_ttl: Option<Duration>,

    /// Endpoint queried once for this host's public IP
    pub public_ip_url: Option<String>,
}

impl WorkerConfig {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_source(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        let engine_path = match lookup("FLOWRUNNER_ENGINE_PATH") {
            Some(path) => PathBuf::from(path),
            None => find_engine_binary()?,
        };

        let cgroup_root = match lookup("FLOWRUNNER_CGROUP_ROOT") {
            Some(root) if root.trim().is_empty() => None,
            Some(root) => Some(PathBuf::from(root)),
            None => Some(PathBuf::from(DEFAULT_CGROUP_ROOT)),
        };

        let memory_limit_mb = match parsed("FLOWRUNNER_SANDBOX_MEMORY_MB").unwrap_or(1024) {
            0 => None,
            mb => Some(mb),
        };

        let backoff_kind =
            lookup("FLOWRUNNER_BACKOFF_KIND").unwrap_or_else(|| "exponential".to_string());
        let backoff_base_ms = parsed("FLOWRUNNER_BACKOFF_BASE_MS").unwrap_or(1000);
        let multiplier = lookup("FLOWRUNNER_BACKOFF_MULTIPLIER").and_then(|s| s.trim().parse().ok());
        let backoff = BackoffConfig::from_parts(&backoff_kind, backoff_base_ms, multiplier)
            .with_context(|| format!("invalid FLOWRUNNER_BACKOFF_KIND: {backoff_kind}"))?;

        let concurrency = lookup("FLOWRUNNER_CONCURRENCY")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or_else(num_cpus::get);
        if concurrency == 0 {
            bail!("FLOWRUNNER_CONCURRENCY must be at least 1");
        }

        Ok(Self {
            concurrency,
            poll_interval: Duration::from_millis(parsed("FLOWRUNNER_POLL_INTERVAL_MS").unwrap_or(100)),
            engine_path,
            cgroup_root,
            memory_limit_mb,
            cpu_time_limit: parsed("FLOWRUNNER_SANDBOX_CPU_SECONDS").map(Duration::from_secs),
            startup_timeout: Duration::from_millis(
                parsed("FLOWRUNNER_SANDBOX_STARTUP_TIMEOUT_MS").unwrap_or(15_000),
            ),
            max_executions: parsed("FLOWRUNNER_SANDBOX_MAX_EXECUTIONS")
                .map(|n| n.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(1),
            flow_timeout_seconds: parsed("FLOWRUNNER_FLOW_TIMEOUT_SECONDS").unwrap_or(600),
            poll_timeout_seconds: parsed("FLOWRUNNER_POLL_TIMEOUT_SECONDS").unwrap_or(60),
            webhook_timeout_seconds: parsed("FLOWRUNNER_WEBHOOK_TIMEOUT_SECONDS").unwrap_or(30),
            max_attempts: parsed("FLOWRUNNER_MAX_ATTEMPTS")
                .map(|n| n.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(4),
            backoff,
            piece_retry_attempts: parsed(PIECE_RETRY_ATTEMPTS_ENV)
                .map(|n| n.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(3),
            status_interval: Duration::from_millis(
                parsed("FLOWRUNNER_STATUS_INTERVAL_MS").unwrap_or(10_000),
            ),
            report_attempts: parsed("FLOWRUNNER_REPORT_ATTEMPTS")
                .map(|n| n.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(3),
            lease_ttl: parsed("FLOWRUNNER_LEASE_TTL_SECONDS").map(Duration::from_secs),
            public_ip_url: lookup("FLOWRUNNER_PUBLIC_IP_URL").filter(|url| !url.trim().is_empty()),
        })
    }

    /// Defaults for running in-process against a known engine binary,
    /// without cgroups and with a small memory ceiling.
    pub fn local(engine_path: impl Into<PathBuf>) -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            poll_interval: Duration::from_millis(50),
            engine_path: engine_path.into(),
            cgroup_root: None,
            memory_limit_mb: Some(512),
            cpu_time_limit: None,
            startup_timeout: Duration::from_secs(15),
            max_executions: 1,
            flow_timeout_seconds: 600,
            poll_timeout_seconds: 60,
            webhook_timeout_seconds: 30,
            max_attempts: 4,
            backoff: BackoffConfig::Exponential {
                base_delay_ms: 1000,
                multiplier: 2.0,
            },
            piece_retry_attempts: 3,
            status_interval: Duration::from_secs(10),
            report_attempts: 3,
            lease_ttl: None,
            public_ip_url: None,
        }
    }

    pub fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits {
            memory_limit_mb: self.memory_limit_mb,
            cpu_time_limit: self.cpu_time_limit,
        }
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        let mut config = SandboxConfig::new(&self.engine_path);
        config.startup_timeout = self.startup_timeout;
        config.cgroup_root = self.cgroup_root.clone();
        config.env.push((
            PIECE_RETRY_ATTEMPTS_ENV.to_string(),
            self.piece_retry_attempts.to_string(),
        ));
        config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: self.poll_interval,
            concurrency: self.concurrency,
            retry_policy: self.retry_policy(),
            report_attempts: self.report_attempts,
            lease_ttl: self.lease_ttl,
            ..DispatcherConfig::default()
        }
    }

    pub fn job_timeouts(&self) -> JobTimeouts {
        JobTimeouts {
            flow_run_seconds: self.flow_timeout_seconds,
            trigger_poll_seconds: self.poll_timeout_seconds,
            webhook_seconds: self.webhook_timeout_seconds,
        }
    }
}

/// Looks for the engine binary next to the current executable, then in the
/// cargo target directories.
pub fn find_engine_binary() -> Result<PathBuf> {
    let current_exe = env::current_exe().context("failed to get current executable path")?;
    let parent = current_exe
        .parent()
        .context("failed to get parent directory")?;

    let candidate = parent.join(ENGINE_BINARY);
    if candidate.exists() {
        return Ok(candidate);
    }

    // Test binaries live one level down, in target/<profile>/deps
    if let Some(profile_dir) = parent.parent() {
        let candidate = profile_dir.join(ENGINE_BINARY);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    for dir in ["debug", "release"] {
        let candidate = PathBuf::from(format!("target/{dir}/{ENGINE_BINARY}"));
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!("could not find {ENGINE_BINARY} binary; set FLOWRUNNER_ENGINE_PATH")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> Result<WorkerConfig> {
        let mut map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.entry("FLOWRUNNER_ENGINE_PATH".to_string())
            .or_insert_with(|| "/opt/flowrunner/flowrunner-engine".to_string());
        WorkerConfig::from_source(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = from_map(&[]).unwrap();
        assert!(config.concurrency >= 1);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.cgroup_root, Some(PathBuf::from(DEFAULT_CGROUP_ROOT)));
        assert_eq!(config.memory_limit_mb, Some(1024));
        assert_eq!(config.cpu_time_limit, None);
        assert_eq!(config.max_executions, 1);
        assert_eq!(config.max_attempts, 4);
        assert_eq!(
            config.backoff,
            BackoffConfig::Exponential {
                base_delay_ms: 1000,
                multiplier: 2.0
            }
        );
        assert_eq!(config.job_timeouts().flow_run_seconds, 600);
        assert_eq!(config.job_timeouts().webhook_seconds, 30);
        assert_eq!(config.lease_ttl, None);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = from_map(&[
            ("FLOWRUNNER_CONCURRENCY", "3"),
            ("FLOWRUNNER_CGROUP_ROOT", ""),
            ("FLOWRUNNER_SANDBOX_MEMORY_MB", "0"),
            ("FLOWRUNNER_SANDBOX_CPU_SECONDS", "30"),
            ("FLOWRUNNER_BACKOFF_KIND", "linear"),
            ("FLOWRUNNER_BACKOFF_BASE_MS", "250"),
            ("FLOWRUNNER_MAX_ATTEMPTS", "2"),
            ("FLOWRUNNER_LEASE_TTL_SECONDS", "90"),
            ("FLOWRUNNER_PIECE_RETRY_ATTEMPTS", "5"),
        ])
        .unwrap();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.cgroup_root, None);
        assert_eq!(config.memory_limit_mb, None);
        assert_eq!(config.cpu_time_limit, Some(Duration::from_secs(30)));
        assert_eq!(config.backoff, BackoffConfig::Linear { base_delay_ms: 250 });
        assert_eq!(config.retry_policy().max_attempts, 2);
        assert_eq!(config.dispatcher_config().lease_ttl, Some(Duration::from_secs(90)));
        assert!(
            config
                .sandbox_config()
                .env
                .contains(&(PIECE_RETRY_ATTEMPTS_ENV.to_string(), "5".to_string()))
        );
    }

    #[test]
    fn unknown_backoff_kind_is_an_error() {
        assert!(from_map(&[("FLOWRUNNER_BACKOFF_KIND", "fibonacci")]).is_err());
        assert!(from_map(&[("FLOWRUNNER_CONCURRENCY", "0")]).is_err());
    }

    #[test]
    fn local_config_skips_cgroups() {
        let config = WorkerConfig::local("/tmp/flowrunner-engine");
        assert_eq!(config.cgroup_root, None);
        assert_eq!(config.sandbox_limits().memory_limit_mb, Some(512));
        assert_eq!(config.sandbox_config().engine_path, PathBuf::from("/tmp/flowrunner-engine"));
    }
}
