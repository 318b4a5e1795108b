//! Sandbox provisioning for the dispatcher.
//!
//! By default every execution gets a fresh engine. With `max_executions > 1`
//! a handle that finished cleanly goes back to the idle list until it has
//! served that many operations; a KILLED handle is never reused.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use super::handle::{SandboxHandle, SandboxState};
use super::limits::SandboxLimits;
use super::{SandboxConfig, SandboxError};
use crate::messages::{EngineOperation, EngineResponse};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SandboxPoolStats {
    pub active: usize,
    pub peak_active: usize,
    pub idle: usize,
    pub spawned: u64,
}

pub struct SandboxPool {
    config: SandboxConfig,
    limits: SandboxLimits,
    max_executions: u32,
    idle: StdMutex<Vec<SandboxHandle>>,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    spawned: AtomicU64,
}

impl SandboxPool {
    pub fn new(config: SandboxConfig, limits: SandboxLimits, max_executions: u32) -> Self {
        Self {
            config,
            limits,
            max_executions: max_executions.max(1),
            idle: StdMutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            spawned: AtomicU64::new(0),
        }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Hands out a READY sandbox, reusing an idle one when allowed.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledSandbox, SandboxError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);

        let reused = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let handle = match reused {
            Some(handle) => {
                debug!(sandbox_id = %handle.id(), executions = handle.executions(), "reusing sandbox");
                handle
            }
            None => match SandboxHandle::spawn(&self.config, self.limits).await {
                Ok(handle) => {
                    self.spawned.fetch_add(1, Ordering::SeqCst);
                    handle
                }
                Err(err) => {
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    return Err(err);
                }
            },
        };
        Ok(PooledSandbox {
            pool: Arc::clone(self),
            handle: Some(handle),
        })
    }

    async fn recycle(&self, handle: SandboxHandle) {
        if handle.state() == SandboxState::Ready && handle.executions() < self.max_executions {
            self.idle.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
        } else {
            handle.destroy().await;
        }
    }

    pub fn stats(&self) -> SandboxPoolStats {
        SandboxPoolStats {
            active: self.active.load(Ordering::SeqCst),
            peak_active: self.peak_active.load(Ordering::SeqCst),
            idle: self.idle.lock().unwrap_or_else(PoisonError::into_inner).len(),
            spawned: self.spawned.load(Ordering::SeqCst),
        }
    }

    /// Destroys every idle sandbox.
    pub async fn shutdown(&self) {
        let idle: Vec<SandboxHandle> =
            std::mem::take(&mut *self.idle.lock().unwrap_or_else(PoisonError::into_inner));
        let count = idle.len();
        for handle in idle {
            handle.destroy().await;
        }
        info!(destroyed = count, "sandbox pool shut down");
    }
}

/// A sandbox checked out of the pool. Dropping it without [`release`](Self::release)
/// kills the engine.
pub struct PooledSandbox {
    pool: Arc<SandboxPool>,
    handle: Option<SandboxHandle>,
}

impl PooledSandbox {
    pub async fn submit(
        &mut self,
        operation: EngineOperation,
        deadline: Duration,
    ) -> Result<EngineResponse, SandboxError> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(SandboxError::Killed);
        };
        handle.submit(operation, deadline).await
    }

    pub fn handle(&self) -> Option<&SandboxHandle> {
        self.handle.as_ref()
    }

    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.recycle(handle).await;
        }
    }
}

impl Drop for PooledSandbox {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::SeqCst);
    }
}
