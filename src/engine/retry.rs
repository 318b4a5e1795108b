//! Piece-level retries for steps that opt into `retry_on_failure`.

use std::env;

use tracing::warn;

use crate::pieces::{Action, PieceContext, PieceError};
use crate::retry::{BackoffConfig, RetryPolicy};

pub const PIECE_RETRY_ATTEMPTS_ENV: &str = "FLOWRUNNER_PIECE_RETRY_ATTEMPTS";
pub const PIECE_RETRY_BASE_DELAY_ENV: &str = "FLOWRUNNER_PIECE_RETRY_BASE_DELAY_MS";

#[derive(Clone, Debug, PartialEq)]
pub struct PieceRetryPolicy {
    inner: RetryPolicy,
}

impl Default for PieceRetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            BackoffConfig::Exponential {
                base_delay_ms: 500,
                multiplier: 2.0,
            },
        )
    }
}

impl PieceRetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffConfig) -> Self {
        Self {
            inner: RetryPolicy::new(max_attempts.max(1), backoff),
        }
    }

    /// Reads overrides the worker passes into the engine process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let attempts = env::var(PIECE_RETRY_ATTEMPTS_ENV)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(defaults.inner.max_attempts);
        let base_delay_ms = env::var(PIECE_RETRY_BASE_DELAY_ENV)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(defaults.inner.backoff.base_delay_ms());
        Self::new(
            attempts,
            BackoffConfig::Exponential {
                base_delay_ms,
                multiplier: 2.0,
            },
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.inner.max_attempts
    }
}

/// Runs `action`, retrying failures up to the policy's attempt budget when
/// `enabled`. Control signals raised by a failed attempt are discarded.
pub async fn run_with_retries(
    action: &dyn Action,
    ctx: &PieceContext,
    policy: &PieceRetryPolicy,
    enabled: bool,
) -> Result<serde_json::Value, PieceError> {
    let mut attempt = 0u32;
    loop {
        match action.run(ctx.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                let decision = policy.inner.decide(attempt);
                if !enabled || !decision.should_retry {
                    return Err(err);
                }
                ctx.run.take_signal();
                warn!(
                    step = %ctx.step_name,
                    attempt,
                    delay_ms = decision.delay.as_millis() as u64,
                    error = %err,
                    "step failed, retrying"
                );
                tokio::time::sleep(decision.delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ExecutionType;
    use crate::pieces::{RunHooks, TagHooks, action_fn};
    use indexmap::IndexMap;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn ctx() -> PieceContext {
        PieceContext {
            run_id: Uuid::nil(),
            step_name: "flaky".to_string(),
            input: Value::Null,
            execution_type: ExecutionType::Begin,
            trigger_payload: Value::Null,
            resume_payload: None,
            steps: IndexMap::new(),
            run: RunHooks::default(),
            tags: TagHooks::default(),
        }
    }

    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> Arc<dyn Action> {
        action_fn(move |_ctx| {
            let calls = Arc::clone(&calls);
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if call < failures {
                    Err(PieceError::failed("boom"))
                } else {
                    Ok(json!("ok"))
                }
            }
        })
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let action = flaky(2, Arc::clone(&calls));
        let policy = PieceRetryPolicy::new(3, BackoffConfig::None);
        let result = run_with_retries(action.as_ref(), &ctx(), &policy, true).await;
        assert_eq!(result.unwrap(), json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let action = flaky(10, Arc::clone(&calls));
        let policy = PieceRetryPolicy::new(3, BackoffConfig::None);
        assert!(run_with_retries(action.as_ref(), &ctx(), &policy, true).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn disabled_retries_run_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let action = flaky(1, Arc::clone(&calls));
        let policy = PieceRetryPolicy::new(3, BackoffConfig::None);
        assert!(run_with_retries(action.as_ref(), &ctx(), &policy, false).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
