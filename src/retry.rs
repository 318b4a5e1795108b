//! Backoff curves and bounded retry decisions.
//!
//! Shared by the job dispatcher (requeue delays) and the engine (piece-level
//! `retry_on_failure`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default exponential multiplier when not specified
pub const DEFAULT_EXPONENTIAL_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// No delay between retries (immediate retry)
    #[default]
    None,
    /// Linear backoff: delay = base_delay_ms * attempt_number
    Linear { base_delay_ms: u64 },
    /// Exponential backoff: delay = base_delay_ms * multiplier^(attempt_number - 1)
    Exponential { base_delay_ms: u64, multiplier: f64 },
}

impl BackoffConfig {
    /// Builds a curve from its textual kind (`none`, `linear`, `exponential`).
    pub fn from_parts(kind: &str, base_delay_ms: u64, multiplier: Option<f64>) -> Option<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "linear" => Some(Self::Linear { base_delay_ms }),
            "exponential" => Some(Self::Exponential {
                base_delay_ms,
                multiplier: multiplier
                    .filter(|value| *value > 0.0)
                    .unwrap_or(DEFAULT_EXPONENTIAL_MULTIPLIER),
            }),
            _ => None,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            BackoffConfig::None => "none",
            BackoffConfig::Linear { .. } => "linear",
            BackoffConfig::Exponential { .. } => "exponential",
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        match self {
            BackoffConfig::None => 0,
            BackoffConfig::Linear { base_delay_ms } => *base_delay_ms,
            BackoffConfig::Exponential { base_delay_ms, .. } => *base_delay_ms,
        }
    }

    pub fn calculate_delay_ms(&self, attempt_number: u32) -> u64 {
        if attempt_number == 0 {
            return 0;
        }
        match self {
            BackoffConfig::None => 0,
            BackoffConfig::Linear { base_delay_ms } => {
                base_delay_ms.saturating_mul(attempt_number as u64)
            }
            BackoffConfig::Exponential {
                base_delay_ms,
                multiplier,
            } => {
                let factor = multiplier.powi(attempt_number as i32 - 1);
                let delay = (*base_delay_ms as f64) * factor;
                if delay.is_finite() && delay < u64::MAX as f64 {
                    delay as u64
                } else {
                    u64::MAX
                }
            }
        }
    }

    pub fn delay(&self, attempt_number: u32) -> Duration {
        Duration::from_millis(self.calculate_delay_ms(attempt_number))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
}

/// `max_attempts` counts every try, the first one included.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    /// Upper bound applied to every computed delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: BackoffConfig::Exponential {
                base_delay_ms: 1_000,
                multiplier: DEFAULT_EXPONENTIAL_MULTIPLIER,
            },
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffConfig) -> Self {
        Self {
            max_attempts,
            backoff,
            ..Self::default()
        }
    }

    /// Decision for the try numbered `next_attempt` (zero-based) after a failure.
    pub fn decide(&self, next_attempt: u32) -> RetryDecision {
        if next_attempt >= self.max_attempts {
            return RetryDecision {
                should_retry: false,
                delay: Duration::ZERO,
            };
        }
        RetryDecision {
            should_retry: true,
            delay: self.backoff.delay(next_attempt).min(self.max_delay),
        }
    }
}
