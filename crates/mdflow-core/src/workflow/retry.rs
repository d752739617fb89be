//! Retry policy for failed step attempts.
//!
//! A policy is built per step from its `errorHandling` block with engine
//! defaults filling the gaps. It is stateless: callers track how many
//! retries they have made and ask whether another one is allowed and how
//! long to wait first.

use std::time::Duration;

use mdflow_types::config::EngineConfig;
use mdflow_types::workflow::{BackoffStrategy, ErrorAction, ErrorHandling};

/// Retries used by `action: retry` when neither the step nor the engine
/// configures a count.
pub const DEFAULT_RETRY_ACTION_RETRIES: u32 = 3;

/// Cap on the exponential shift so delays cannot overflow.
const MAX_BACKOFF_SHIFT: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed beyond the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff: BackoffStrategy::Fixed,
        }
    }

    /// Build the policy for one step.
    pub fn for_step(handling: Option<&ErrorHandling>, config: &EngineConfig) -> Self {
        let max_retries = match handling {
            Some(eh) => match (eh.max_retries, eh.action) {
                (Some(n), _) => n,
                (None, ErrorAction::Retry) if config.max_retries == 0 => DEFAULT_RETRY_ACTION_RETRIES,
                (None, _) => config.max_retries,
            },
            None => config.max_retries,
        };

        let base_delay = handling
            .and_then(|eh| eh.retry_delay_seconds)
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or_else(|| Duration::from_millis(config.retry_base_delay_ms));

        let backoff = handling
            .and_then(|eh| eh.backoff)
            .unwrap_or(config.default_backoff);

        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_millis(config.retry_max_delay_ms).max(base_delay),
            backoff,
        }
    }

    /// Whether another attempt is allowed after `retries_made` retries.
    pub fn should_retry(&self, retries_made: u32) -> bool {
        retries_made < self.max_retries
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let delay = match self.backoff {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry),
            BackoffStrategy::Exponential => {
                let shift = (retry - 1).min(MAX_BACKOFF_SHIFT);
                self.base_delay.saturating_mul(1u32 << shift)
            }
        };
        delay.min(self.max_delay)
    }
}
