//! Per-operation retry budgets.
//!
//! Safety-critical operations (alert lifecycle, messaging, login, device
//! registration and the live subscriptions) retry without limit; everything
//! else gets a bounded budget.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::transport::TransportError;

pub const UNBOUNDED_OPERATIONS: &[&str] = &[
    "loginUserToken",
    "sendAlert",
    "acknowledgeAlert",
    "closeAlert",
    "insertMessage",
    "registerDeviceToken",
    "alertingSubscription",
    "messagesSubscription",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxAttempts {
    Bounded(u32),
    Unbounded,
}

impl MaxAttempts {
    /// Whether attempt number `attempt` (1-based) is within budget.
    #[must_use]
    pub fn allows(self, attempt: u32) -> bool {
        match self {
            Self::Bounded(limit) => attempt <= limit,
            Self::Unbounded => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationRetryPolicy {
    unbounded: HashSet<String>,
    config: RetryConfig,
}

impl Default for OperationRetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl OperationRetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            unbounded: UNBOUNDED_OPERATIONS
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
            config,
        }
    }

    /// Adds operation names that should never give up.
    #[must_use]
    pub fn with_unbounded<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unbounded.extend(names.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn max_attempts(&self, operation_name: &str) -> MaxAttempts {
        if self.unbounded.contains(operation_name) {
            MaxAttempts::Unbounded
        } else {
            MaxAttempts::Bounded(self.config.default_max_attempts)
        }
    }

    /// Decides whether a failed attempt `attempt` (1-based) gets another try.
    #[must_use]
    pub fn should_retry(&self, operation_name: &str, attempt: u32, error: &TransportError) -> bool {
        error.is_transient()
            && self
                .max_attempts(operation_name)
                .allows(attempt.saturating_add(1))
    }

    /// Backoff before retry number `attempt` (1-based): doubles from the initial
    /// delay up to the cap, then scaled by a random factor in `[0.5, 1.0]` when
    /// jitter is on.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base = self
            .config
            .initial_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.config.max_delay);
        if !self.config.jitter {
            return base;
        }
        let factor = rand::rng().random_range(0.5..=1.0);
        base.mul_f64(factor)
    }
}
