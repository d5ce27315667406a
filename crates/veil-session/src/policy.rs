//! Reconnect scheduling policy.
//!
//! Pure arithmetic, no timers and no I/O: the session worker asks the policy
//! what to do and owns the actual timer. Delay doubles per attempt from
//! `base_delay` up to `max_delay`; after `max_attempts` consecutive failures
//! the policy gives up and the worker parks the session in the error state
//! until the user acts.

use std::time::Duration;

/// Tuning knobs for reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any retry delay.
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up.
    pub max_attempts: u32,
    /// Whether giving up also drops the stay-connected intent. When false
    /// the intent survives exhaustion but the spent attempt budget keeps
    /// further scheduling inert until a fresh connect.
    pub clear_intent_on_give_up: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            clear_intent_on_give_up: false,
        }
    }
}

/// Counter for the current reconnection burst. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryState {
    attempts: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts consumed in this burst.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Back to a fresh budget. Called on every successful connect and on
    /// every fresh user-initiated connect.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// What the worker should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Try again after waiting.
    Retry { after: Duration },
    /// Budget exhausted; stop until the user intervenes.
    GiveUp,
}

/// Exponential backoff with a cap and a bounded attempt budget.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Consume one attempt from `retry` and return the wait, or give up if
    /// the budget is spent. The delay is computed from the attempts used
    /// before this call, so the first retry waits exactly `base_delay`.
    pub fn schedule_next(&self, retry: &mut RetryState) -> Decision {
        if retry.attempts >= self.config.max_attempts {
            return Decision::GiveUp;
        }
        // shift saturates well before Duration arithmetic could overflow
        let factor = 1u32 << retry.attempts.min(30);
        let delay = self
            .config
            .base_delay
            .saturating_mul(factor)
            .min(self.config.max_delay);
        retry.attempts += 1;
        Decision::Retry { after: delay }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}
