//! Retrieval retry policy and wall-clock budget

use std::time::Duration;

use callrelay_core::RetrievalConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

/// Why a retrieval budget ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BudgetExceeded {
    /// Every allowed attempt has been made
    #[error("attempt ceiling reached ({attempts} of {limit})")]
    Attempts { attempts: u32, limit: u32 },

    /// The wall-clock budget is spent
    #[error("wall-clock ceiling reached (ran for {elapsed:?}, limit {limit:?})")]
    WallClock { elapsed: Duration, limit: Duration },
}

/// Retry configuration for artifact retrieval
///
/// Fixed interval between attempts, capped both by an attempt count and by a
/// wall-clock budget measured from when the event completed.
///
/// # Example
///
/// ```
/// use callrelay_worker::reliability::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::fixed(Duration::from_secs(30), 20)
///     .with_max_wait(Duration::from_secs(600));
///
/// assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Delay between attempts
    #[serde(with = "callrelay_core::config::duration_millis")]
    pub interval: Duration,

    /// Wall-clock budget across all attempts
    #[serde(with = "callrelay_core::config::duration_millis")]
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default())
    }
}

impl RetryPolicy {
    /// Create a policy with fixed intervals and no wall-clock cap
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
            max_wait: Duration::MAX,
        }
    }

    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self::fixed(config.retry_delay, config.max_checks).with_max_wait(config.max_wait)
    }

    /// Set the wall-clock budget
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Delay to wait before `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            self.interval
        }
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }

    /// Start the clock, crediting time already spent since completion
    pub fn start(&self, already_elapsed: Duration) -> RetryBudget {
        RetryBudget {
            policy: self.clone(),
            started: Instant::now()
                .checked_sub(already_elapsed)
                .unwrap_or_else(Instant::now),
            attempts: 0,
        }
    }
}

/// A running retry budget for one event
#[derive(Debug, Clone)]
pub struct RetryBudget {
    policy: RetryPolicy,
    started: Instant,
    attempts: u32,
}

impl RetryBudget {
    /// Count an attempt, failing when none are left
    pub fn begin_attempt(&mut self) -> Result<u32, BudgetExceeded> {
        if self.attempts >= self.policy.max_attempts {
            return Err(BudgetExceeded::Attempts {
                attempts: self.attempts,
                limit: self.policy.max_attempts,
            });
        }
        self.check_wall_clock()?;
        self.attempts += 1;
        Ok(self.attempts)
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the wall-clock ceiling
    pub fn remaining(&self) -> Duration {
        self.policy.max_wait.saturating_sub(self.elapsed())
    }

    pub fn check_wall_clock(&self) -> Result<(), BudgetExceeded> {
        let elapsed = self.elapsed();
        if elapsed >= self.policy.max_wait {
            return Err(BudgetExceeded::WallClock {
                elapsed,
                limit: self.policy.max_wait,
            });
        }
        Ok(())
    }

    /// Delay before the next attempt, or the reason there is none
    pub fn next_delay(&self) -> Result<Duration, BudgetExceeded> {
        if !self.policy.has_attempts_remaining(self.attempts) {
            return Err(BudgetExceeded::Attempts {
                attempts: self.attempts,
                limit: self.policy.max_attempts,
            });
        }
        let delay = self.policy.delay_for_attempt(self.attempts + 1);
        if delay >= self.remaining() {
            return Err(BudgetExceeded::WallClock {
                elapsed: self.elapsed(),
                limit: self.policy.max_wait,
            });
        }
        Ok(delay)
    }
}
