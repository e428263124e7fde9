//! Retry and retention policies applied by the sync engine.

use std::time::Duration;

use crate::config::SyncConfig;

/// Fixed escalating backoff with a retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts after which an item becomes `Failed`
    pub max_retries: u32,
    /// Delay table indexed by attempt number; the last entry repeats
    pub delays: Vec<Duration>,
    /// Send permanent failures straight to `Failed`
    pub fail_fast_on_permanent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delays: [5, 10, 30, 60].map(Duration::from_secs).to_vec(),
            fail_fast_on_permanent: false,
        }
    }
}

impl RetryPolicy {
    /// Build the policy from configuration.
    #[must_use]
    pub fn from_settings(settings: &SyncConfig) -> Self {
        Self {
            max_retries: settings.max_retries,
            delays: settings
                .retry_delays_secs
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
            fail_fast_on_permanent: settings.fail_fast_on_permanent,
        }
    }

    /// Backoff before the next attempt, given the attempts made so far.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let Some(last) = self.delays.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let index = (attempts.saturating_sub(1) as usize).min(last);
        self.delays[index]
    }

    /// Whether `attempts` failures exhaust the budget.
    #[must_use]
    pub const fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_retries
    }
}

/// What happens to items once they reach a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// How long `Completed` items stay visible; `None` deletes on completion
    pub completed: Option<Duration>,
    /// Age after which `cleanup` purges `Failed` items
    pub cleanup_after: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: Some(Duration::from_secs(24 * 3600)),
            cleanup_after: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl RetentionPolicy {
    /// Build the policy from configuration.
    #[must_use]
    pub fn from_settings(settings: &SyncConfig) -> Self {
        let completed = match settings.completed_retention_hours {
            0 => None,
            hours => Some(Duration::from_secs(hours.saturating_mul(3600))),
        };
        Self {
            completed,
            cleanup_after: Duration::from_secs(
                settings.cleanup_retention_hours.saturating_mul(3600),
            ),
        }
    }

    /// Whether completed items are removed as soon as they complete.
    #[must_use]
    pub const fn removes_on_completion(&self) -> bool {
        self.completed.is_none()
    }

    /// Age after which `cleanup` purges `Completed` items.
    #[must_use]
    pub fn completed_window(&self) -> Duration {
        self.completed.unwrap_or(Duration::ZERO)
    }
}
