use std::time::Duration;

use crate::config::BrokerSettings;

/// Result of one reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Reconciled,
    Failed,
}

/// What to do with an event once its attempt finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    EmitSuccess,
    Redeliver { fail_count: u32, delay: Duration },
    Drop,
}

/// Fixed-delay retry policy. No backoff: every redelivery waits the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self::from_secs(settings.retry_delay_secs)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// `fail_count` is the budget the failed attempt was made with. A
    /// decremented budget of zero drops the event instead of redelivering it.
    pub fn decide(&self, outcome: Outcome, fail_count: u32) -> Action {
        match outcome {
            Outcome::Reconciled => Action::EmitSuccess,
            Outcome::Failed => match fail_count.saturating_sub(1) {
                0 => Action::Drop,
                remaining => Action::Redeliver {
                    fail_count: remaining,
                    delay: self.delay,
                },
            },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_secs(BrokerSettings::DEFAULT_RETRY_DELAY_SECS)
    }
}
