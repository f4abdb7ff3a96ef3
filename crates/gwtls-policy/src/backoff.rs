//! Per-policy retry budget
//!
//! The kube runtime controller is the work queue; this module decides how
//! long a failed policy waits before it is picked up again, and when it stops
//! being retried on a timer at all.

use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::controller::Action;

use gwtls_common::retry::exponential_delay;
use gwtls_common::PolicyKey;

/// Default retry budget before a transient failure is left reported
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default first requeue delay after a failure
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Default cap on the requeue delay
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Default periodic resync for converged policies
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Requeue tuning for the policy controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Consecutive retryable failures tolerated before waiting for a change
    pub max_retries: u32,
    /// Delay after the first failure
    pub backoff_base: Duration,
    /// Upper bound on the delay
    pub backoff_max: Duration,
    /// Requeue interval after a successful reconcile
    pub resync_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }
}

/// Consecutive failure counts keyed by policy
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: DashMap<PolicyKey, u32>,
}

impl RetryTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a failure, returning the failures seen before this one
    pub fn record_failure(&self, key: &PolicyKey) -> u32 {
        let mut entry = self.attempts.entry(key.clone()).or_insert(0);
        let previous = *entry;
        *entry = previous.saturating_add(1);
        previous
    }

    /// Forget a policy's failures
    pub fn reset(&self, key: &PolicyKey) {
        self.attempts.remove(key);
    }

    /// Failures recorded for a policy
    pub fn attempts(&self, key: &PolicyKey) -> u32 {
        self.attempts.get(key).map(|a| *a).unwrap_or(0)
    }

    /// Count a failure and return the requeue delay for it, ignoring the budget
    pub fn next_delay(&self, key: &PolicyKey, settings: &ControllerSettings) -> Duration {
        let previous = self.record_failure(key);
        exponential_delay(settings.backoff_base, settings.backoff_max, previous)
    }

    /// Action for a retryable failure: exponential requeue within budget,
    /// otherwise wait for the next change
    pub fn next_action(&self, key: &PolicyKey, settings: &ControllerSettings) -> Action {
        let previous = self.attempts(key);
        let delay = self.next_delay(key, settings);
        if previous >= settings.max_retries {
            return Action::await_change();
        }
        Action::requeue(delay)
    }
}
