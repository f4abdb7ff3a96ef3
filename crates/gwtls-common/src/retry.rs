//! Retry and backoff arithmetic
//!
//! [`retry_with_backoff_if`] re-runs a read-modify-write against a shared
//! object while the store keeps answering with an optimistic-concurrency
//! conflict. [`exponential_delay`] is the requeue delay the controller uses
//! between whole reconciles of a failing policy.
//!
//! ```ignore
//! use gwtls_common::retry::{retry_with_backoff_if, RetryConfig};
//!
//! let gateway = retry_with_backoff_if(
//!     &RetryConfig::conflict(),
//!     "attach_policy",
//!     |e: &Error| e.is_conflict(),
//!     || attach_once(kube, &policy, "g1"),
//! )
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Bounds for an inline retry loop
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts before the last error is returned (0 = unbounded)
    pub max_attempts: u32,
    /// Sleep after the first failed attempt
    pub initial_delay: Duration,
    /// Upper bound for a single sleep
    pub max_delay: Duration,
    /// Growth factor applied to the sleep after each failure
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Short, bounded retry for write conflicts on a shared object.
    ///
    /// Each attempt re-reads the object, so a handful of quick attempts is
    /// enough; anything longer is surfaced to the reconcile loop.
    pub fn conflict() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }

    fn grow(&self, delay: Duration) -> Duration {
        let next = delay.as_secs_f64() * self.backoff_multiplier;
        Duration::from_secs_f64(next.min(self.max_delay.as_secs_f64()))
    }
}

/// Sleep for `delay` scaled by a random factor in `[0.5, 1.5)`
fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the attempt budget runs out.
///
/// Rejected errors are returned immediately without sleeping.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempt = 1u32;

    loop {
        let e = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => e,
        };

        if config.exhausted(attempt) {
            error!(operation = %operation_name, attempt, error = %e, "giving up after repeated conflicts");
            return Err(e);
        }

        let sleep = jittered(delay);
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = sleep.as_millis() as u64,
            "retrying"
        );
        tokio::time::sleep(sleep).await;

        delay = config.grow(delay);
        attempt += 1;
    }
}

/// Requeue delay for the `attempt`-th consecutive failure: `base * 2^attempt`, capped.
///
/// Saturating arithmetic keeps very large attempt counts at the cap.
pub fn exponential_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.saturating_mul(factor).min(max)
}
