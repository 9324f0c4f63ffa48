//! Backoff policies for worker restarts and handler retries

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on configured retries
const MAX_RETRY_ATTEMPTS: u32 = 1000;
/// Upper bound on any configured backoff
const MAX_BACKOFF_MILLIS: u64 = 3_600_000;
/// Upper bound on the exponential multiplier
const MAX_MULTIPLIER: f64 = 100.0;
/// Upper bound on the jitter factor
const MAX_JITTER_FACTOR: f64 = 1.0;

fn validate_max_retries<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u32::deserialize(deserializer)?;
    if value > MAX_RETRY_ATTEMPTS {
        return Err(serde::de::Error::custom(format!(
            "max_retries {} exceeds maximum allowed value {}",
            value, MAX_RETRY_ATTEMPTS
        )));
    }
    Ok(value)
}

/// Backoff durations are configured in milliseconds
fn validate_backoff_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    if millis > MAX_BACKOFF_MILLIS {
        return Err(serde::de::Error::custom(format!(
            "backoff of {}ms exceeds maximum allowed {}ms",
            millis, MAX_BACKOFF_MILLIS
        )));
    }
    Ok(Duration::from_millis(millis))
}

fn validate_multiplier<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || !(1.0..=MAX_MULTIPLIER).contains(&value) {
        return Err(serde::de::Error::custom(format!(
            "backoff_multiplier {} must be finite and between 1.0 and {}",
            value, MAX_MULTIPLIER
        )));
    }
    Ok(value)
}

fn validate_jitter<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || !(0.0..=MAX_JITTER_FACTOR).contains(&value) {
        return Err(serde::de::Error::custom(format!(
            "jitter_factor {} must be finite and between 0.0 and {}",
            value, MAX_JITTER_FACTOR
        )));
    }
    Ok(value)
}

/// Retry policy with validated bounds
///
/// Used twice: as the supervisor's restart policy for failed workers, and as
/// the per-handler retry policy for failed invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    #[serde(deserialize_with = "validate_max_retries")]
    pub max_retries: u32,
    /// Backoff before the first retry, in milliseconds
    #[serde(
        rename = "initial_backoff_ms",
        serialize_with = "crate::config::millis::serialize",
        deserialize_with = "validate_backoff_ms"
    )]
    pub initial_backoff: Duration,
    /// Cap on any single backoff, in milliseconds
    #[serde(
        rename = "max_backoff_ms",
        serialize_with = "crate::config::millis::serialize",
        deserialize_with = "validate_backoff_ms"
    )]
    pub max_backoff: Duration,
    /// Growth factor between consecutive backoffs
    #[serde(deserialize_with = "validate_multiplier")]
    pub backoff_multiplier: f64,
    /// Random extra delay as a fraction of the backoff (0.0 to 1.0)
    #[serde(deserialize_with = "validate_jitter")]
    pub jitter_factor: f64,
    /// Exponential growth when true, fixed interval otherwise
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(100), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    /// Backoff to wait before retry number `attempt` (1-based)
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let initial = self.initial_backoff.as_secs_f64();
        let ceiling = self.max_backoff.as_secs_f64();

        let base = if self.exponential {
            let factor = if attempt > 30 {
                f64::INFINITY
            } else {
                self.backoff_multiplier.powi(attempt as i32 - 1)
            };
            if factor.is_finite() {
                (initial * factor).min(ceiling)
            } else {
                ceiling
            }
        } else {
            initial.min(ceiling)
        };

        let jitter = base * self.jitter_factor * rand::random::<f64>();
        let backoff = Duration::from_secs_f64(base + jitter);

        debug!(attempt, backoff_ms = backoff.as_millis() as u64, "computed backoff");
        backoff
    }

    /// Whether another retry is allowed after `attempt` retries
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Fixed interval between retries, no jitter
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff: backoff,
            max_backoff: backoff,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
            exponential: false,
        }
    }

    /// Doubling backoff from `initial` up to `max`, with 10% jitter
    pub fn exponential(max_retries: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff: initial,
            max_backoff: max,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            exponential: true,
        }
    }

    /// Check invariants that serde cannot express on a single field
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_backoff > self.max_backoff {
            return Err(format!(
                "initial backoff {:?} exceeds max backoff {:?}",
                self.initial_backoff, self.max_backoff
            ));
        }
        if self.max_retries > MAX_RETRY_ATTEMPTS {
            return Err(format!(
                "max_retries {} exceeds maximum allowed value {}",
                self.max_retries, MAX_RETRY_ATTEMPTS
            ));
        }
        Ok(())
    }
}

/// Outcome of [`RetryExecutor::execute`]
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// Operation eventually succeeded
    Success {
        /// Returned value
        value: T,
        /// Retries needed (0 when the first attempt succeeded)
        attempts: u32,
    },
    /// Operation failed and no retry budget is left
    Failed {
        /// Last error
        error: E,
        /// Retries performed
        attempts: u32,
    },
}

impl<T, E> RetryResult<T, E> {
    /// Number of retries performed
    pub fn attempts(&self) -> u32 {
        match self {
            RetryResult::Success { attempts, .. } | RetryResult::Failed { attempts, .. } => {
                *attempts
            }
        }
    }

    /// Convert into a plain `Result`
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryResult::Success { value, .. } => Ok(value),
            RetryResult::Failed { error, .. } => Err(error),
        }
    }
}

/// Runs an async operation under a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create a new retry executor
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy this executor applies
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry every error until the policy is exhausted
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> RetryResult<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_with_predicate(operation, |_| true).await
    }

    /// Retry only errors accepted by `should_retry`
    ///
    /// The operation receives the current retry number (0 on the first call).
    pub async fn execute_with_predicate<F, Fut, P, T, E>(
        &self,
        mut operation: F,
        mut should_retry: P,
    ) -> RetryResult<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "operation succeeded after retries");
                    }
                    return RetryResult::Success {
                        value,
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    if !self.policy.should_retry(attempt) || !should_retry(&error) {
                        if attempt > 0 {
                            warn!(attempts = attempt + 1, %error, "operation failed, giving up");
                        }
                        return RetryResult::Failed {
                            error,
                            attempts: attempt,
                        };
                    }

                    attempt += 1;
                    let backoff = self.policy.next_backoff(attempt);
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        %error,
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
