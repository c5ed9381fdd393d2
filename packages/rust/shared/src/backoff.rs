//! Bounded retry with exponential backoff.
//!
//! [`BackoffPolicy`] is a pure calculator; [`retry`] drives an async operation
//! under a policy, consuming a slot only for retriable failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::{EnrichmentSection, SinkSection};
use crate::error::{FailureClass, PipelineError, Result};

/// Lower and upper bound of the multiplicative jitter factor.
pub const JITTER_RANGE: (f64, f64) = (0.9, 1.1);

/// Exponent ceiling; larger attempts are capped by `max_delay` anyway.
const MAX_EXPONENT: u32 = 32;

/// Retry parameters for one kind of unreliable call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Un-jittered delay: `min(max_delay, base_delay * 2^attempt)`.
    ///
    /// Non-decreasing in `attempt` and never above `max_delay`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, 1.0)
    }

    /// Delay for a given jitter factor, never above `max_delay`.
    ///
    /// Jitter that would overshoot the cap is reflected below it, so delays at
    /// the cap still spread over `[0.9 * max_delay, max_delay]`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exp = 2_f64.powi(attempt.min(MAX_EXPONENT) as i32);
        let max_ms = self.max_delay.as_millis() as f64;
        let nominal_ms = (self.base_delay.as_millis() as f64 * exp).min(max_ms);
        let mut ms = nominal_ms * jitter;
        if ms > max_ms {
            ms = 2.0 * max_ms - ms;
        }
        Duration::from_millis(ms.max(0.0).round() as u64)
    }

    /// Jittered delay before the retry that follows failed attempt `attempt`
    /// (0-indexed). Jitter is drawn from [`JITTER_RANGE`].
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::rng().random_range(JITTER_RANGE.0..=JITTER_RANGE.1);
        self.delay_with_jitter(attempt, jitter)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl From<&EnrichmentSection> for BackoffPolicy {
    fn from(section: &EnrichmentSection) -> Self {
        Self::new(
            section.max_attempts,
            Duration::from_millis(section.base_delay_ms),
            Duration::from_millis(section.max_delay_ms),
        )
    }
}

impl From<&SinkSection> for BackoffPolicy {
    fn from(section: &SinkSection) -> Self {
        Self::new(
            section.max_attempts,
            Duration::from_millis(section.base_delay_ms),
            Duration::from_millis(section.max_delay_ms),
        )
    }
}

// ---------------------------------------------------------------------------
// Retry runner
// ---------------------------------------------------------------------------

/// How a retried operation ended.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// The operation succeeded on attempt `attempts`.
    Succeeded { value: T, attempts: u32 },
    /// A terminal failure; retrying could not help.
    Terminal { error: PipelineError, attempts: u32 },
    /// Every attempt failed with a retriable error.
    Exhausted {
        last_error: PipelineError,
        attempts: u32,
    },
}

impl<T> RetryOutcome<T> {
    /// Attempts consumed, including the last one.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. }
            | Self::Terminal { attempts, .. }
            | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Run `op` under `policy`.
///
/// `op` receives the 1-indexed attempt number. Retriable errors sleep for
/// [`BackoffPolicy::delay`] and try again until `max_attempts` is reached;
/// terminal errors return at once.
pub async fn retry<T, F, Fut>(policy: &BackoffPolicy, mut op: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                };
            }
            Err(err) => err,
        };

        if err.failure_class() == FailureClass::Terminal {
            tracing::debug!(attempt, error = %err, "terminal failure, not retrying");
            return RetryOutcome::Terminal {
                error: err,
                attempts: attempt,
            };
        }

        if attempt >= policy.max_attempts {
            tracing::warn!(attempts = attempt, error = %err, "retries exhausted");
            return RetryOutcome::Exhausted {
                last_error: err,
                attempts: attempt,
            };
        }

        let delay = policy.delay(attempt - 1);
        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retriable failure, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}
