//! Automatic error recovery strategies.
//!
//! Only one failure class is recovered locally on the bench: transient stage position
//! readback. Everything else surfaces to the orchestrator. The primitive here is still
//! generic: an operation is retried with exponential backoff and a recovery step (for
//! the stage, a reconnect) runs between attempts. When the attempts are exhausted the
//! last error is wrapped in [`DaqError::RetryExhausted`] so the caller can escalate.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Factor applied to the delay after every further failure.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound for a single delay.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(4)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            multiplier: default_multiplier(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }
}

/// Runs `operation` until it succeeds or the policy is exhausted.
///
/// `recover` runs between attempts; its failure is logged and does not stop the loop.
pub async fn retry_with_recovery<T, Op, OpFut, Rec, RecFut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: Op,
    mut recover: Rec,
) -> AppResult<T>
where
    Op: FnMut() -> OpFut,
    OpFut: Future<Output = AppResult<T>>,
    Rec: FnMut() -> RecFut,
    RecFut: Future<Output = AppResult<()>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Recovered after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                last_error = err.to_string();
                if attempt == attempts {
                    break;
                }
                let delay = policy.backoff(attempt);
                warn!(
                    operation,
                    attempt,
                    remaining = attempts - attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed, retrying"
                );
                sleep(delay).await;
                if let Err(recover_err) = recover().await {
                    warn!(operation, error = %recover_err, "Recovery step failed");
                }
            }
        }
    }

    Err(DaqError::RetryExhausted {
        operation: operation.to_string(),
        attempts,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::InstrumentName;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(4),
        }
    }

    async fn flaky(attempts: Arc<AtomicU32>, succeed_on_attempt: u32) -> AppResult<u32> {
        let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= succeed_on_attempt {
            Ok(n)
        } else {
            Err(DaqError::instrument(InstrumentName::XyStage, "usb glitch"))
        }
    }

    #[tokio::test]
    async fn test_retry_logic_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let recoveries = Arc::new(AtomicU32::new(0));
        let result = retry_with_recovery(
            &fast_policy(5),
            "read position",
            || flaky(attempts.clone(), 3),
            || {
                let recoveries = recoveries.clone();
                async move {
                    recoveries.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(recoveries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_logic_fails() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result = retry_with_recovery(
            &fast_policy(5),
            "read position",
            || flaky(attempts.clone(), 10),
            || async { Ok(()) },
        )
        .await;
        match result {
            Err(DaqError::RetryExhausted { attempts: n, .. }) => assert_eq!(n, 5),
            other => panic!("expected RetryExhausted, got {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_recovery_keeps_retrying() {
        let attempts = Arc::new(AtomicU32::new(0));
        let result = retry_with_recovery(
            &fast_policy(3),
            "read position",
            || flaky(attempts.clone(), 3),
            || async { Err(DaqError::instrument(InstrumentName::XyStage, "reconnect refused")) },
        )
        .await;
        assert_eq!(result.unwrap(), 3);
        assert!(logs_contain("Recovery step failed"));
        assert!(logs_contain("reconnect refused"));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(4));
    }
}
