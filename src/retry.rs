//! Bounded retry around a single operation.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineError, FailureKind};
use crate::exec::{CommandExecutor, Operation};

/// Longest single wait between attempts, whatever the multiplier says.
const MAX_DELAY: Duration = Duration::from_secs(600);

/// How often and how patiently an operation is retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySpec {
    max_attempts: u32,
    delay: Duration,
    backoff: Option<f64>,
}

impl RetrySpec {
    /// Fixed-delay retry.
    pub fn new(max_attempts: u32, delay: Duration) -> Result<Self, EngineError> {
        if max_attempts == 0 {
            return Err(EngineError::InvalidSpec(
                "max attempts must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            delay,
            backoff: None,
        })
    }

    /// Delay grows by `multiplier` after every failed attempt.
    pub fn with_backoff(self, multiplier: f64) -> Result<Self, EngineError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(EngineError::InvalidSpec(format!(
                "backoff multiplier must be finite and >= 1.0, got {multiplier}"
            )));
        }
        Ok(Self {
            backoff: Some(multiplier),
            ..self
        })
    }

    /// A single attempt, no retry.
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
            backoff: None,
        }
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            None => self.delay,
            Some(multiplier) => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = self.delay.as_secs_f64() * multiplier.powi(exponent);
                if secs.is_finite() && secs < MAX_DELAY.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    MAX_DELAY
                }
            }
        }
    }
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(3),
            backoff: None,
        }
    }
}

/// Result of a retried operation along with how many invocations it took.
#[derive(Debug)]
pub struct Attempted {
    pub value: Result<String, EngineError>,
    pub attempts: u32,
}

/// Sleep for `duration` unless cancelled first.
pub async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<(), EngineError> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        () = cancel.cancelled() => Err(EngineError::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Run `op` until it succeeds, fails fatally, or the attempts run out.
pub async fn run_with_retry(
    executor: &dyn CommandExecutor,
    op: &Operation,
    spec: &RetrySpec,
    cancel: &CancellationToken,
) -> Attempted {
    let mut attempts = 0;

    loop {
        if cancel.is_cancelled() {
            return Attempted {
                value: Err(EngineError::Cancelled),
                attempts,
            };
        }

        attempts += 1;
        match executor.execute(op).await {
            Ok(output) => {
                return Attempted {
                    value: Ok(output),
                    attempts,
                };
            }
            Err(FailureKind::Fatal(reason)) => {
                debug!(command = %op.describe(), attempt = attempts, "Fatal failure: {}", reason);
                return Attempted {
                    value: Err(EngineError::Fatal(reason)),
                    attempts,
                };
            }
            Err(FailureKind::Transient(reason)) => {
                if attempts >= spec.max_attempts {
                    warn!(
                        command = %op.describe(),
                        attempts,
                        "Giving up after transient failures: {}",
                        reason
                    );
                    return Attempted {
                        value: Err(EngineError::ExhaustedRetries {
                            attempts,
                            last: reason,
                        }),
                        attempts,
                    };
                }

                let wait = spec.delay_for(attempts);
                warn!(
                    command = %op.describe(),
                    attempt = attempts,
                    max_attempts = spec.max_attempts,
                    "Transient failure, retrying in {:?}: {}",
                    wait,
                    reason
                );
                if let Err(e) = pause(wait, cancel).await {
                    return Attempted {
                        value: Err(e),
                        attempts,
                    };
                }
            }
        }
    }
}

/// Convenience form of [`run_with_retry`] when the attempt count is not needed.
pub async fn with_retry(
    executor: &dyn CommandExecutor,
    op: &Operation,
    spec: &RetrySpec,
    cancel: &CancellationToken,
) -> Result<String, EngineError> {
    run_with_retry(executor, op, spec, cancel).await.value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{RawOutput, ScriptedExecutor};

    fn op() -> Operation {
        Operation::oc(["get", "nodes", "-o", "json"])
    }

    #[test]
    fn test_zero_attempts_rejected() {
        assert!(matches!(
            RetrySpec::new(0, Duration::from_secs(1)),
            Err(EngineError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_backoff_multiplier_validated() {
        let spec = RetrySpec::new(3, Duration::from_secs(1)).unwrap();
        assert!(spec.with_backoff(0.5).is_err());
        assert!(spec.with_backoff(f64::NAN).is_err());
        assert!(spec.with_backoff(f64::INFINITY).is_err());
        assert!(spec.with_backoff(1.0).is_ok());
    }

    #[test]
    fn test_delay_for_backoff() {
        let spec = RetrySpec::new(5, Duration::from_secs(2))
            .unwrap()
            .with_backoff(2.0)
            .unwrap();
        assert_eq!(spec.delay_for(1), Duration::from_secs(2));
        assert_eq!(spec.delay_for(2), Duration::from_secs(4));
        assert_eq!(spec.delay_for(3), Duration::from_secs(8));
        assert_eq!(spec.delay_for(40), MAX_DELAY);
    }

    #[test]
    fn test_delay_for_fixed() {
        let spec = RetrySpec::new(5, Duration::from_secs(3)).unwrap();
        assert_eq!(spec.delay_for(1), Duration::from_secs(3));
        assert_eq!(spec.delay_for(4), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_transient_exhausts_exact_attempts() {
        let exec = ScriptedExecutor::new().on(
            &["get", "nodes"],
            [RawOutput::failure(1, "dial tcp: connection refused")],
        );
        let spec = RetrySpec::new(4, Duration::from_secs(1)).unwrap();

        let result = run_with_retry(&exec, &op(), &spec, &CancellationToken::new()).await;

        assert_eq!(result.attempts, 4);
        assert_eq!(exec.calls().len(), 4);
        assert!(matches!(
            result.value,
            Err(EngineError::ExhaustedRetries { attempts: 4, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_stops_at_that_attempt() {
        let exec = ScriptedExecutor::new().on(
            &["get", "nodes"],
            [
                RawOutput::failure(1, "connection refused"),
                RawOutput::failure(1, "Error from server (Forbidden): nodes is forbidden"),
                RawOutput::success("never reached"),
            ],
        );
        let spec = RetrySpec::new(5, Duration::from_secs(1)).unwrap();

        let result = run_with_retry(&exec, &op(), &spec, &CancellationToken::new()).await;

        assert_eq!(result.attempts, 2);
        assert_eq!(exec.calls().len(), 2);
        assert!(matches!(result.value, Err(EngineError::Fatal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let exec = ScriptedExecutor::new().on(
            &["get", "nodes"],
            [
                RawOutput::failure(1, "i/o timeout"),
                RawOutput::success("{}"),
            ],
        );
        let spec = RetrySpec::default();

        let result = run_with_retry(&exec, &op(), &spec, &CancellationToken::new()).await;

        assert_eq!(result.attempts, 2);
        assert_eq!(result.value.unwrap(), "{}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_sleeps_between_attempts() {
        let exec = ScriptedExecutor::new().on(
            &["get", "nodes"],
            [RawOutput::failure(1, "connection refused")],
        );
        let spec = RetrySpec::new(3, Duration::from_secs(2)).unwrap();
        let start = tokio::time::Instant::now();

        let result = with_retry(&exec, &op(), &spec, &CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(EngineError::ExhaustedRetries { attempts: 3, .. })
        ));
        assert_eq!(exec.calls().len(), 3);
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let exec = ScriptedExecutor::new().on(&["get"], [RawOutput::success("")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run_with_retry(&exec, &op(), &RetrySpec::default(), &cancel).await;

        assert_eq!(result.attempts, 0);
        assert!(matches!(result.value, Err(EngineError::Cancelled)));
        assert!(exec.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let exec = ScriptedExecutor::new().on(
            &["get", "nodes"],
            [RawOutput::failure(1, "connection refused")],
        );
        let spec = RetrySpec::new(3, Duration::from_secs(3600)).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let result = run_with_retry(&exec, &op(), &spec, &cancel).await;

        assert_eq!(result.attempts, 1);
        assert!(matches!(result.value, Err(EngineError::Cancelled)));
    }
}
