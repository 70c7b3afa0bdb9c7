//! Waiting for an eventually-consistent cluster to reach an observable state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::exec::{CommandExecutor, Operation};
use crate::retry::{RetrySpec, pause, with_retry};

/// What a predicate saw on one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Not converged yet; the detail describes the current state.
    NotYet(String),
    Satisfied(String),
    /// The desired state can never be reached from here.
    Unsatisfiable(String),
}

impl Observation {
    pub fn detail(&self) -> &str {
        match self {
            Self::NotYet(d) | Self::Satisfied(d) | Self::Unsatisfiable(d) => d,
        }
    }
}

/// A read-only check over cluster state.
///
/// `evaluate` takes `&mut self` so a predicate can keep state across
/// evaluations within one poll (for example a consecutive-success streak).
#[async_trait]
pub trait Predicate: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError>;
}

/// Read access handed to predicates: executor, read retry policy, cancellation.
#[derive(Clone)]
pub struct Probe {
    executor: Arc<dyn CommandExecutor>,
    retry: RetrySpec,
    cancel: CancellationToken,
}

impl Probe {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        retry: RetrySpec,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            retry,
            cancel,
        }
    }

    /// Run an inspection operation with the read retry policy.
    pub async fn read(&self, op: &Operation) -> Result<String, EngineError> {
        with_retry(self.executor.as_ref(), op, &self.retry, &self.cancel).await
    }

    /// Run an inspection operation and parse its stdout as JSON.
    ///
    /// Output that does not parse is `Ambiguous`: the state is unknown, not bad.
    pub async fn read_json<T: DeserializeOwned>(&self, op: &Operation) -> Result<T, EngineError> {
        let output = self.read(op).await?;
        serde_json::from_str(&output).map_err(|e| {
            EngineError::Ambiguous(format!("unreadable output from `{}`: {e}", op.describe()))
        })
    }

    pub const fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Absolute expiry on the monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    expires: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        let start = Instant::now();
        Self {
            start,
            expires: start + timeout,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires
    }

    pub fn remaining(&self) -> Duration {
        self.expires.saturating_duration_since(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Successful end of a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    pub evaluations: u32,
    pub elapsed: Duration,
    pub detail: String,
}

/// Repeatedly evaluates a predicate until it holds or time runs out.
#[derive(Debug, Clone, Copy)]
pub struct ConditionPoller {
    interval: Duration,
}

impl ConditionPoller {
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub async fn wait_until(
        &self,
        predicate: &mut dyn Predicate,
        probe: &Probe,
        deadline: Deadline,
    ) -> Result<PollOutcome, EngineError> {
        let mut evaluations = 0;

        loop {
            if probe.cancel().is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            evaluations += 1;
            let observation = match predicate.evaluate(probe).await {
                Ok(observation) => observation,
                Err(e) if e.is_inconclusive() => Observation::NotYet(e.to_string()),
                Err(e) => return Err(e),
            };

            match observation {
                Observation::Satisfied(detail) => {
                    info!(
                        predicate = predicate.name(),
                        evaluations,
                        elapsed_secs = deadline.elapsed().as_secs(),
                        "Condition satisfied: {}",
                        detail
                    );
                    return Ok(PollOutcome {
                        evaluations,
                        elapsed: deadline.elapsed(),
                        detail,
                    });
                }
                Observation::Unsatisfiable(reason) => {
                    return Err(EngineError::Unsatisfiable(reason));
                }
                Observation::NotYet(detail) => {
                    debug!(
                        predicate = predicate.name(),
                        evaluations,
                        remaining_secs = deadline.remaining().as_secs(),
                        "Not yet: {}",
                        detail
                    );

                    if !deadline.is_expired() {
                        pause(self.interval.min(deadline.remaining()), probe.cancel()).await?;
                    }
                    if deadline.is_expired() {
                        return Err(EngineError::Timeout {
                            waited: deadline.elapsed(),
                            evaluations,
                            last_observation: Some(detail),
                        });
                    }
                }
            }
        }
    }
}
