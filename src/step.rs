//! Mutate, then wait for convergence.
//!
//! A `ConvergenceStep` applies zero or more idempotent mutations and then
//! polls its predicate until the cluster reports the expected state. A step
//! without mutations is a pure gate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{EngineError, ErrorKind};
use crate::exec::{CommandExecutor, Operation};
use crate::poll::{ConditionPoller, Deadline, Predicate, Probe};
use crate::retry::{RetrySpec, run_with_retry};

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Shared execution context for steps and reboots.
#[derive(Clone)]
pub struct Runtime {
    executor: Arc<dyn CommandExecutor>,
    read_retry: RetrySpec,
    write_retry: RetrySpec,
    cancel: CancellationToken,
    dry_run: bool,
}

impl Runtime {
    pub fn new(executor: Arc<dyn CommandExecutor>, cancel: CancellationToken) -> Self {
        Self {
            executor,
            read_retry: RetrySpec::default(),
            write_retry: RetrySpec::default(),
            cancel,
            dry_run: false,
        }
    }

    #[must_use]
    pub const fn with_read_retry(mut self, retry: RetrySpec) -> Self {
        self.read_retry = retry;
        self
    }

    #[must_use]
    pub const fn with_write_retry(mut self, retry: RetrySpec) -> Self {
        self.write_retry = retry;
        self
    }

    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn probe(&self) -> Probe {
        Probe::new(
            Arc::clone(&self.executor),
            self.read_retry,
            self.cancel.clone(),
        )
    }

    pub fn executor(&self) -> &dyn CommandExecutor {
        self.executor.as_ref()
    }

    pub const fn write_retry(&self) -> &RetrySpec {
        &self.write_retry
    }

    pub const fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    pub const fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Apply one mutating operation with the write retry policy.
    ///
    /// Returns whether the cluster reported a change, and the attempts used.
    /// In dry-run mode the operation is logged and skipped.
    pub async fn apply(&self, op: &Operation) -> (Result<bool, EngineError>, u32) {
        if self.dry_run {
            info!(command = %op.describe(), "[dry-run] Skipping mutation");
            return (Ok(false), 0);
        }

        let attempted = run_with_retry(self.executor(), op, &self.write_retry, &self.cancel).await;
        let changed = attempted
            .value
            .map(|output| !output.contains("(no change)"));
        (changed, attempted.attempts)
    }
}

/// Computes the mutating operations from fresh cluster state.
///
/// Used where the target of a mutation is only known at run time. An empty
/// list means nothing needs to change.
#[async_trait]
pub trait Resolve: Send + Sync {
    fn describe(&self) -> String;

    async fn resolve(&self, probe: &Probe) -> Result<Vec<Operation>, EngineError>;
}

/// An idempotent change to cluster state.
pub enum Mutation {
    Fixed { op: Operation, description: String },
    Resolved(Box<dyn Resolve>),
}

impl Mutation {
    pub fn describe(&self) -> String {
        match self {
            Self::Fixed { description, .. } => description.clone(),
            Self::Resolved(resolver) => resolver.describe(),
        }
    }

    async fn operations(&self, probe: &Probe) -> Result<Vec<Operation>, EngineError> {
        match self {
            Self::Fixed { op, .. } => Ok(vec![op.clone()]),
            Self::Resolved(resolver) => resolver.resolve(probe).await,
        }
    }
}

/// Outcome of one step, as reported to the sequencer and the user.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub success: bool,
    pub changed: bool,
    pub message: String,
    /// Mutation invocations plus predicate evaluations.
    pub attempts: u32,
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub kind: Option<ErrorKind>,
    #[serde(skip)]
    pub error: Option<EngineError>,
}

impl StepResult {
    pub fn succeeded(message: impl Into<String>, changed: bool, attempts: u32, elapsed: Duration) -> Self {
        Self {
            success: true,
            changed,
            message: message.into(),
            attempts,
            elapsed,
            kind: None,
            error: None,
        }
    }

    pub fn failed(error: EngineError, changed: bool, attempts: u32, elapsed: Duration) -> Self {
        Self {
            success: false,
            changed,
            message: error.to_string(),
            attempts,
            elapsed,
            kind: Some(error.kind()),
            error: Some(error),
        }
    }
}

pub fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64((d.as_secs_f64() * 10.0).round() / 10.0)
}

/// Mutations followed by a convergence wait.
pub struct ConvergenceStep {
    name: String,
    mutations: Vec<Mutation>,
    predicate: Box<dyn Predicate>,
    timeout: Duration,
    poll_interval: Duration,
}

impl ConvergenceStep {
    pub fn new(name: impl Into<String>, predicate: impl Predicate + 'static) -> Self {
        Self {
            name: name.into(),
            mutations: Vec::new(),
            predicate: Box::new(predicate),
            timeout: DEFAULT_STEP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn mutate(mut self, op: Operation, description: impl Into<String>) -> Self {
        self.mutations.push(Mutation::Fixed {
            op,
            description: description.into(),
        });
        self
    }

    #[must_use]
    pub fn mutate_with(mut self, resolver: impl Resolve + 'static) -> Self {
        self.mutations.push(Mutation::Resolved(Box::new(resolver)));
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn predicate_name(&self) -> &str {
        self.predicate.name()
    }

    pub async fn run(&mut self, rt: &Runtime) -> StepResult {
        let start = Instant::now();
        let probe = rt.probe();
        let mut attempts = 0;
        let mut changed = false;

        for mutation in &self.mutations {
            info!(step = %self.name, "Applying: {}", mutation.describe());
            let ops = match mutation.operations(&probe).await {
                Ok(ops) => ops,
                Err(e) => return StepResult::failed(e, changed, attempts, start.elapsed()),
            };
            if ops.is_empty() {
                info!(step = %self.name, "Nothing to change: {}", mutation.describe());
            }
            for op in &ops {
                let (result, used) = rt.apply(op).await;
                attempts += used;
                match result {
                    Ok(c) => changed |= c,
                    Err(e) => {
                        warn!(step = %self.name, command = %op.describe(), "Mutation failed: {}", e);
                        return StepResult::failed(e, changed, attempts, start.elapsed());
                    }
                }
            }
        }

        // A dry run reports what it sees once instead of waiting for changes
        // that were never made.
        let timeout = if rt.is_dry_run() {
            Duration::ZERO
        } else {
            self.timeout
        };
        let poller = ConditionPoller::new(self.poll_interval);

        match poller
            .wait_until(self.predicate.as_mut(), &probe, Deadline::after(timeout))
            .await
        {
            Ok(outcome) => StepResult::succeeded(
                outcome.detail,
                changed,
                attempts + outcome.evaluations,
                start.elapsed(),
            ),
            Err(EngineError::Timeout {
                evaluations,
                last_observation,
                ..
            }) if rt.is_dry_run() => StepResult::succeeded(
                format!(
                    "would wait up to {}s: {}",
                    self.timeout.as_secs(),
                    last_observation.unwrap_or_default()
                ),
                false,
                attempts + evaluations,
                start.elapsed(),
            ),
            Err(e) => {
                let evaluations = match &e {
                    EngineError::Timeout { evaluations, .. } => *evaluations,
                    _ => 0,
                };
                StepResult::failed(e, changed, attempts + evaluations, start.elapsed())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{RawOutput, ScriptedExecutor};
    use crate::poll::Observation;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Counts evaluations and reports satisfied from the given evaluation on.
    struct Counting {
        evaluations: Arc<AtomicU32>,
        satisfied_from: u32,
    }

    #[async_trait]
    impl Predicate for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn evaluate(&mut self, _probe: &Probe) -> Result<Observation, EngineError> {
            let n = self.evaluations.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.satisfied_from {
                Ok(Observation::Satisfied(format!("after {n}")))
            } else {
                Ok(Observation::NotYet(format!("evaluation {n}")))
            }
        }
    }

    fn counting(satisfied_from: u32) -> (Counting, Arc<AtomicU32>) {
        let evaluations = Arc::new(AtomicU32::new(0));
        (
            Counting {
                evaluations: Arc::clone(&evaluations),
                satisfied_from,
            },
            evaluations,
        )
    }

    fn runtime(exec: ScriptedExecutor) -> Runtime {
        Runtime::new(Arc::new(exec), CancellationToken::new())
            .with_write_retry(RetrySpec::new(3, Duration::from_secs(1)).unwrap())
    }

    fn patch() -> Operation {
        Operation::oc(["patch", "network.operator.openshift.io", "cluster"])
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_mutation_never_polls() {
        let exec = ScriptedExecutor::new().on(
            &["patch"],
            [RawOutput::failure(1, "Error from server (Invalid): invalid patch")],
        );
        let (predicate, evaluations) = counting(1);
        let mut step = ConvergenceStep::new("set-migration", predicate).mutate(patch(), "set migration");

        let result = step.run(&runtime(exec)).await;

        assert!(!result.success);
        assert_eq!(result.kind, Some(ErrorKind::Fatal));
        assert_eq!(result.attempts, 1);
        assert_eq!(evaluations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_mutation_never_polls() {
        let exec = ScriptedExecutor::new().on(&["patch"], [RawOutput::failure(1, "connection refused")]);
        let (predicate, evaluations) = counting(1);
        let mut step = ConvergenceStep::new("set-migration", predicate).mutate(patch(), "set migration");

        let result = step.run(&runtime(exec)).await;

        assert_eq!(result.kind, Some(ErrorKind::ExhaustedRetries));
        assert_eq!(result.attempts, 3);
        assert_eq!(evaluations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_then_converges() {
        let exec = ScriptedExecutor::new().on(
            &["patch"],
            [RawOutput::success("network.operator.openshift.io/cluster patched")],
        );
        let (predicate, evaluations) = counting(3);
        let mut step = ConvergenceStep::new("set-migration", predicate)
            .mutate(patch(), "set migration")
            .with_timeout(Duration::from_secs(30))
            .with_poll_interval(Duration::from_secs(5));

        let result = step.run(&runtime(exec)).await;

        assert!(result.success, "{}", result.message);
        assert!(result.changed);
        assert_eq!(result.attempts, 4);
        assert_eq!(evaluations.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_change_patch_not_reported_as_changed() {
        let exec = ScriptedExecutor::new().on(
            &["patch"],
            [RawOutput::success("network.operator.openshift.io/cluster patched (no change)")],
        );
        let (predicate, _) = counting(1);
        let mut step = ConvergenceStep::new("set-migration", predicate).mutate(patch(), "set migration");

        let result = step.run(&runtime(exec)).await;

        assert!(result.success);
        assert!(!result.changed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pure_gate_already_satisfied() {
        let (predicate, evaluations) = counting(1);
        let mut step = ConvergenceStep::new("gate", predicate);

        let result = step.run(&runtime(ScriptedExecutor::new())).await;

        assert!(result.success);
        assert!(!result.changed);
        assert_eq!(evaluations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_timeout_reports_kind() {
        let (predicate, _) = counting(u32::MAX);
        let mut step = ConvergenceStep::new("gate", predicate)
            .with_timeout(Duration::from_secs(20))
            .with_poll_interval(Duration::from_secs(10));

        let result = step.run(&runtime(ScriptedExecutor::new())).await;

        assert!(!result.success);
        assert_eq!(result.kind, Some(ErrorKind::Timeout));
        assert!(result.message.contains("last observation: evaluation 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_skips_mutation_and_does_not_wait() {
        let exec = Arc::new(ScriptedExecutor::new());
        let rt = Runtime::new(exec.clone(), CancellationToken::new()).with_dry_run(true);
        let (predicate, evaluations) = counting(u32::MAX);
        let mut step = ConvergenceStep::new("set-migration", predicate)
            .mutate(patch(), "set migration")
            .with_timeout(Duration::from_secs(2700));
        let start = Instant::now();

        let result = step.run(&rt).await;

        assert!(result.success);
        assert!(result.message.starts_with("would wait up to 2700s"));
        assert!(exec.calls().is_empty());
        assert_eq!(evaluations.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    struct NothingToDelete;

    #[async_trait]
    impl Resolve for NothingToDelete {
        fn describe(&self) -> String {
            "delete leftovers".to_string()
        }

        async fn resolve(&self, _probe: &Probe) -> Result<Vec<Operation>, EngineError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_mutation_with_nothing_to_do() {
        let (predicate, _) = counting(1);
        let mut step = ConvergenceStep::new("cleanup", predicate).mutate_with(NothingToDelete);

        let result = step.run(&runtime(ScriptedExecutor::new())).await;

        assert!(result.success);
        assert!(!result.changed);
        assert_eq!(result.attempts, 1);
    }

    #[test]
    fn test_step_result_serializes_seconds() {
        let result = StepResult::failed(
            EngineError::Cancelled,
            false,
            2,
            Duration::from_millis(1540),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["elapsed_secs"], 1.5);
        assert_eq!(json["kind"], "Cancelled");
        assert!(json.get("error").is_none());
    }
}
