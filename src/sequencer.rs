//! Ordered execution of convergence steps and reboots.
//!
//! The sequencer stops at the first failed stage and never undoes earlier
//! stages. A run can skip stages by name or resume from a named stage.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{EngineError, ErrorKind};
use crate::reboot::RollingReboot;
use crate::step::{ConvergenceStep, Runtime, StepResult, serialize_secs};

/// One entry of a sequence.
pub enum Stage {
    Converge(ConvergenceStep),
    Reboot(RollingReboot),
}

impl Stage {
    pub fn name(&self) -> &str {
        match self {
            Self::Converge(step) => step.name(),
            Self::Reboot(reboot) => reboot.name(),
        }
    }

    /// One-line summary for plans.
    pub fn describe(&self) -> String {
        match self {
            Self::Converge(step) => {
                let mutations: Vec<String> =
                    step.mutations().iter().map(crate::step::Mutation::describe).collect();
                let wait = format!(
                    "wait for {} (timeout {}s, every {}s)",
                    step.predicate_name(),
                    step.timeout().as_secs(),
                    step.poll_interval().as_secs()
                );
                if mutations.is_empty() {
                    wait
                } else {
                    format!("{}; {wait}", mutations.join("; "))
                }
            }
            Self::Reboot(reboot) => format!(
                "reboot {} nodes, then wait for all nodes ready (timeout {}s)",
                reboot.role(),
                reboot.readiness_timeout().as_secs()
            ),
        }
    }

    async fn run(&mut self, rt: &Runtime) -> StepResult {
        match self {
            Self::Converge(step) => step.run(rt).await,
            Self::Reboot(reboot) => reboot.run(rt).await,
        }
    }
}

impl From<ConvergenceStep> for Stage {
    fn from(step: ConvergenceStep) -> Self {
        Self::Converge(step)
    }
}

impl From<RollingReboot> for Stage {
    fn from(reboot: RollingReboot) -> Self {
        Self::Reboot(reboot)
    }
}

/// Which stages of a sequence to run.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Skip every stage before this one.
    pub from: Option<String>,
    pub skip: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepStatus {
    Succeeded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SequenceReport {
    pub sequence: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub steps: Vec<StepRecord>,
}

/// The stage that stopped a sequence, with everything run up to it.
#[derive(Error, Debug, Clone, Serialize)]
#[error(
    "step '{step}' failed ({kind}) after {attempts} attempt(s) in {}s: {message}",
    .elapsed.as_secs()
)]
pub struct SequenceFailure {
    pub step: String,
    pub kind: ErrorKind,
    pub attempts: u32,
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub message: String,
    pub report: SequenceReport,
}

/// A named, ordered list of stages.
pub struct StepSequencer {
    name: String,
    stages: Vec<Stage>,
}

impl StepSequencer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    pub fn push(&mut self, stage: impl Into<Stage>) -> &mut Self {
        self.stages.push(stage.into());
        self
    }

    #[must_use]
    pub fn then(mut self, stage: impl Into<Stage>) -> Self {
        self.push(stage);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// Per-stage run flags for `selection`.
    fn plan(&self, selection: &Selection) -> Result<Vec<bool>, EngineError> {
        let names = self.names();
        let mut seen = HashSet::new();
        if let Some(dup) = names.iter().find(|n| !seen.insert(**n)) {
            return Err(EngineError::InvalidSpec(format!(
                "duplicate step name '{dup}' in {}",
                self.name
            )));
        }

        let unknown: Vec<&str> = selection
            .from
            .iter()
            .chain(&selection.skip)
            .map(String::as_str)
            .filter(|n| !names.contains(n))
            .collect();
        if !unknown.is_empty() {
            return Err(EngineError::InvalidSpec(format!(
                "unknown step(s) {}; known steps: {}",
                unknown.join(", "),
                names.join(", ")
            )));
        }

        let first = selection
            .from
            .as_deref()
            .and_then(|from| names.iter().position(|n| *n == from))
            .unwrap_or(0);
        Ok(names
            .iter()
            .enumerate()
            .map(|(i, name)| i >= first && !selection.skip.iter().any(|s| s == name))
            .collect())
    }

    pub async fn run(
        &mut self,
        rt: &Runtime,
        selection: &Selection,
    ) -> Result<SequenceReport, SequenceFailure> {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut report = SequenceReport {
            sequence: self.name.clone(),
            dry_run: rt.is_dry_run(),
            started_at,
            finished_at: started_at,
            elapsed: Duration::ZERO,
            steps: Vec::with_capacity(self.stages.len()),
        };

        let plan = match self.plan(selection) {
            Ok(plan) => plan,
            Err(e) => {
                return Err(SequenceFailure {
                    step: self.name.clone(),
                    kind: e.kind(),
                    attempts: 0,
                    elapsed: Duration::ZERO,
                    message: e.to_string(),
                    report,
                });
            }
        };

        let total = self.stages.len();
        info!(sequence = %self.name, steps = total, dry_run = rt.is_dry_run(), "Starting sequence");

        for (index, (stage, selected)) in self.stages.iter_mut().zip(plan).enumerate() {
            let name = stage.name().to_string();
            if !selected {
                info!(step = %name, "[{}/{}] Skipped", index + 1, total);
                report.steps.push(StepRecord {
                    name,
                    status: StepStatus::Skipped,
                    result: None,
                });
                continue;
            }

            let result = if rt.cancel().is_cancelled() {
                StepResult::failed(EngineError::Cancelled, false, 0, Duration::ZERO)
            } else {
                info!(step = %name, "[{}/{}] {}", index + 1, total, stage.describe());
                stage.run(rt).await
            };

            if result.success {
                info!(
                    step = %name,
                    changed = result.changed,
                    elapsed_secs = result.elapsed.as_secs(),
                    "[{}/{}] Done: {}",
                    index + 1,
                    total,
                    result.message
                );
                report.steps.push(StepRecord {
                    name,
                    status: StepStatus::Succeeded,
                    result: Some(result),
                });
                continue;
            }

            error!(
                step = %name,
                kind = ?result.kind,
                attempts = result.attempts,
                "[{}/{}] Failed: {}",
                index + 1,
                total,
                result.message
            );
            let failure_kind = result.kind.unwrap_or(ErrorKind::Fatal);
            let attempts = result.attempts;
            let elapsed = result.elapsed;
            let message = result.message.clone();
            report.steps.push(StepRecord {
                name: name.clone(),
                status: StepStatus::Failed,
                result: Some(result),
            });
            report.finished_at = Utc::now();
            report.elapsed = start.elapsed();
            if index + 1 < total {
                warn!(
                    sequence = %self.name,
                    "Stopped; {} later step(s) not run. Resume with --from {}",
                    total - index - 1,
                    name
                );
            }
            return Err(SequenceFailure {
                step: name,
                kind: failure_kind,
                attempts,
                elapsed,
                message,
                report,
            });
        }

        report.finished_at = Utc::now();
        report.elapsed = start.elapsed();
        info!(
            sequence = %self.name,
            elapsed_secs = report.elapsed.as_secs(),
            "Sequence completed"
        );
        Ok(report)
    }
}
