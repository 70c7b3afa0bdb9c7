//! Sequence report rendering.
//!
//! Renders a finished or failed sequence as a kubectl-style table or as JSON.

use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::protocol::CheckRecord;
use crate::sequencer::{SequenceFailure, SequenceReport, StepRecord, StepSequencer, StepStatus};

const MESSAGE_WIDTH: usize = 96;

/// Row for the step summary table.
#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "STEP")]
    step: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "CHANGED")]
    changed: String,
    #[tabled(rename = "ATTEMPTS")]
    attempts: String,
    #[tabled(rename = "ELAPSED")]
    elapsed: String,
    #[tabled(rename = "MESSAGE")]
    message: String,
}

impl From<&StepRecord> for StepRow {
    fn from(record: &StepRecord) -> Self {
        let status = match record.status {
            StepStatus::Succeeded => "Succeeded".to_string(),
            StepStatus::Skipped => "Skipped".to_string(),
            StepStatus::Failed => record
                .result
                .as_ref()
                .and_then(|r| r.kind)
                .map_or_else(|| "Failed".to_string(), |kind| format!("Failed ({kind})")),
        };
        match &record.result {
            Some(result) => Self {
                step: record.name.clone(),
                status,
                changed: if result.changed { "yes" } else { "no" }.to_string(),
                attempts: result.attempts.to_string(),
                elapsed: format_elapsed(result.elapsed.as_secs()),
                message: truncate(&result.message, MESSAGE_WIDTH),
            },
            None => Self {
                step: record.name.clone(),
                status,
                changed: "-".to_string(),
                attempts: "-".to_string(),
                elapsed: "-".to_string(),
                message: String::new(),
            },
        }
    }
}

/// `1h2m3s` style durations, omitting leading zero units.
pub fn format_elapsed(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

fn truncate(message: &str, width: usize) -> String {
    let line = message.lines().next().unwrap_or_default();
    if line.chars().count() <= width {
        return line.to_string();
    }
    let cut: String = line.chars().take(width.saturating_sub(3)).collect();
    format!("{cut}...")
}

/// Table of every step in `steps`.
pub fn steps_table(steps: &[StepRecord]) -> String {
    let rows: Vec<StepRow> = steps.iter().map(StepRow::from).collect();
    let mut table = Table::new(rows);
    apply_table_style(&mut table);
    table.to_string()
}

/// kubectl-style formatting: no borders, no separators, 2-space column gap.
fn apply_table_style(table: &mut Table) {
    use tabled::settings::object::Columns;
    use tabled::settings::themes::Theme;
    use tabled::settings::{Modify, Padding};

    let mut theme = Theme::from_style(Style::empty());
    theme.remove_horizontal_lines();
    table.with(theme);
    table.with(Modify::new(Columns::new(..)).with(Padding::new(0, 2, 0, 0)));
}

pub fn render_success_table(report: &SequenceReport) -> String {
    let mode = if report.dry_run { " (dry run)" } else { "" };
    format!(
        "{}\n\n{} completed{} in {}",
        steps_table(&report.steps),
        report.sequence,
        mode,
        format_elapsed(report.elapsed.as_secs())
    )
}

pub fn render_failure_table(failure: &SequenceFailure) -> String {
    let mut out = String::new();
    if !failure.report.steps.is_empty() {
        out.push_str(&steps_table(&failure.report.steps));
        out.push_str("\n\n");
    }
    out.push_str(&format!(
        "{} stopped at step '{}' ({}) after {} attempt(s) in {}\n  {}",
        failure.report.sequence,
        failure.step,
        failure.kind,
        failure.attempts,
        format_elapsed(failure.elapsed.as_secs()),
        failure.message
    ));
    out
}

#[derive(Tabled)]
struct CheckRow {
    #[tabled(rename = "CHECK")]
    check: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

pub fn checks_table(records: &[CheckRecord]) -> String {
    let rows: Vec<CheckRow> = records
        .iter()
        .map(|r| CheckRow {
            check: r.check.clone(),
            state: r.state.clone(),
            detail: truncate(&r.detail, MESSAGE_WIDTH),
        })
        .collect();
    let mut table = Table::new(rows);
    apply_table_style(&mut table);
    table.to_string()
}

/// One planned step.
#[derive(Debug, Clone, Serialize, Tabled)]
pub struct PlanEntry {
    #[tabled(rename = "#")]
    pub index: usize,
    #[tabled(rename = "STEP")]
    pub step: String,
    #[tabled(rename = "ACTION")]
    pub action: String,
}

pub fn plan(sequence: &StepSequencer) -> Vec<PlanEntry> {
    sequence
        .stages()
        .iter()
        .enumerate()
        .map(|(i, stage)| PlanEntry {
            index: i + 1,
            step: stage.name().to_string(),
            action: stage.describe(),
        })
        .collect()
}

pub fn plan_table(entries: &[PlanEntry]) -> String {
    let mut table = Table::new(entries);
    apply_table_style(&mut table);
    table.to_string()
}

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
enum Outcome<'a> {
    Succeeded {
        #[serde(flatten)]
        report: &'a SequenceReport,
    },
    Failed {
        #[serde(flatten)]
        failure: &'a SequenceFailure,
    },
}

pub fn render_json(outcome: &Result<SequenceReport, SequenceFailure>) -> Result<String, serde_json::Error> {
    let outcome = match outcome {
        Ok(report) => Outcome::Succeeded { report },
        Err(failure) => Outcome::Failed { failure },
    };
    serde_json::to_string_pretty(&outcome)
}
