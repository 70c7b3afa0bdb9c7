//! External command execution.
//!
//! `Operation` describes one invocation of the cluster client as a program
//! plus a discrete argument list. Nothing here goes through a shell.
//!
//! `CommandExecutor` is the seam to the outside world: production code uses
//! `ProcessExecutor`, tests use `ScriptedExecutor`.

pub mod scripted;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::FailureKind;

pub use scripted::ScriptedExecutor;

/// Name of the cluster client binary.
pub const OC: &str = "oc";

/// Raw result of one external invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    /// Exit status; `None` when the process was killed or timed out.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RawOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.status, Some(0))
    }
}

/// Maps a raw invocation result onto success or a failure class.
pub type Classifier = fn(&RawOutput) -> Result<String, FailureKind>;

/// Default classification: exit 0 is success, a killed process is transient,
/// anything else is classified from stderr.
pub fn classify_default(raw: &RawOutput) -> Result<String, FailureKind> {
    match raw.status {
        Some(0) => Ok(raw.stdout.trim().to_string()),
        None => Err(FailureKind::Transient(format!(
            "process did not exit normally: {}",
            raw.stderr.trim()
        ))),
        Some(_) => Err(FailureKind::from_message(&raw.stderr)),
    }
}

/// Deletion of something that is already gone counts as success.
pub fn classify_absent_ok(raw: &RawOutput) -> Result<String, FailureKind> {
    if !raw.is_success() && raw.stderr.contains("NotFound") {
        return Ok(String::new());
    }
    classify_default(raw)
}

/// One fully-formed external call. Immutable once built.
#[derive(Debug, Clone)]
pub struct Operation {
    program: String,
    args: Vec<String>,
    classifier: Classifier,
}

impl Operation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            classifier: classify_default,
        }
    }

    /// An `oc` invocation.
    pub fn oc<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(OC, args)
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Human-readable rendering for logs. Never parsed back.
    pub fn describe(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            if arg.contains(char::is_whitespace) || arg.contains('"') {
                out.push_str(&format!("'{arg}'"));
            } else {
                out.push_str(arg);
            }
        }
        out
    }

    pub fn classify(&self, raw: &RawOutput) -> Result<String, FailureKind> {
        (self.classifier)(raw)
    }
}

/// The seam to the cluster client.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `program` with `args` exactly once and capture the result.
    async fn invoke(&self, program: &str, args: &[String]) -> std::io::Result<RawOutput>;

    /// Run an operation once and classify the outcome.
    async fn execute(&self, op: &Operation) -> Result<String, FailureKind> {
        debug!(command = %op.describe(), "Executing");
        match self.invoke(op.program(), op.args()).await {
            Ok(raw) => op.classify(&raw),
            Err(e) => Err(FailureKind::Fatal(format!(
                "failed to execute {}: {e}",
                op.program()
            ))),
        }
    }
}

/// Runs operations as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    /// Binary used for `oc` operations (lets callers point at a specific build).
    oc_path: Option<PathBuf>,
    /// Passed as `--kubeconfig` to every `oc` invocation.
    kubeconfig: Option<PathBuf>,
    /// Upper bound for a single invocation; a hung client is killed.
    call_timeout: Option<Duration>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_oc_path(mut self, path: Option<PathBuf>) -> Self {
        self.oc_path = path;
        self
    }

    #[must_use]
    pub fn with_kubeconfig(mut self, path: Option<PathBuf>) -> Self {
        self.kubeconfig = path;
        self
    }

    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        let is_oc = program == OC;
        let binary = match (&self.oc_path, is_oc) {
            (Some(path), true) => path.clone().into_os_string(),
            _ => program.into(),
        };

        let mut cmd = Command::new(binary);
        if let (true, Some(kubeconfig)) = (is_oc, &self.kubeconfig) {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn invoke(&self, program: &str, args: &[String]) -> std::io::Result<RawOutput> {
        let output = self.command(program, args).output();

        let output = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, output).await {
                Ok(result) => result?,
                Err(_) => {
                    return Ok(RawOutput {
                        status: None,
                        stdout: String::new(),
                        stderr: format!("timed out after {}s", limit.as_secs()),
                    });
                }
            },
            None => output.await?,
        };

        Ok(RawOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
