//! Error taxonomy for the convergence engine.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Outcome class of a single external invocation that did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Possibly recoverable: worth another attempt.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The requested outcome cannot happen; retrying is pointless.
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl FailureKind {
    /// Classify an error message from the cluster client.
    ///
    /// Lower-cases the text and looks for well-known markers. Anything else
    /// is fatal.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        let detail = Self::extract_error_details(message);

        if lower.contains("connection refused")
            || lower.contains("connection reset")
            || lower.contains("i/o timeout")
            || lower.contains("tls handshake timeout")
            || lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("unexpected eof")
            || lower.contains("no route to host")
            || lower.contains("unable to connect to the server")
            || lower.contains("client connection lost")
            || lower.contains("unable to return a response in the time allotted")
            || lower.contains("the server is currently unable to handle the request")
            || lower.contains("service unavailable")
            || lower.contains("too many requests")
            || lower.contains("rate limit")
            || lower.contains("etcdserver: request timed out")
            || lower.contains("the object has been modified")
            || lower.contains("please apply your changes to the latest version")
            || lower.contains("internal error occurred")
            || lower.contains("unable to upgrade connection")
            || lower.contains("container not found")
            || lower.contains("is not ready")
        {
            return Self::Transient(detail);
        }

        Self::Fatal(detail)
    }

    /// Reduce a multi-line client error to the line that carries the cause.
    ///
    /// `oc` prints warnings before the actual `error:` line; prefer that line.
    fn extract_error_details(message: &str) -> String {
        let trimmed = message.trim();
        if let Some(line) = trimmed
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("error:") || l.starts_with("Error from server"))
        {
            return line.to_string();
        }

        if trimmed.is_empty() {
            return "command failed without output".to_string();
        }

        trimmed.lines().last().unwrap_or(trimmed).trim().to_string()
    }

    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(r) | Self::Fatal(r) => r,
        }
    }
}

/// Errors surfaced by the retry, polling, step and reboot layers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("fatal failure: {0}")]
    Fatal(String),

    #[error("gave up after {attempts} attempt(s), last failure: {last}")]
    ExhaustedRetries { attempts: u32, last: String },

    #[error("condition can never be satisfied: {0}")]
    Unsatisfiable(String),

    #[error(
        "timed out after {}s ({evaluations} evaluation(s)), last observation: {}",
        .waited.as_secs(),
        .last_observation.as_deref().unwrap_or("none")
    )]
    Timeout {
        waited: Duration,
        evaluations: u32,
        last_observation: Option<String>,
    },

    #[error("could not interpret cluster state: {0}")]
    Ambiguous(String),

    #[error("cancelled")]
    Cancelled,

    #[error("failed to issue reboot to node {node}: {reason}")]
    RebootIssueFailed { node: String, reason: String },

    #[error("reboots issued to {rebooted} node(s) but the cluster did not recover: {reason}")]
    RecoveryTimeout { rebooted: usize, reason: String },

    #[error("invalid input: {0}")]
    InvalidSpec(String),
}

impl EngineError {
    /// Serializable classification for reports.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Fatal(_) => ErrorKind::Fatal,
            Self::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            Self::Unsatisfiable(_) => ErrorKind::Unsatisfiable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Ambiguous(_) => ErrorKind::Ambiguous,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::RebootIssueFailed { .. } => ErrorKind::RebootIssueFailed,
            Self::RecoveryTimeout { .. } => ErrorKind::RecoveryTimeout,
            Self::InvalidSpec(_) => ErrorKind::InvalidSpec,
        }
    }

    /// Returns true when the observed state is unknown rather than known-bad.
    ///
    /// A poller keeps waiting through these: the inspection call gave up or
    /// its output could not be read, which says nothing about convergence.
    pub const fn is_inconclusive(&self) -> bool {
        matches!(self, Self::ExhaustedRetries { .. } | Self::Ambiguous(_))
    }
}

impl From<FailureKind> for EngineError {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Fatal(r) => Self::Fatal(r),
            FailureKind::Transient(r) => Self::ExhaustedRetries {
                attempts: 1,
                last: r,
            },
        }
    }
}

/// Failure kind as shown in step and sequence reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Fatal,
    ExhaustedRetries,
    Unsatisfiable,
    Timeout,
    Ambiguous,
    Cancelled,
    RebootIssueFailed,
    RecoveryTimeout,
    InvalidSpec,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fatal => write!(f, "Fatal"),
            Self::ExhaustedRetries => write!(f, "ExhaustedRetries"),
            Self::Unsatisfiable => write!(f, "Unsatisfiable"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Ambiguous => write!(f, "Ambiguous"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::RebootIssueFailed => write!(f, "RebootIssueFailed"),
            Self::RecoveryTimeout => write!(f, "RecoveryTimeout"),
            Self::InvalidSpec => write!(f, "InvalidSpec"),
        }
    }
}
