//! CLI configuration and argument parsing.
//!
//! Command-line flags (with `NETMIG_*` environment fallbacks) take precedence
//! over the optional YAML overrides file, which takes precedence over the
//! built-in defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use thiserror::Error;

use crate::cluster::NetworkType;
use crate::cluster::cidr::Cidr;
use crate::cluster::patch::{MigrationFeatures, ProviderSettings};
use crate::protocol::{ProtocolOptions, StepTiming, unknown_timings};
use crate::reboot::{AgentLocator, NodeRole, StaggerPolicy};
use crate::retry::RetrySpec;
use crate::sequencer::Selection;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Convergence-driven OpenShift network plugin migration.
///
/// Switches a running cluster between OpenShift SDN and OVN-Kubernetes in
/// place, waiting for every control loop to converge before moving on.
#[derive(Parser, Debug, Clone)]
#[command(name = "netmig")]
#[command(about = "In-place OpenShift network plugin migration and rollback")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Kubeconfig passed to every oc call (default: whatever oc resolves)
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Path to the oc binary (default: oc from PATH)
    #[arg(long, global = true, env = "NETMIG_OC_PATH")]
    pub oc_path: Option<PathBuf>,

    /// YAML file with protocol settings and per-step timing overrides
    #[arg(short, long, global = true, env = "NETMIG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log mutations and reboots instead of performing them; check each condition once
    #[arg(long, global = true, env = "NETMIG_DRY_RUN", default_value = "false")]
    pub dry_run: bool,

    /// Report format
    #[arg(short, long, global = true, env = "NETMIG_OUTPUT", value_enum, default_value = "table")]
    pub output: OutputFormat,

    /// Attempts per oc call on transient failures
    #[arg(long, global = true, env = "NETMIG_RETRIES")]
    pub retries: Option<u32>,

    /// Seconds between attempts of a read
    #[arg(long, global = true, env = "NETMIG_RETRY_DELAY")]
    pub retry_delay: Option<u64>,

    /// Seconds between attempts of a mutation
    #[arg(long, global = true, env = "NETMIG_WRITE_RETRY_DELAY")]
    pub write_retry_delay: Option<u64>,

    /// Kill an oc call running longer than this many seconds
    #[arg(long, global = true, env = "NETMIG_CALL_TIMEOUT", default_value = "120")]
    pub call_timeout: u64,

    /// Log format: json or pretty
    #[arg(long, global = true, env = "NETMIG_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "NETMIG_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Migrate from OpenShift SDN to OVN-Kubernetes
    Migrate {
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        features: FeatureArgs,
        #[command(flatten)]
        reboot: RebootArgs,
        /// MTU for the OVN-Kubernetes overlay
        #[arg(long)]
        mtu: Option<u32>,
        /// Geneve UDP port
        #[arg(long)]
        geneve_port: Option<u16>,
        /// Replaces the default 100.64.0.0/16 join subnet
        #[arg(long)]
        v4_internal_subnet: Option<String>,
        /// Extra range that must not overlap cluster networks (repeatable)
        #[arg(long = "reserved-range", value_name = "CIDR")]
        reserved_ranges: Vec<String>,
    },
    /// Roll back from OVN-Kubernetes to OpenShift SDN
    Rollback {
        #[command(flatten)]
        run: RunArgs,
        #[command(flatten)]
        features: FeatureArgs,
        #[command(flatten)]
        reboot: RebootArgs,
        /// MTU for the OpenShift SDN overlay
        #[arg(long)]
        mtu: Option<u32>,
        /// VXLAN UDP port
        #[arg(long)]
        vxlan_port: Option<u16>,
        /// Delete the NMState policy configuring this interface once rolled back
        #[arg(long, env = "NETMIG_NNCP_INTERFACE")]
        nncp_interface: Option<String>,
    },
    /// Run the preflight gates only
    Preflight {
        /// Network type the cluster would migrate to
        #[arg(long, value_enum, default_value = "OVNKubernetes")]
        target: NetworkType,
    },
    /// Reboot every node of one role and wait for the cluster to recover
    Reboot {
        /// master, worker, or any node-role.kubernetes.io/<role> label
        #[arg(long, value_parser = parse_role)]
        role: NodeRole,
        #[command(flatten)]
        reboot: RebootArgs,
    },
    /// Show where the cluster stands, without waiting or changing anything
    Status {
        /// Network type the cluster is expected to run
        #[arg(long, value_enum, default_value = "OVNKubernetes")]
        target: NetworkType,
    },
    /// List the steps of a protocol with their timeouts
    Plan {
        #[arg(value_enum)]
        protocol: ProtocolKind,
    },
}

/// Which steps of a protocol to run.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct RunArgs {
    /// Start at this step, skipping every earlier one
    #[arg(long, env = "NETMIG_FROM")]
    pub from: Option<String>,

    /// Skip these steps (comma-separated)
    #[arg(long, env = "NETMIG_SKIP", value_delimiter = ',')]
    pub skip: Vec<String>,
}

/// Features migrated along with the plugin. Unset keeps the operator default.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct FeatureArgs {
    #[arg(long)]
    pub egress_ip: Option<bool>,
    #[arg(long)]
    pub egress_firewall: Option<bool>,
    #[arg(long)]
    pub multicast: Option<bool>,
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct RebootArgs {
    /// Minutes before the first control plane node reboots
    #[arg(long)]
    pub stagger_initial: Option<u32>,
    /// Minutes between control plane reboots
    #[arg(long)]
    pub stagger_step: Option<u32>,
    /// Stagger worker reboots like control plane reboots
    #[arg(long)]
    pub stagger_workers: Option<bool>,
    /// Seconds to wait after the last reboot fires before polling readiness
    #[arg(long)]
    pub unreachable_grace: Option<u64>,
    /// Seconds to wait for every node to be ready again
    #[arg(long)]
    pub readiness_timeout: Option<u64>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Migrate,
    Rollback,
}

fn parse_role(value: &str) -> Result<NodeRole, String> {
    value.parse()
}

/// Settings read from `--config`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub features: MigrationFeatures,
    #[serde(default)]
    pub provider_settings: ProviderSettings,
    #[serde(default)]
    pub reserved_ranges: Vec<String>,
    pub nncp_interface: Option<String>,
    #[serde(default)]
    pub reboot: FileReboot,
    #[serde(default)]
    pub retry: FileRetry,
    pub operator_streak: Option<u32>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepTiming>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileReboot {
    pub initial_minutes: Option<u32>,
    pub step_minutes: Option<u32>,
    pub stagger_workers: Option<bool>,
    pub unreachable_grace_secs: Option<u64>,
    pub readiness_timeout_secs: Option<u64>,
    pub agent_namespace: Option<String>,
    pub agent_selector: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileRetry {
    pub attempts: Option<u32>,
    pub delay_secs: Option<u64>,
    pub write_delay_secs: Option<u64>,
    pub backoff: Option<f64>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }
}

/// What to run.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Migrate,
    Rollback,
    Preflight(NetworkType),
    Reboot(NodeRole),
    Status(NetworkType),
    Plan(ProtocolKind),
}

/// Application configuration derived from CLI args and the overrides file.
#[derive(Debug, Clone)]
pub struct Config {
    pub action: Action,
    pub kubeconfig: Option<PathBuf>,
    pub oc_path: Option<PathBuf>,
    pub call_timeout: Duration,
    pub dry_run: bool,
    pub output: OutputFormat,
    pub log_format: String,
    pub log_level: String,
    pub selection: Selection,
    pub read_retry: RetrySpec,
    pub write_retry: RetrySpec,
    pub protocol: ProtocolOptions,
}

const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_READ_DELAY: u64 = 3;
const DEFAULT_WRITE_DELAY: u64 = 5;

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

impl Config {
    /// Build from CLI arguments, reading `--config` if given.
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::build(args, file)
    }

    /// Merge `args` over `file` and validate the result.
    pub fn build(args: Args, file: FileConfig) -> Result<Self, ConfigError> {
        if let Some(path) = &args.kubeconfig {
            if !path.is_file() {
                return Err(invalid(format!(
                    "kubeconfig {} does not exist or is not a file",
                    path.display()
                )));
            }
        }
        if args.call_timeout == 0 {
            return Err(invalid("--call-timeout must be at least 1 second"));
        }

        let attempts = args.retries.or(file.retry.attempts).unwrap_or(DEFAULT_RETRIES);
        let read_delay = args
            .retry_delay
            .or(file.retry.delay_secs)
            .unwrap_or(DEFAULT_READ_DELAY);
        let write_delay = args
            .write_retry_delay
            .or(file.retry.write_delay_secs)
            .unwrap_or(DEFAULT_WRITE_DELAY);
        let backoff = file.retry.backoff.unwrap_or(1.0);
        let retry = |delay: u64| {
            RetrySpec::new(attempts, Duration::from_secs(delay))
                .and_then(|spec| spec.with_backoff(backoff))
                .map_err(|e| invalid(e.to_string()))
        };
        let read_retry = retry(read_delay)?;
        let write_retry = retry(write_delay)?;

        let mut protocol = ProtocolOptions {
            features: file.features,
            provider_settings: file.provider_settings,
            nncp_interface: file.nncp_interface,
            operator_streak: file.operator_streak.unwrap_or(3),
            timings: file.steps,
            ..ProtocolOptions::default()
        };
        let mut reserved = file.reserved_ranges;
        apply_file_reboot(&mut protocol, file.reboot);

        let (action, selection) = match args.command {
            Command::Migrate {
                run,
                features,
                reboot,
                mtu,
                geneve_port,
                v4_internal_subnet,
                reserved_ranges,
            } => {
                apply_features(&mut protocol.features, &features);
                apply_reboot(&mut protocol, &reboot);
                let settings = &mut protocol.provider_settings;
                settings.mtu = mtu.or(settings.mtu);
                settings.geneve_port = geneve_port.or(settings.geneve_port);
                if v4_internal_subnet.is_some() {
                    settings.v4_internal_subnet = v4_internal_subnet;
                }
                reserved.extend(reserved_ranges);
                (Action::Migrate, selection(run))
            }
            Command::Rollback {
                run,
                features,
                reboot,
                mtu,
                vxlan_port,
                nncp_interface,
            } => {
                apply_features(&mut protocol.features, &features);
                apply_reboot(&mut protocol, &reboot);
                let settings = &mut protocol.provider_settings;
                settings.mtu = mtu.or(settings.mtu);
                settings.vxlan_port = vxlan_port.or(settings.vxlan_port);
                if nncp_interface.is_some() {
                    protocol.nncp_interface = nncp_interface;
                }
                (Action::Rollback, selection(run))
            }
            Command::Preflight { target } => (Action::Preflight(target), Selection::default()),
            Command::Reboot { role, reboot } => {
                apply_reboot(&mut protocol, &reboot);
                (Action::Reboot(role), Selection::default())
            }
            Command::Status { target } => (Action::Status(target), Selection::default()),
            Command::Plan { protocol: kind } => (Action::Plan(kind), Selection::default()),
        };

        protocol.reserved_ranges = reserved
            .iter()
            .map(|r| r.parse::<Cidr>().map_err(|e| invalid(e.to_string())))
            .collect::<Result<_, _>>()?;

        validate_protocol(&protocol)?;

        Ok(Self {
            action,
            kubeconfig: args.kubeconfig,
            oc_path: args.oc_path,
            call_timeout: Duration::from_secs(args.call_timeout),
            dry_run: args.dry_run,
            output: args.output,
            log_format: args.log_format,
            log_level: args.log_level,
            selection,
            read_retry,
            write_retry,
            protocol,
        })
    }

    /// Log the effective configuration.
    pub fn display(&self) {
        tracing::info!(
            action = ?self.action,
            kubeconfig = ?self.kubeconfig,
            dry_run = self.dry_run,
            retries = self.read_retry.max_attempts(),
            read_delay_secs = self.read_retry.delay().as_secs(),
            write_delay_secs = self.write_retry.delay().as_secs(),
            call_timeout_secs = self.call_timeout.as_secs(),
            timing_overrides = self.protocol.timings.len(),
            "Configuration initialized"
        );

        if self.dry_run {
            tracing::warn!("DRY RUN MODE ENABLED - cluster state will not be changed, only logged");
        }
    }
}

fn selection(run: RunArgs) -> Selection {
    Selection {
        from: run.from,
        skip: run.skip,
    }
}

fn apply_features(features: &mut MigrationFeatures, args: &FeatureArgs) {
    features.egress_ip = args.egress_ip.or(features.egress_ip);
    features.egress_firewall = args.egress_firewall.or(features.egress_firewall);
    features.multicast = args.multicast.or(features.multicast);
}

fn apply_file_reboot(protocol: &mut ProtocolOptions, reboot: FileReboot) {
    let stagger = &mut protocol.stagger;
    stagger.initial_minutes = reboot.initial_minutes.unwrap_or(stagger.initial_minutes);
    stagger.step_minutes = reboot.step_minutes.unwrap_or(stagger.step_minutes);
    stagger.stagger_workers = reboot.stagger_workers.unwrap_or(stagger.stagger_workers);
    if let Some(secs) = reboot.unreachable_grace_secs {
        protocol.unreachable_grace = Duration::from_secs(secs);
    }
    if let Some(secs) = reboot.readiness_timeout_secs {
        protocol.readiness_timeout = Duration::from_secs(secs);
    }
    let defaults = AgentLocator::default();
    protocol.agent = AgentLocator {
        namespace: reboot.agent_namespace.unwrap_or(defaults.namespace),
        selector: reboot.agent_selector.unwrap_or(defaults.selector),
    };
}

fn apply_reboot(protocol: &mut ProtocolOptions, args: &RebootArgs) {
    let stagger: &mut StaggerPolicy = &mut protocol.stagger;
    stagger.initial_minutes = args.stagger_initial.unwrap_or(stagger.initial_minutes);
    stagger.step_minutes = args.stagger_step.unwrap_or(stagger.step_minutes);
    stagger.stagger_workers = args.stagger_workers.unwrap_or(stagger.stagger_workers);
    if let Some(secs) = args.unreachable_grace {
        protocol.unreachable_grace = Duration::from_secs(secs);
    }
    if let Some(secs) = args.readiness_timeout {
        protocol.readiness_timeout = Duration::from_secs(secs);
    }
}

fn validate_protocol(protocol: &ProtocolOptions) -> Result<(), ConfigError> {
    if protocol.stagger.step_minutes == 0 {
        return Err(invalid("stagger step must be at least 1 minute"));
    }
    if protocol.readiness_timeout.is_zero() {
        return Err(invalid("readiness timeout must be at least 1 second"));
    }
    if protocol.operator_streak == 0 {
        return Err(invalid("operatorStreak must be at least 1"));
    }
    if protocol.agent.namespace.is_empty() || protocol.agent.selector.is_empty() {
        return Err(invalid("agent namespace and selector must not be empty"));
    }
    if protocol.nncp_interface.as_deref().is_some_and(str::is_empty) {
        return Err(invalid("nncp interface must not be empty"));
    }
    for (name, timing) in &protocol.timings {
        if timing.timeout == Some(0) {
            return Err(invalid(format!("steps.{name}.timeout must be at least 1 second")));
        }
        if timing.interval == Some(0) {
            return Err(invalid(format!("steps.{name}.interval must be at least 1 second")));
        }
    }

    let unknown = unknown_timings(protocol).map_err(|e| invalid(e.to_string()))?;
    if !unknown.is_empty() {
        return Err(invalid(format!(
            "timing overrides for unknown step(s): {}",
            unknown.join(", ")
        )));
    }
    Ok(())
}
