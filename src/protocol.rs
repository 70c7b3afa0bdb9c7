//! Migration, rollback and preflight protocols.
//!
//! Each protocol is an ordered list of convergence steps and rolling reboots
//! handed to the sequencer. Step names are stable: they are what `--from`,
//! `--skip` and the per-step timing overrides refer to.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cluster::NetworkType;
use crate::cluster::checks::{
    AllNodesReady, DaemonSetRolledOut, MachineConfigApplied, MigrationFieldIs,
    NetworkTypeIs, NoPolicyForInterface, OperatorCondition, OperatorsHealthy, PatchApplied,
    PoolsSettled, ResourceAbsent, RolloutStarted, policies_for,
};
use crate::cluster::cidr::Cidr;
use crate::cluster::model::{ItemList, NodeNetworkConfigurationPolicy};
use crate::cluster::oc::{self, CLUSTER, MACHINE_CONFIG_POOLS, NETWORK_CONFIG, NETWORK_OPERATOR, NNCP};
use crate::cluster::patch::{self, MigrationFeatures, ProviderSettings};
use crate::cluster::preflight::{
    ClientAvailable, ClusterAdmin, ClusterVersionKnown, NetworkPolicyIsolation, NoCidrConflicts,
    OVN_RESERVED_RANGES,
};
use crate::error::EngineError;
use crate::exec::Operation;
use crate::poll::{Observation, Predicate, Probe};
use crate::reboot::{
    AgentLocator, DEFAULT_READINESS_TIMEOUT, DEFAULT_UNREACHABLE_GRACE, NodeRole, RollingReboot,
    StaggerPolicy,
};
use crate::sequencer::StepSequencer;
use crate::step::{ConvergenceStep, Resolve};

pub const MULTUS_NAMESPACE: &str = "openshift-multus";
pub const MULTUS_DAEMONSET: &str = "multus";

const PATCH_TIMEOUT: Duration = Duration::from_secs(120);
const ROLLOUT_START_TIMEOUT: Duration = Duration::from_secs(600);
const MACHINE_CONFIG_TIMEOUT: Duration = Duration::from_secs(2700);
const RESUMED_POOLS_TIMEOUT: Duration = Duration::from_secs(1800);
const RENDERED_CONFIG_TIMEOUT: Duration = Duration::from_secs(300);
const MULTUS_TIMEOUT: Duration = Duration::from_secs(300);
const OPERATORS_TIMEOUT: Duration = Duration::from_secs(2700);
const OPERATORS_INTERVAL: Duration = Duration::from_secs(30);
const NAMESPACE_TIMEOUT: Duration = Duration::from_secs(600);
const GATE_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_CONCURRENT_CHECKS: usize = 4;

/// Pools paused while a rollback reboots nodes by hand.
const POOLS: [&str; 2] = ["master", "worker"];

/// Per-step timing override, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepTiming {
    pub timeout: Option<u64>,
    pub interval: Option<u64>,
}

/// Everything the protocol builders need besides the direction.
#[derive(Debug, Clone)]
pub struct ProtocolOptions {
    pub features: MigrationFeatures,
    pub provider_settings: ProviderSettings,
    /// Checked for overlaps before migrating, on top of the OVN reserved ranges.
    pub reserved_ranges: Vec<Cidr>,
    /// Interface whose NMState policy is removed at the end of a rollback.
    pub nncp_interface: Option<String>,
    pub agent: AgentLocator,
    pub stagger: StaggerPolicy,
    pub unreachable_grace: Duration,
    pub readiness_timeout: Duration,
    pub operator_streak: u32,
    pub timings: BTreeMap<String, StepTiming>,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            features: MigrationFeatures::default(),
            provider_settings: ProviderSettings::default(),
            reserved_ranges: Vec::new(),
            nncp_interface: None,
            agent: AgentLocator::default(),
            stagger: StaggerPolicy::default(),
            unreachable_grace: DEFAULT_UNREACHABLE_GRACE,
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            operator_streak: 3,
            timings: BTreeMap::new(),
        }
    }
}

const fn slug(network_type: NetworkType) -> &'static str {
    match network_type {
        NetworkType::OvnKubernetes => "ovn",
        NetworkType::OpenShiftSdn => "sdn",
    }
}

/// Collects stages, applying timing overrides by step name.
struct Builder<'a> {
    opts: &'a ProtocolOptions,
    sequence: StepSequencer,
}

impl<'a> Builder<'a> {
    fn new(name: &str, opts: &'a ProtocolOptions) -> Self {
        Self {
            opts,
            sequence: StepSequencer::new(name),
        }
    }

    fn step(&mut self, mut step: ConvergenceStep) -> &mut Self {
        if let Some(timing) = self.opts.timings.get(step.name()) {
            if let Some(secs) = timing.timeout {
                step = step.with_timeout(Duration::from_secs(secs));
            }
            if let Some(secs) = timing.interval {
                step = step.with_poll_interval(Duration::from_secs(secs));
            }
        }
        self.sequence.push(step);
        self
    }

    fn reboot(&mut self, role: NodeRole) -> &mut Self {
        let mut reboot = RollingReboot::new(role)
            .with_agent(self.opts.agent.clone())
            .with_stagger(self.opts.stagger)
            .with_unreachable_grace(self.opts.unreachable_grace)
            .with_readiness_timeout(self.opts.readiness_timeout);
        if let Some(timing) = self.opts.timings.get(reboot.name()) {
            if let Some(secs) = timing.timeout {
                reboot = reboot.with_readiness_timeout(Duration::from_secs(secs));
            }
            if let Some(secs) = timing.interval {
                reboot = reboot.with_poll_interval(Duration::from_secs(secs));
            }
        }
        self.sequence.push(reboot);
        self
    }

    fn preflight(&mut self, target: NetworkType) -> Result<&mut Self, EngineError> {
        let source = target.other();
        self.step(ConvergenceStep::new("check-oc-client", ClientAvailable).with_timeout(GATE_TIMEOUT))
            .step(ConvergenceStep::new("check-cluster-admin", ClusterAdmin).with_timeout(GATE_TIMEOUT))
            .step(
                ConvergenceStep::new("check-network-type", NetworkTypeIs::required(source))
                    .with_timeout(GATE_TIMEOUT),
            );
        if target == NetworkType::OvnKubernetes {
            let ranges = self.ovn_conflict_ranges()?;
            self.step(
                ConvergenceStep::new("check-network-policy-mode", NetworkPolicyIsolation)
                    .with_timeout(GATE_TIMEOUT),
            )
            .step(
                ConvergenceStep::new("check-cidr-ranges", NoCidrConflicts::new(ranges))
                    .with_timeout(GATE_TIMEOUT),
            );
        }
        self.step(
            ConvergenceStep::new("check-cluster-version", ClusterVersionKnown).with_timeout(GATE_TIMEOUT),
        );
        Ok(self)
    }

    fn ovn_conflict_ranges(&self) -> Result<Vec<Cidr>, EngineError> {
        let mut ranges = Vec::new();
        for range in OVN_RESERVED_RANGES {
            ranges.push(parse_range(range)?);
        }
        if let Some(subnet) = &self.opts.provider_settings.v4_internal_subnet {
            ranges.push(parse_range(subnet)?);
        }
        ranges.extend(self.opts.reserved_ranges.iter().copied());
        Ok(ranges)
    }

    fn set_migration(&mut self, target: NetworkType) -> &mut Self {
        let payload = patch::set_migration(target, self.opts.features);
        self.step(
            ConvergenceStep::new("set-migration", MigrationFieldIs::new(Some(target)))
                .mutate(
                    oc::patch_merge(NETWORK_OPERATOR, CLUSTER, &payload),
                    format!("set spec.migration to {target}"),
                )
                .with_timeout(PATCH_TIMEOUT),
        )
    }

    /// Provider settings for `target`, when any apply to it.
    fn configure_provider(&mut self, target: NetworkType) -> &mut Self {
        let Some(payload) = patch::provider_settings(target, &self.opts.provider_settings) else {
            return self;
        };
        let op = oc::patch_merge(NETWORK_OPERATOR, CLUSTER, &payload);
        self.step(
            ConvergenceStep::new(
                format!("configure-{}", slug(target)),
                PatchApplied::new(NETWORK_OPERATOR, CLUSTER, payload),
            )
            .mutate(op, format!("set {} settings", target.config_key()))
            .with_timeout(PATCH_TIMEOUT),
        )
    }

    fn trigger(&mut self, target: NetworkType) -> &mut Self {
        let payload = patch::set_network_type(target);
        let op = oc::patch_merge(NETWORK_CONFIG, CLUSTER, &payload);
        self.step(
            ConvergenceStep::new(
                "trigger-network-type",
                PatchApplied::new(NETWORK_CONFIG, CLUSTER, payload),
            )
            .mutate(op, format!("set spec.networkType to {target}"))
            .with_timeout(PATCH_TIMEOUT),
        )
        .step(
            ConvergenceStep::new(
                "wait-network-operator-progressing",
                OperatorCondition::new("network", "Progressing", true),
            )
            .with_timeout(ROLLOUT_START_TIMEOUT),
        )
        .step(
            ConvergenceStep::new(
                "wait-multus-rollout",
                DaemonSetRolledOut::new(MULTUS_NAMESPACE, MULTUS_DAEMONSET),
            )
            .with_timeout(MULTUS_TIMEOUT),
        )
    }

    fn reboots(&mut self) -> &mut Self {
        self.reboot(NodeRole::Master).reboot(NodeRole::Worker)
    }

    fn pools_paused(&mut self, paused: bool) -> &mut Self {
        let payload = patch::pause_pool(paused);
        let verb = if paused { "pause" } else { "resume" };
        for pool in POOLS {
            self.step(
                ConvergenceStep::new(
                    format!("{verb}-{pool}-pool"),
                    PatchApplied::new(MACHINE_CONFIG_POOLS, pool, payload.clone()),
                )
                .mutate(
                    oc::patch_merge(MACHINE_CONFIG_POOLS, pool, &payload),
                    format!("{verb} machine config pool {pool}"),
                )
                .with_timeout(PATCH_TIMEOUT),
            );
        }
        self
    }

    fn verify(&mut self, target: NetworkType) -> &mut Self {
        let streak = self.opts.operator_streak;
        self.step(ConvergenceStep::new("wait-network-type", NetworkTypeIs::new(target)))
            .step(
                ConvergenceStep::new(
                    "wait-cluster-operators",
                    OperatorsHealthy::new(streak),
                )
                .with_timeout(OPERATORS_TIMEOUT)
                .with_poll_interval(OPERATORS_INTERVAL),
            )
    }

    fn cleanup(&mut self, source: NetworkType) -> &mut Self {
        let remove = patch::remove_provider_config(source);
        let remove_op = oc::patch_merge(NETWORK_OPERATOR, CLUSTER, &remove);
        let namespace = source.namespace();
        self.step(
            ConvergenceStep::new("clear-migration", MigrationFieldIs::new(None))
                .mutate(
                    oc::patch_merge(NETWORK_OPERATOR, CLUSTER, &patch::clear_migration()),
                    "clear spec.migration",
                )
                .with_timeout(PATCH_TIMEOUT),
        )
        .step(
            ConvergenceStep::new(
                format!("remove-{}-config", slug(source)),
                PatchApplied::new(NETWORK_OPERATOR, CLUSTER, remove),
            )
            .mutate(remove_op, format!("remove {}", source.config_key()))
            .with_timeout(PATCH_TIMEOUT),
        )
        .step(
            ConvergenceStep::new(
                format!("delete-{}-namespace", slug(source)),
                ResourceAbsent::new("namespace", namespace),
            )
            .mutate(oc::delete("namespace", namespace), format!("delete namespace {namespace}"))
            .with_timeout(NAMESPACE_TIMEOUT),
        )
    }

    fn finish(self) -> StepSequencer {
        self.sequence
    }
}

fn parse_range(range: &str) -> Result<Cidr, EngineError> {
    range
        .parse()
        .map_err(|e: crate::cluster::cidr::CidrParseError| EngineError::InvalidSpec(e.to_string()))
}

/// Gates only: nothing is changed.
pub fn preflight(target: NetworkType, opts: &ProtocolOptions) -> Result<StepSequencer, EngineError> {
    let mut builder = Builder::new("preflight", opts);
    builder.preflight(target)?;
    Ok(builder.finish())
}

/// OpenShift SDN to OVN-Kubernetes.
pub fn migration(opts: &ProtocolOptions) -> Result<StepSequencer, EngineError> {
    let target = NetworkType::OvnKubernetes;
    let mut builder = Builder::new("migrate", opts);
    builder
        .preflight(target)?
        .set_migration(target)
        .step(
            ConvergenceStep::new("wait-mco-updating", RolloutStarted::new(target))
                .with_timeout(ROLLOUT_START_TIMEOUT),
        )
        .step(ConvergenceStep::new("wait-mco-settled", PoolsSettled).with_timeout(MACHINE_CONFIG_TIMEOUT))
        .step(
            ConvergenceStep::new("verify-machine-config", MachineConfigApplied::new(target))
                .with_timeout(RENDERED_CONFIG_TIMEOUT),
        )
        .configure_provider(target)
        .trigger(target)
        .reboots()
        .verify(target)
        .cleanup(target.other());
    Ok(builder.finish())
}

/// OVN-Kubernetes back to OpenShift SDN.
///
/// Pools stay paused while nodes are rebooted by hand so that the machine
/// config operator does not reboot them a second time.
pub fn rollback(opts: &ProtocolOptions) -> Result<StepSequencer, EngineError> {
    let target = NetworkType::OpenShiftSdn;
    let mut builder = Builder::new("rollback", opts);
    builder
        .preflight(target)?
        .pools_paused(true)
        .set_migration(target)
        .configure_provider(target)
        .trigger(target)
        .reboots()
        .step(ConvergenceStep::new("wait-network-type", NetworkTypeIs::new(target)))
        .pools_paused(false)
        .step(ConvergenceStep::new("wait-mco-settled", PoolsSettled).with_timeout(RESUMED_POOLS_TIMEOUT))
        .step(
            ConvergenceStep::new(
                "wait-cluster-operators",
                OperatorsHealthy::new(opts.operator_streak),
            )
            .with_timeout(OPERATORS_TIMEOUT)
            .with_poll_interval(OPERATORS_INTERVAL),
        )
        .cleanup(target.other());
    if let Some(interface) = &opts.nncp_interface {
        builder.step(
            ConvergenceStep::new("delete-primary-nncp", NoPolicyForInterface::new(interface.clone()))
                .mutate_with(DeletePrimaryPolicy::new(interface.clone()))
                .with_timeout(PATCH_TIMEOUT),
        );
    }
    Ok(builder.finish())
}

/// One rolling reboot of `role`.
pub fn reboot(role: NodeRole, opts: &ProtocolOptions) -> StepSequencer {
    let mut builder = Builder::new("reboot", opts);
    builder.reboot(role);
    builder.finish()
}

/// Every step name any protocol can produce with `opts`.
pub fn step_names(opts: &ProtocolOptions) -> Result<BTreeSet<String>, EngineError> {
    let mut names = BTreeSet::new();
    for sequence in [migration(opts)?, rollback(opts)?] {
        names.extend(sequence.names().into_iter().map(str::to_string));
    }
    names.extend(
        [NodeRole::Master, NodeRole::Worker]
            .into_iter()
            .map(|role| RollingReboot::new(role).name().to_string()),
    );
    Ok(names)
}

/// Timing overrides naming no known step.
pub fn unknown_timings(opts: &ProtocolOptions) -> Result<Vec<String>, EngineError> {
    let known = step_names(opts)?;
    Ok(opts
        .timings
        .keys()
        .filter(|name| !known.contains(*name))
        .cloned()
        .collect())
}

/// Deletes the NMState policy that configures the primary interface.
///
/// Nothing to do when NMState is not installed or no policy matches.
pub struct DeletePrimaryPolicy {
    interface: String,
}

impl DeletePrimaryPolicy {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }
}

#[async_trait]
impl Resolve for DeletePrimaryPolicy {
    fn describe(&self) -> String {
        format!("delete the NMState policy configuring {}", self.interface)
    }

    async fn resolve(&self, probe: &Probe) -> Result<Vec<Operation>, EngineError> {
        if probe.read(&oc::crd_lookup(NNCP)).await?.is_empty() {
            info!("NMState operator not installed, skipping policy deletion");
            return Ok(Vec::new());
        }

        let policies: ItemList<NodeNetworkConfigurationPolicy> =
            probe.read_json(&oc::get_json(NNCP, None)).await?;
        Ok(policies_for(&policies.items, &self.interface)
            .into_iter()
            .map(|name| oc::delete(NNCP, name))
            .collect())
    }
}

/// What one read-only check saw.
#[derive(Debug, Clone, Serialize)]
pub struct CheckRecord {
    pub check: String,
    pub state: String,
    pub detail: String,
}

/// Read-only view of where the cluster stands relative to `target`.
pub fn status_checks(target: NetworkType) -> Vec<Box<dyn Predicate>> {
    vec![
        Box::new(ClusterVersionKnown),
        Box::new(NetworkTypeIs::new(target)),
        Box::new(MigrationFieldIs::new(None)),
        Box::new(PoolsSettled),
        Box::new(AllNodesReady),
        Box::new(DaemonSetRolledOut::new(MULTUS_NAMESPACE, MULTUS_DAEMONSET)),
        Box::new(OperatorsHealthy::new(1)),
    ]
}

/// Evaluates each check once, a few at a time, keeping input order.
pub async fn observe(checks: &mut [Box<dyn Predicate>], probe: &Probe) -> Vec<CheckRecord> {
    stream::iter(checks.iter_mut())
        .map(move |check| async move {
            let (state, detail) = match check.evaluate(probe).await {
                Ok(Observation::Satisfied(d)) => ("Satisfied", d),
                Ok(Observation::NotYet(d)) => ("NotYet", d),
                Ok(Observation::Unsatisfiable(d)) => ("Unsatisfiable", d),
                Err(e) => ("Error", e.to_string()),
            };
            CheckRecord {
                check: check.name().to_string(),
                state: state.to_string(),
                detail,
            }
        })
        .buffered(MAX_CONCURRENT_CHECKS)
        .collect()
        .await
}
