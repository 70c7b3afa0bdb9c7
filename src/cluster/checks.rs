//! Convergence predicates over cluster state.
//!
//! Every predicate here only reads. Missing or unreadable status is reported
//! as `NotYet`; a predicate never claims success on state it could not see.

use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Node;
use serde_json::Value;
use tracing::debug;

use super::model::{
    ClusterOperator, ItemList, MachineConfigPool, NetworkConfig, NetworkOperator,
    NodeNetworkConfigurationPolicy, annotations, condition_is,
};
use super::oc::{self, CLUSTER, CLUSTER_OPERATORS, MACHINE_CONFIG_POOLS, MACHINE_CONFIGS, NNCP};
use super::NetworkType;
use crate::error::EngineError;
use crate::poll::{Observation, Predicate, Probe};

const CURRENT_CONFIG: &str = "machineconfiguration.openshift.io/currentConfig";
const DESIRED_CONFIG: &str = "machineconfiguration.openshift.io/desiredConfig";
const MCD_STATE: &str = "machineconfiguration.openshift.io/state";

/// Joins names for a log line, eliding long lists.
fn summarize(names: &[String]) -> String {
    const SHOWN: usize = 5;
    if names.len() <= SHOWN {
        return names.join(", ");
    }
    format!("{}, +{} more", names[..SHOWN].join(", "), names.len() - SHOWN)
}

pub fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or("<unnamed>")
}

/// A node without a Ready condition is not ready.
pub fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|c| c.status == "True")
}

/// `status.networkType` of `network.config/cluster`.
pub struct NetworkTypeIs {
    name: String,
    expected: NetworkType,
    strict: bool,
}

impl NetworkTypeIs {
    /// Waits until the cluster reports `expected`.
    pub fn new(expected: NetworkType) -> Self {
        Self {
            name: format!("network-type-is-{expected}"),
            expected,
            strict: false,
        }
    }

    /// Any other reported type is unsatisfiable.
    pub fn required(expected: NetworkType) -> Self {
        Self {
            strict: true,
            ..Self::new(expected)
        }
    }
}

#[async_trait]
impl Predicate for NetworkTypeIs {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        let config: NetworkConfig = probe
            .read_json(&oc::get_json(oc::NETWORK_CONFIG, Some(CLUSTER)))
            .await?;

        Ok(match config.status.network_type.as_deref() {
            None => Observation::NotYet("status.networkType not reported".to_string()),
            Some(t) if t == self.expected.as_str() => {
                Observation::Satisfied(format!("network type is {t}"))
            }
            Some(t) if self.strict => Observation::Unsatisfiable(format!(
                "network type is {t}, expected {}",
                self.expected
            )),
            Some(t) => Observation::NotYet(format!(
                "network type is {t}, waiting for {}",
                self.expected
            )),
        })
    }
}

/// `spec.migration.networkType` of `network.operator/cluster`.
///
/// `None` expects the migration field to be cleared.
pub struct MigrationFieldIs {
    name: String,
    expected: Option<NetworkType>,
}

impl MigrationFieldIs {
    pub fn new(expected: Option<NetworkType>) -> Self {
        let name = expected.map_or_else(
            || "migration-field-cleared".to_string(),
            |t| format!("migration-field-is-{t}"),
        );
        Self { name, expected }
    }
}

#[async_trait]
impl Predicate for MigrationFieldIs {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        let operator: NetworkOperator = probe
            .read_json(&oc::get_json(oc::NETWORK_OPERATOR, Some(CLUSTER)))
            .await?;
        let current = operator
            .spec
            .migration
            .and_then(|m| m.network_type);

        let expected = self.expected.map(NetworkType::as_str);
        Ok(if current.as_deref() == expected {
            Observation::Satisfied(format!(
                "migration field is {}",
                expected.unwrap_or("cleared")
            ))
        } else {
            Observation::NotYet(format!(
                "migration field is {}",
                current.as_deref().unwrap_or("unset")
            ))
        })
    }
}

/// One condition of one cluster operator.
pub struct OperatorCondition {
    name: String,
    operator: String,
    condition: String,
    status: bool,
}

impl OperatorCondition {
    pub fn new(operator: impl Into<String>, condition: impl Into<String>, status: bool) -> Self {
        let operator = operator.into();
        let condition = condition.into();
        Self {
            name: format!("co-{operator}-{condition}={status}"),
            operator,
            condition,
            status,
        }
    }
}

#[async_trait]
impl Predicate for OperatorCondition {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        let co: ClusterOperator = probe
            .read_json(&oc::get_json(CLUSTER_OPERATORS, Some(&self.operator)))
            .await?;

        Ok(
            if condition_is(&co.status.conditions, &self.condition, self.status) {
                Observation::Satisfied(format!(
                    "{} {}={}",
                    self.operator, self.condition, self.status
                ))
            } else {
                Observation::NotYet(format!(
                    "{} {} is not {}",
                    self.operator, self.condition, self.status
                ))
            },
        )
    }
}

fn operator_healthy(co: &ClusterOperator) -> bool {
    let conditions = &co.status.conditions;
    condition_is(conditions, "Available", true)
        && condition_is(conditions, "Progressing", false)
        && condition_is(conditions, "Degraded", false)
}

/// Every cluster operator Available, not Progressing, not Degraded, for
/// `required_streak` consecutive evaluations.
pub struct OperatorsHealthy {
    required_streak: u32,
    streak: u32,
}

impl OperatorsHealthy {
    pub fn new(required_streak: u32) -> Self {
        Self {
            required_streak: required_streak.max(1),
            streak: 0,
        }
    }
}

#[async_trait]
impl Predicate for OperatorsHealthy {
    fn name(&self) -> &str {
        "cluster-operators-healthy"
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        let operators = match probe
            .read_json::<ItemList<ClusterOperator>>(&oc::get_json(CLUSTER_OPERATORS, None))
            .await
        {
            Ok(list) => list.items,
            Err(e) => {
                self.streak = 0;
                return Err(e);
            }
        };

        if operators.is_empty() {
            self.streak = 0;
            return Ok(Observation::NotYet("no cluster operators listed".to_string()));
        }

        let unhealthy: Vec<String> = operators
            .iter()
            .filter(|co| !operator_healthy(co))
            .map(|co| co.name().to_string())
            .collect();

        if !unhealthy.is_empty() {
            self.streak = 0;
            return Ok(Observation::NotYet(format!(
                "{}/{} operators unhealthy: {}",
                unhealthy.len(),
                operators.len(),
                summarize(&unhealthy)
            )));
        }

        self.streak += 1;
        debug!(streak = self.streak, required = self.required_streak, "All cluster operators healthy");
        Ok(if self.streak >= self.required_streak {
            Observation::Satisfied(format!(
                "{} operators healthy for {} consecutive checks",
                operators.len(),
                self.streak
            ))
        } else {
            Observation::NotYet(format!(
                "all operators healthy ({}/{} consecutive checks)",
                self.streak, self.required_streak
            ))
        })
    }
}

async fn pools(probe: &Probe) -> Result<Vec<MachineConfigPool>, EngineError> {
    let list: ItemList<MachineConfigPool> = probe
        .read_json(&oc::get_json(MACHINE_CONFIG_POOLS, None))
        .await?;
    Ok(list.items)
}

/// One condition on every machine config pool.
pub struct PoolsCondition {
    name: String,
    condition: String,
    status: bool,
}

impl PoolsCondition {
    pub fn new(condition: impl Into<String>, status: bool) -> Self {
        let condition = condition.into();
        Self {
            name: format!("mcp-{condition}={status}"),
            condition,
            status,
        }
    }
}

#[async_trait]
impl Predicate for PoolsCondition {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        let pools = pools(probe).await?;
        if pools.is_empty() {
            return Ok(Observation::NotYet("no machine config pools listed".to_string()));
        }

        let pending: Vec<String> = pools
            .iter()
            .filter(|p| !condition_is(&p.status.conditions, &self.condition, self.status))
            .map(|p| p.name().to_string())
            .collect();

        Ok(if pending.is_empty() {
            Observation::Satisfied(format!(
                "all {} pools {}={}",
                pools.len(),
                self.condition,
                self.status
            ))
        } else {
            Observation::NotYet(format!(
                "pools not yet {}={}: {}",
                self.condition,
                self.status,
                summarize(&pending)
            ))
        })
    }
}

/// The machine config rollout for `network_type` has begun or is already
/// done: every pool Updating, or every node on a rendered config for it.
pub struct RolloutStarted {
    name: String,
    updating: PoolsCondition,
    applied: MachineConfigApplied,
}

impl RolloutStarted {
    pub fn new(network_type: NetworkType) -> Self {
        Self {
            name: format!("mco-rollout-started-{network_type}"),
            updating: PoolsCondition::new("Updating", true),
            applied: MachineConfigApplied::new(network_type),
        }
    }
}

#[async_trait]
impl Predicate for RolloutStarted {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        let updating = match self.updating.evaluate(probe).await? {
            Observation::NotYet(detail) => detail,
            other => return Ok(other),
        };
        Ok(match self.applied.evaluate(probe).await? {
            Observation::Satisfied(detail) => {
                Observation::Satisfied(format!("rollout already complete: {detail}"))
            }
            Observation::NotYet(_) => Observation::NotYet(updating),
            unsatisfiable => unsatisfiable,
        })
    }
}

/// Every machine config pool unpaused, Updated, not Updating, not Degraded.
pub struct PoolsSettled;

#[async_trait]
impl Predicate for PoolsSettled {
    fn name(&self) -> &str {
        "mcp-settled"
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        let pools = pools(probe).await?;
        if pools.is_empty() {
            return Ok(Observation::NotYet("no machine config pools listed".to_string()));
        }

        let mut updating = Vec::new();
        let mut degraded = Vec::new();
        let mut paused = Vec::new();
        for pool in &pools {
            let conditions = &pool.status.conditions;
            if pool.spec.paused {
                paused.push(pool.name().to_string());
            } else if condition_is(conditions, "Degraded", true) {
                degraded.push(pool.name().to_string());
            } else if !(condition_is(conditions, "Updated", true)
                && condition_is(conditions, "Updating", false))
            {
                updating.push(pool.name().to_string());
            }
        }

        if updating.is_empty() && degraded.is_empty() && paused.is_empty() {
            return Ok(Observation::Satisfied(format!(
                "all {} pools updated",
                pools.len()
            )));
        }

        let mut detail = format!(
            "{}/{} pools updated",
            pools.len() - updating.len() - degraded.len() - paused.len(),
            pools.len()
        );
        if !updating.is_empty() {
            detail.push_str(&format!("; updating: {}", summarize(&updating)));
        }
        if !degraded.is_empty() {
            detail.push_str(&format!("; degraded: {}", summarize(&degraded)));
        }
        if !paused.is_empty() {
            detail.push_str(&format!("; paused: {}", summarize(&paused)));
        }
        Ok(Observation::NotYet(detail))
    }
}

/// Daemonset fully rolled out on its current generation.
pub struct DaemonSetRolledOut {
    name: String,
    namespace: String,
    daemonset: String,
}

impl DaemonSetRolledOut {
    pub fn new(namespace: impl Into<String>, daemonset: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let daemonset = daemonset.into();
        Self {
            name: format!("ds-{namespace}/{daemonset}-rolled-out"),
            namespace,
            daemonset,
        }
    }
}

#[async_trait]
impl Predicate for DaemonSetRolledOut {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        let ds: DaemonSet = probe
            .read_json(&oc::get_json_in(&self.namespace, "daemonsets", &self.daemonset))
            .await?;

        let Some(status) = ds.status else {
            return Ok(Observation::NotYet("daemonset has no status".to_string()));
        };

        let generation = ds.metadata.generation.unwrap_or(0);
        if status.observed_generation.unwrap_or(0) < generation {
            return Ok(Observation::NotYet(format!(
                "generation {generation} not yet observed"
            )));
        }

        let desired = status.desired_number_scheduled;
        let updated = status.updated_number_scheduled.unwrap_or(0);
        let available = status.number_available.unwrap_or(0);
        Ok(if updated >= desired && available >= desired {
            Observation::Satisfied(format!("{available}/{desired} pods updated and available"))
        } else {
            Observation::NotYet(format!(
                "{updated}/{desired} updated, {available}/{desired} available"
            ))
        })
    }
}

/// Every node, whatever its role, reports Ready.
pub struct AllNodesReady;

#[async_trait]
impl Predicate for AllNodesReady {
    fn name(&self) -> &str {
        "all-nodes-ready"
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        let nodes: ItemList<Node> = probe.read_json(&oc::nodes()).await?;
        if nodes.items.is_empty() {
            return Ok(Observation::NotYet("no nodes listed".to_string()));
        }

        let not_ready: Vec<String> = nodes
            .items
            .iter()
            .filter(|n| !node_ready(n))
            .map(|n| node_name(n).to_string())
            .collect();

        Ok(if not_ready.is_empty() {
            Observation::Satisfied(format!("all {} nodes ready", nodes.items.len()))
        } else {
            Observation::NotYet(format!(
                "{}/{} nodes not ready: {}",
                not_ready.len(),
                nodes.items.len(),
                summarize(&not_ready)
            ))
        })
    }
}

/// Every node runs its desired rendered config, and that config starts
/// `configure-ovs.sh` for the given network type.
pub struct MachineConfigApplied {
    name: String,
    network_type: NetworkType,
}

impl MachineConfigApplied {
    pub fn new(network_type: NetworkType) -> Self {
        Self {
            name: format!("machine-config-applied-{network_type}"),
            network_type,
        }
    }

    fn exec_start(&self) -> String {
        format!(
            "ExecStart=/usr/local/bin/configure-ovs.sh {}",
            self.network_type
        )
    }
}

#[async_trait]
impl Predicate for MachineConfigApplied {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        let nodes: ItemList<Node> = probe.read_json(&oc::nodes()).await?;
        if nodes.items.is_empty() {
            return Ok(Observation::NotYet("no nodes listed".to_string()));
        }

        let mut issues = Vec::new();
        let mut configs = BTreeSet::new();
        for node in &nodes.items {
            let name = node_name(node);
            let annotations = annotations(&node.metadata);
            let current = annotations.get(CURRENT_CONFIG);
            let desired = annotations.get(DESIRED_CONFIG);
            let state = annotations.get(MCD_STATE).map_or("unknown", String::as_str);

            match (current, desired) {
                (Some(current), Some(desired)) if current == desired => {
                    configs.insert(current.clone());
                }
                (Some(current), Some(desired)) => {
                    issues.push(format!("{name} on {current}, wants {desired}"));
                }
                _ => issues.push(format!("{name} has no machine config annotations")),
            }
            if state != "Done" {
                issues.push(format!("{name} state {state}"));
            }
        }

        if !issues.is_empty() {
            return Ok(Observation::NotYet(summarize(&issues)));
        }

        let needle = self.exec_start();
        for config in &configs {
            let rendered = probe
                .read(&oc::get_json(MACHINE_CONFIGS, Some(config)))
                .await?;
            if !rendered.contains(&needle) {
                return Ok(Observation::NotYet(format!(
                    "{config} does not start configure-ovs.sh {}",
                    self.network_type
                )));
            }
        }

        Ok(Observation::Satisfied(format!(
            "{} nodes on {} rendered config(s) for {}",
            nodes.items.len(),
            configs.len(),
            self.network_type
        )))
    }
}

/// True when every field of `patch` already holds in `actual`.
///
/// Follows merge-patch rules: objects recurse, `null` means absent, and
/// anything else must be equal.
pub fn patch_holds(actual: &Value, patch: &Value) -> bool {
    let Value::Object(fields) = patch else {
        return actual == patch;
    };
    fields.iter().all(|(key, wanted)| match (wanted, actual.get(key)) {
        (Value::Null, current) => current.is_none_or(Value::is_null),
        (_, None) => false,
        (wanted, Some(current)) => patch_holds(current, wanted),
    })
}

/// A merge patch is reflected in the object it was applied to.
pub struct PatchApplied {
    name: String,
    kind: String,
    resource: String,
    patch: Value,
}

impl PatchApplied {
    pub fn new(kind: impl Into<String>, resource: impl Into<String>, patch: Value) -> Self {
        let kind = kind.into();
        let resource = resource.into();
        Self {
            name: format!("patched-{kind}/{resource}"),
            kind,
            resource,
            patch,
        }
    }
}

#[async_trait]
impl Predicate for PatchApplied {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        let current: Value = probe
            .read_json(&oc::get_json(&self.kind, Some(&self.resource)))
            .await?;

        Ok(if patch_holds(&current, &self.patch) {
            Observation::Satisfied(format!("{}/{} reflects {}", self.kind, self.resource, self.patch))
        } else {
            Observation::NotYet(format!("{}/{} does not reflect {}", self.kind, self.resource, self.patch))
        })
    }
}

/// An object no longer exists.
pub struct ResourceAbsent {
    name: String,
    kind: String,
    resource: String,
}

impl ResourceAbsent {
    pub fn new(kind: impl Into<String>, resource: impl Into<String>) -> Self {
        let kind = kind.into();
        let resource = resource.into();
        Self {
            name: format!("{kind}/{resource}-absent"),
            kind,
            resource,
        }
    }
}

#[async_trait]
impl Predicate for ResourceAbsent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        let found = probe.read(&oc::get_name(&self.kind, &self.resource)).await?;
        Ok(if found.is_empty() {
            Observation::Satisfied(format!("{}/{} is gone", self.kind, self.resource))
        } else {
            Observation::NotYet(format!("{found} still exists"))
        })
    }
}

/// Policies among `policies` that configure `interface`.
pub fn policies_for<'a>(
    policies: &'a [NodeNetworkConfigurationPolicy],
    interface: &str,
) -> Vec<&'a str> {
    policies
        .iter()
        .filter(|p| p.configures(interface))
        .filter_map(|p| p.metadata.name.as_deref())
        .collect()
}

/// No NMState policy configures `interface`. Satisfied when NMState is not
/// installed.
pub struct NoPolicyForInterface {
    name: String,
    interface: String,
}

impl NoPolicyForInterface {
    pub fn new(interface: impl Into<String>) -> Self {
        let interface = interface.into();
        Self {
            name: format!("no-nncp-for-{interface}"),
            interface,
        }
    }
}

#[async_trait]
impl Predicate for NoPolicyForInterface {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        if probe.read(&oc::crd_lookup(NNCP)).await?.is_empty() {
            return Ok(Observation::Satisfied("NMState is not installed".to_string()));
        }

        let policies: ItemList<NodeNetworkConfigurationPolicy> =
            probe.read_json(&oc::get_json(NNCP, None)).await?;
        let remaining = policies_for(&policies.items, &self.interface);
        Ok(if remaining.is_empty() {
            Observation::Satisfied(format!("no policy configures {}", self.interface))
        } else {
            Observation::NotYet(format!(
                "{} still configured by {}",
                self.interface,
                remaining.join(", ")
            ))
        })
    }
}
