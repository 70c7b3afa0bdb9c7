//! Serde models for the parts of `oc ... -o json` output the engine reads.
//!
//! Core resources use `k8s-openapi` types. OpenShift resources only model
//! the fields that are inspected; everything else is ignored.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;

/// `oc get <kind> -o json` wraps results in a `List` whatever the kind.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Finds condition `type_` (case-insensitive) and compares its status.
///
/// A missing condition never matches.
pub fn condition_is(conditions: &[Condition], type_: &str, status: bool) -> bool {
    let expected = if status { "True" } else { "False" };
    conditions
        .iter()
        .find(|c| c.type_.eq_ignore_ascii_case(type_))
        .is_some_and(|c| c.status == expected)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConditionedStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterOperator {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: ConditionedStatus,
}

impl ClusterOperator {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("<unnamed>")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MachineConfigPoolSpec {
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MachineConfigPool {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: MachineConfigPoolSpec,
    #[serde(default)]
    pub status: ConditionedStatus,
}

impl MachineConfigPool {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("<unnamed>")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetworkEntry {
    pub cidr: String,
    #[serde(default)]
    pub host_prefix: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineNetworking {
    #[serde(default)]
    pub machine_network: Vec<ClusterNetworkEntry>,
}

/// Networks in use, as listed under `Network.config` spec and status.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSettings {
    #[serde(default)]
    pub network_type: Option<String>,
    #[serde(default)]
    pub cluster_network: Vec<ClusterNetworkEntry>,
    #[serde(default)]
    pub service_network: Vec<String>,
    #[serde(default)]
    pub networking: Option<MachineNetworking>,
}

/// `network.config.openshift.io/cluster`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub spec: NetworkSettings,
    #[serde(default)]
    pub status: NetworkSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Migration {
    #[serde(default)]
    pub network_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SdnConfig {
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultNetwork {
    #[serde(rename = "type", default)]
    pub type_: Option<String>,
    #[serde(rename = "openshiftSDNConfig", default)]
    pub openshift_sdn_config: Option<SdnConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkOperatorSpec {
    #[serde(default)]
    pub migration: Option<Migration>,
    #[serde(default)]
    pub default_network: DefaultNetwork,
}

/// `network.operator.openshift.io/cluster`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkOperator {
    #[serde(default)]
    pub spec: NetworkOperatorSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    pub version: String,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterVersionStatus {
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// `clusterversion/version`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterVersion {
    #[serde(default)]
    pub status: ClusterVersionStatus,
}

impl NetworkConfig {
    /// Cluster, service and machine networks, as configured.
    pub fn used_ranges(&self) -> Vec<String> {
        let mut ranges: Vec<String> = self
            .spec
            .cluster_network
            .iter()
            .map(|n| n.cidr.clone())
            .collect();
        ranges.extend(self.spec.service_network.iter().cloned());
        if let Some(networking) = &self.status.networking {
            ranges.extend(networking.machine_network.iter().map(|n| n.cidr.clone()));
        }
        ranges
    }
}

impl ClusterVersion {
    /// Most recent version in the update history.
    pub fn current(&self) -> Option<&HistoryEntry> {
        self.status.history.first()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NncpInterface {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub interfaces: Vec<NncpInterface>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NncpSpec {
    #[serde(default)]
    pub desired_state: DesiredState,
}

/// `nodenetworkconfigurationpolicies.nmstate.io`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeNetworkConfigurationPolicy {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NncpSpec,
}

impl NodeNetworkConfigurationPolicy {
    pub fn configures(&self, interface: &str) -> bool {
        self.spec
            .desired_state
            .interfaces
            .iter()
            .any(|i| i.name.as_deref() == Some(interface))
    }
}

/// Annotations from `metadata`, empty when absent.
pub fn annotations(meta: &ObjectMeta) -> BTreeMap<String, String> {
    meta.annotations.clone().unwrap_or_default()
}
