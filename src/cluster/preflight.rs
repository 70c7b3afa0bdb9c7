//! Gates checked before anything is mutated.
//!
//! A violated precondition is `Unsatisfiable`, which fails the gate on the
//! first evaluation instead of waiting out its timeout.

use async_trait::async_trait;
use tracing::{info, warn};

use super::cidr::Cidr;
use super::model::{ClusterVersion, NetworkConfig, NetworkOperator};
use super::oc::{self, CLUSTER, CLUSTER_VERSION, NETWORK_CONFIG, NETWORK_OPERATOR};
use super::NetworkType;
use crate::error::EngineError;
use crate::poll::{Observation, Predicate, Probe};

/// Ranges OVN-Kubernetes reserves for itself (join and transit switch subnets).
pub const OVN_RESERVED_RANGES: [&str; 2] = ["100.64.0.0/16", "100.88.0.0/16"];

/// The `oc` client can be executed.
pub struct ClientAvailable;

#[async_trait]
impl Predicate for ClientAvailable {
    fn name(&self) -> &str {
        "oc-client-available"
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        match probe.read(&oc::client_version()).await {
            Ok(output) => {
                let version = output.lines().next().unwrap_or("unknown version").to_string();
                Ok(Observation::Satisfied(version))
            }
            Err(EngineError::Fatal(reason)) => Ok(Observation::Unsatisfiable(format!(
                "oc client is not usable: {reason}"
            ))),
            Err(e) => Err(e),
        }
    }
}

/// The current user may do anything in every namespace.
pub struct ClusterAdmin;

#[async_trait]
impl Predicate for ClusterAdmin {
    fn name(&self) -> &str {
        "cluster-admin"
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        let user = match probe.read(&oc::whoami()).await {
            Ok(user) => user,
            Err(EngineError::Fatal(reason)) => {
                return Ok(Observation::Unsatisfiable(format!("not logged in: {reason}")));
            }
            Err(e) => return Err(e),
        };

        if user == "system:admin" {
            return Ok(Observation::Satisfied(format!("logged in as {user}")));
        }

        let answer = probe.read(&oc::can_i_everything()).await?;
        Ok(if answer == "yes" {
            Observation::Satisfied(format!("{user} has cluster-admin privileges"))
        } else {
            Observation::Unsatisfiable(format!("{user} does not have cluster-admin privileges"))
        })
    }
}

/// OpenShift SDN must run in NetworkPolicy isolation mode; OVN-Kubernetes
/// supports nothing else. An unset mode is the NetworkPolicy default.
pub struct NetworkPolicyIsolation;

#[async_trait]
impl Predicate for NetworkPolicyIsolation {
    fn name(&self) -> &str {
        "network-policy-isolation"
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        let operator: NetworkOperator = probe
            .read_json(&oc::get_json(NETWORK_OPERATOR, Some(CLUSTER)))
            .await?;
        let default_network = operator.spec.default_network;

        if default_network.type_.as_deref() != Some(NetworkType::OpenShiftSdn.as_str()) {
            return Ok(Observation::Satisfied(format!(
                "isolation mode check not applicable to {}",
                default_network.type_.as_deref().unwrap_or("unknown network type")
            )));
        }

        let mode = default_network
            .openshift_sdn_config
            .and_then(|c| c.mode)
            .filter(|m| !m.is_empty());
        Ok(match mode.as_deref() {
            Some("NetworkPolicy") => {
                Observation::Satisfied("isolation mode is NetworkPolicy".to_string())
            }
            None => {
                warn!("Could not determine the isolation mode, assuming the NetworkPolicy default");
                Observation::Satisfied("isolation mode unset, defaults to NetworkPolicy".to_string())
            }
            Some(other) => Observation::Unsatisfiable(format!(
                "isolation mode is {other}; OVNKubernetes supports only NetworkPolicy"
            )),
        })
    }
}

/// None of `ranges` overlaps a cluster, service or machine network.
pub struct NoCidrConflicts {
    ranges: Vec<Cidr>,
}

impl NoCidrConflicts {
    pub fn new(ranges: Vec<Cidr>) -> Self {
        Self { ranges }
    }
}

#[async_trait]
impl Predicate for NoCidrConflicts {
    fn name(&self) -> &str {
        "no-cidr-conflicts"
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        let config: NetworkConfig = probe
            .read_json(&oc::get_json(NETWORK_CONFIG, Some(CLUSTER)))
            .await?;

        let mut used = Vec::new();
        for range in config.used_ranges() {
            let cidr: Cidr = range
                .parse()
                .map_err(|e| EngineError::Ambiguous(format!("network.config: {e}")))?;
            used.push(cidr);
        }
        if used.is_empty() {
            return Ok(Observation::NotYet("no networks listed in network.config".to_string()));
        }

        let conflicts: Vec<String> = self
            .ranges
            .iter()
            .filter_map(|candidate| {
                used.iter()
                    .find(|u| candidate.overlaps(u))
                    .map(|u| format!("{candidate} overlaps {u}"))
            })
            .collect();

        Ok(if conflicts.is_empty() {
            Observation::Satisfied(format!(
                "no conflicts with {} network(s) in use",
                used.len()
            ))
        } else {
            Observation::Unsatisfiable(format!(
                "conflicting CIDR ranges: {}",
                conflicts.join(", ")
            ))
        })
    }
}

/// Reports the cluster version. Informational; satisfied once readable.
pub struct ClusterVersionKnown;

#[async_trait]
impl Predicate for ClusterVersionKnown {
    fn name(&self) -> &str {
        "cluster-version"
    }

    async fn evaluate(&mut self, probe: &Probe) -> Result<Observation, EngineError> {
        let cv: ClusterVersion = probe
            .read_json(&oc::get_json(CLUSTER_VERSION, Some("version")))
            .await?;
        Ok(match cv.current() {
            Some(entry) => {
                info!(version = %entry.version, "Cluster version");
                Observation::Satisfied(format!(
                    "OpenShift {} ({})",
                    entry.version,
                    entry.state.as_deref().unwrap_or("unknown state")
                ))
            }
            None => Observation::NotYet("cluster version history is empty".to_string()),
        })
    }
}
