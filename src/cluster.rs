//! OpenShift network migration vocabulary: resources, payloads and checks.

pub mod checks;
pub mod cidr;
pub mod model;
pub mod oc;
pub mod patch;
pub mod preflight;

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Cluster default network plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum NetworkType {
    #[value(name = "OVNKubernetes", alias = "ovn")]
    #[serde(rename = "OVNKubernetes")]
    OvnKubernetes,
    #[value(name = "OpenShiftSDN", alias = "sdn")]
    #[serde(rename = "OpenShiftSDN")]
    OpenShiftSdn,
}

impl NetworkType {
    /// Name as written in `networkType` fields.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OvnKubernetes => "OVNKubernetes",
            Self::OpenShiftSdn => "OpenShiftSDN",
        }
    }

    /// Key of this plugin's settings under `spec.defaultNetwork`.
    pub const fn config_key(self) -> &'static str {
        match self {
            Self::OvnKubernetes => "ovnKubernetesConfig",
            Self::OpenShiftSdn => "openshiftSDNConfig",
        }
    }

    /// Namespace the plugin's pods run in.
    pub const fn namespace(self) -> &'static str {
        match self {
            Self::OvnKubernetes => "openshift-ovn-kubernetes",
            Self::OpenShiftSdn => "openshift-sdn",
        }
    }

    pub const fn other(self) -> Self {
        match self {
            Self::OvnKubernetes => Self::OpenShiftSdn,
            Self::OpenShiftSdn => Self::OvnKubernetes,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OVNKubernetes" => Some(Self::OvnKubernetes),
            "OpenShiftSDN" => Some(Self::OpenShiftSdn),
            _ => None,
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_type_names() {
        assert_eq!(NetworkType::OvnKubernetes.to_string(), "OVNKubernetes");
        assert_eq!(NetworkType::OpenShiftSdn.config_key(), "openshiftSDNConfig");
        assert_eq!(NetworkType::OpenShiftSdn.other(), NetworkType::OvnKubernetes);
        assert_eq!(NetworkType::parse("OpenShiftSDN"), Some(NetworkType::OpenShiftSdn));
        assert_eq!(NetworkType::parse("Calico"), None);
    }

    #[test]
    fn test_network_type_serde_uses_cluster_names() {
        let json = serde_json::to_string(&NetworkType::OvnKubernetes).unwrap();
        assert_eq!(json, "\"OVNKubernetes\"");
        let parsed: NetworkType = serde_yaml::from_str("OpenShiftSDN").unwrap();
        assert_eq!(parsed, NetworkType::OpenShiftSdn);
    }

    #[test]
    fn test_network_type_cli_aliases() {
        assert_eq!(
            NetworkType::from_str("ovn", true).unwrap(),
            NetworkType::OvnKubernetes
        );
        assert_eq!(
            NetworkType::from_str("OpenShiftSDN", false).unwrap(),
            NetworkType::OpenShiftSdn
        );
    }
}
