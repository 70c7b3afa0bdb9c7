//! JSON merge-patch payloads for the network migration.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::NetworkType;

/// Features the network operator migrates along with the plugin.
///
/// Each flag left `None` keeps the operator default (migrate).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MigrationFeatures {
    #[serde(rename = "egressIP")]
    pub egress_ip: Option<bool>,
    pub egress_firewall: Option<bool>,
    pub multicast: Option<bool>,
}

impl MigrationFeatures {
    pub const fn is_default(&self) -> bool {
        self.egress_ip.is_none() && self.egress_firewall.is_none() && self.multicast.is_none()
    }

    fn to_value(self) -> Value {
        let mut features = Map::new();
        for (key, value) in [
            ("egressIP", self.egress_ip),
            ("egressFirewall", self.egress_firewall),
            ("multicast", self.multicast),
        ] {
            if let Some(enabled) = value {
                features.insert(key.to_string(), Value::Bool(enabled));
            }
        }
        Value::Object(features)
    }
}

/// Plugin settings applied to the target provider before switching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProviderSettings {
    pub mtu: Option<u32>,
    /// OVN-Kubernetes only.
    pub geneve_port: Option<u16>,
    /// OVN-Kubernetes only.
    pub v4_internal_subnet: Option<String>,
    /// OpenShift SDN only.
    pub vxlan_port: Option<u16>,
}

impl ProviderSettings {
    pub fn is_empty(&self) -> bool {
        self.mtu.is_none()
            && self.geneve_port.is_none()
            && self.v4_internal_subnet.is_none()
            && self.vxlan_port.is_none()
    }
}

/// `spec.migration` on `network.operator/cluster`.
pub fn set_migration(target: NetworkType, features: MigrationFeatures) -> Value {
    let mut migration = json!({ "networkType": target.as_str() });
    if !features.is_default() {
        migration["features"] = features.to_value();
    }
    json!({ "spec": { "migration": migration } })
}

pub fn clear_migration() -> Value {
    json!({ "spec": { "migration": null } })
}

/// `spec.networkType` on `network.config/cluster`; starts the actual switch.
pub fn set_network_type(target: NetworkType) -> Value {
    json!({ "spec": { "networkType": target.as_str() } })
}

/// Settings for `provider` under `spec.defaultNetwork`, ignoring fields that
/// do not apply to it. `None` when nothing applies.
pub fn provider_settings(provider: NetworkType, settings: &ProviderSettings) -> Option<Value> {
    let mut config = Map::new();
    if let Some(mtu) = settings.mtu {
        config.insert("mtu".to_string(), json!(mtu));
    }
    match provider {
        NetworkType::OvnKubernetes => {
            if let Some(port) = settings.geneve_port {
                config.insert("genevePort".to_string(), json!(port));
            }
            if let Some(subnet) = &settings.v4_internal_subnet {
                config.insert("v4InternalSubnet".to_string(), json!(subnet));
            }
        }
        NetworkType::OpenShiftSdn => {
            if let Some(port) = settings.vxlan_port {
                config.insert("vxlanPort".to_string(), json!(port));
            }
        }
    }

    if config.is_empty() {
        return None;
    }
    Some(json!({
        "spec": { "defaultNetwork": { provider.config_key(): Value::Object(config) } }
    }))
}

/// Drops the settings block of a plugin that is no longer in use.
pub fn remove_provider_config(provider: NetworkType) -> Value {
    json!({ "spec": { "defaultNetwork": { provider.config_key(): null } } })
}

pub fn pause_pool(paused: bool) -> Value {
    json!({ "spec": { "paused": paused } })
}
