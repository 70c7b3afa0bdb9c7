//! Argument builders for `oc` operations.

use serde_json::Value;

use crate::error::FailureKind;
use crate::exec::{Operation, RawOutput, classify_absent_ok, classify_default};

pub const NETWORK_CONFIG: &str = "network.config.openshift.io";
pub const NETWORK_OPERATOR: &str = "network.operator.openshift.io";
pub const CLUSTER_OPERATORS: &str = "clusteroperators.config.openshift.io";
pub const MACHINE_CONFIG_POOLS: &str = "machineconfigpools.machineconfiguration.openshift.io";
pub const MACHINE_CONFIGS: &str = "machineconfigs.machineconfiguration.openshift.io";
pub const CLUSTER_VERSION: &str = "clusterversions.config.openshift.io";
pub const NNCP: &str = "nodenetworkconfigurationpolicies.nmstate.io";

/// Name of the singleton network resources.
pub const CLUSTER: &str = "cluster";

/// `oc get <kind> [<name>] -o json`
pub fn get_json(kind: &str, name: Option<&str>) -> Operation {
    let mut args = vec!["get".to_string(), kind.to_string()];
    if let Some(name) = name {
        args.push(name.to_string());
    }
    args.extend(["-o".to_string(), "json".to_string()]);
    Operation::oc(args)
}

/// `oc get <kind> <name> -n <namespace> -o json`
pub fn get_json_in(namespace: &str, kind: &str, name: &str) -> Operation {
    Operation::oc(["get", kind, name, "-n", namespace, "-o", "json"])
}

/// `oc get <kind> <name> -o name`; empty output when the object is absent.
pub fn get_name(kind: &str, name: &str) -> Operation {
    Operation::oc(["get", kind, name, "-o", "name"]).with_classifier(classify_absent_ok)
}

pub fn nodes() -> Operation {
    get_json("nodes", None)
}

/// Pods of the node agent running on `node`.
pub fn agent_pods(namespace: &str, selector: &str, node: &str) -> Operation {
    Operation::oc([
        "get".to_string(),
        "pods".to_string(),
        "-n".to_string(),
        namespace.to_string(),
        "-l".to_string(),
        selector.to_string(),
        "--field-selector".to_string(),
        format!("spec.nodeName={node}"),
        "-o".to_string(),
        "json".to_string(),
    ])
}

/// Schedule a reboot from inside the node agent pod, `minutes` from now.
///
/// Never `now`: the exec session has to return before the node goes down.
/// Zero is raised to one minute.
pub fn reboot_via_agent(namespace: &str, pod: &str, minutes: u32) -> Operation {
    let when = format!("+{}", minutes.max(1));
    Operation::oc([
        "rsh".to_string(),
        "-n".to_string(),
        namespace.to_string(),
        pod.to_string(),
        "chroot".to_string(),
        "/rootfs".to_string(),
        "shutdown".to_string(),
        "-r".to_string(),
        when,
    ])
}

/// `oc patch <kind> <name> --type=merge --patch <json>`
pub fn patch_merge(kind: &str, name: &str, patch: &Value) -> Operation {
    Operation::oc([
        "patch".to_string(),
        kind.to_string(),
        name.to_string(),
        "--type=merge".to_string(),
        "--patch".to_string(),
        patch.to_string(),
    ])
}

/// Deletes `kind/name`; already absent counts as done.
pub fn delete(kind: &str, name: &str) -> Operation {
    Operation::oc(["delete", kind, name, "--ignore-not-found"]).with_classifier(classify_absent_ok)
}

/// `oc get crd <name> -o name`; empty output when the CRD is absent.
pub fn crd_lookup(name: &str) -> Operation {
    Operation::oc(["get", "crd", name, "-o", "name"]).with_classifier(classify_absent_ok)
}

pub fn whoami() -> Operation {
    Operation::oc(["whoami"])
}

/// `oc auth can-i` exits 1 when the answer is `no`.
fn classify_answer(raw: &RawOutput) -> Result<String, FailureKind> {
    if raw.status == Some(1) && raw.stdout.trim() == "no" {
        return Ok("no".to_string());
    }
    classify_default(raw)
}

/// Answers `yes` when the user may do anything anywhere.
pub fn can_i_everything() -> Operation {
    Operation::oc(["auth", "can-i", "*", "*", "--all-namespaces"]).with_classifier(classify_answer)
}

pub fn client_version() -> Operation {
    Operation::oc(["version", "--client"])
}
