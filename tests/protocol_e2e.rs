//! Protocol runs against a scripted `oc`.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use netmig::cluster::NetworkType;
use netmig::error::ErrorKind;
use netmig::exec::{RawOutput, ScriptedExecutor};
use netmig::protocol::{self, ProtocolOptions};
use netmig::retry::RetrySpec;
use netmig::sequencer::{Selection, StepStatus};
use netmig::step::Runtime;

const NETWORK_CONFIG: &str = "network.config.openshift.io";
const NETWORK_OPERATOR: &str = "network.operator.openshift.io";
const CLUSTER_OPERATORS: &str = "clusteroperators.config.openshift.io";
const CLUSTER_VERSION: &str = "clusterversions.config.openshift.io";
const MACHINE_CONFIG_POOLS: &str = "machineconfigpools.machineconfiguration.openshift.io";
const MACHINE_CONFIGS: &str = "machineconfigs.machineconfiguration.openshift.io";
const NODES: [(&str, &str); 5] = [
    ("master-0", "master"),
    ("master-1", "master"),
    ("master-2", "master"),
    ("worker-0", "worker"),
    ("worker-1", "worker"),
];

fn ok(value: Value) -> RawOutput {
    RawOutput::success(value.to_string())
}

fn network_config(network_type: &str, cluster_cidr: &str) -> RawOutput {
    ok(json!({
        "apiVersion": "config.openshift.io/v1",
        "kind": "Network",
        "metadata": {"name": "cluster"},
        "spec": {
            "networkType": network_type,
            "clusterNetwork": [{"cidr": cluster_cidr, "hostPrefix": 23}],
            "serviceNetwork": ["172.30.0.0/16"]
        },
        "status": {
            "networkType": network_type,
            "clusterNetwork": [{"cidr": cluster_cidr, "hostPrefix": 23}],
            "serviceNetwork": ["172.30.0.0/16"]
        }
    }))
}

fn operator_spec(spec: Value) -> RawOutput {
    ok(json!({
        "apiVersion": "operator.openshift.io/v1",
        "kind": "Network",
        "metadata": {"name": "cluster"},
        "spec": spec
    }))
}

fn network_operator(default_network: Value) -> RawOutput {
    operator_spec(json!({"defaultNetwork": default_network}))
}

fn migrating_operator(target: &str, default_network: Value) -> RawOutput {
    operator_spec(json!({
        "migration": {"networkType": target},
        "defaultNetwork": default_network
    }))
}

fn sdn_network() -> Value {
    json!({"type": "OpenShiftSDN", "openshiftSDNConfig": {"mode": "NetworkPolicy"}})
}

fn ovn_network() -> Value {
    json!({"type": "OVNKubernetes", "ovnKubernetesConfig": {}})
}

/// Every node ready and done on `rendered-<role>-1`.
fn cluster_nodes() -> RawOutput {
    let items: Vec<Value> = NODES
        .iter()
        .map(|(name, role)| {
            json!({
                "apiVersion": "v1",
                "kind": "Node",
                "metadata": {
                    "name": name,
                    "labels": { format!("node-role.kubernetes.io/{role}"): "" },
                    "annotations": {
                        "machineconfiguration.openshift.io/currentConfig": format!("rendered-{role}-1"),
                        "machineconfiguration.openshift.io/desiredConfig": format!("rendered-{role}-1"),
                        "machineconfiguration.openshift.io/state": "Done"
                    }
                },
                "status": {"conditions": [{"type": "Ready", "status": "True"}]}
            })
        })
        .collect();
    ok(json!({"apiVersion": "v1", "kind": "List", "items": items}))
}

/// One machine config daemon pod per node.
fn with_agents(mut exec: ScriptedExecutor) -> ScriptedExecutor {
    for (name, _) in NODES {
        let field = format!("spec.nodeName={name}");
        let pods = ok(json!({"apiVersion": "v1", "kind": "List", "items": [{
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": format!("mcd-{name}"), "namespace": "openshift-machine-config-operator"},
            "spec": {"nodeName": name, "containers": [{"name": "machine-config-daemon"}]},
            "status": {"phase": "Running"}
        }]}));
        exec = exec.on(&["get", "pods", field.as_str()], [pods]);
    }
    exec
}

fn pools(updating: bool) -> RawOutput {
    let s = |b: bool| if b { "True" } else { "False" };
    let items: Vec<Value> = ["master", "worker"]
        .iter()
        .map(|name| {
            json!({
                "apiVersion": "machineconfiguration.openshift.io/v1",
                "kind": "MachineConfigPool",
                "metadata": {"name": name},
                "spec": {"paused": false},
                "status": {"conditions": [
                    {"type": "Updated", "status": s(!updating)},
                    {"type": "Updating", "status": s(updating)},
                    {"type": "Degraded", "status": "False"}
                ]}
            })
        })
        .collect();
    ok(json!({"apiVersion": "v1", "kind": "List", "items": items}))
}

fn paused_pool(name: &str, paused: bool) -> RawOutput {
    ok(json!({
        "apiVersion": "machineconfiguration.openshift.io/v1",
        "kind": "MachineConfigPool",
        "metadata": {"name": name},
        "spec": {"paused": paused}
    }))
}

fn rendered_config(network_type: &str) -> RawOutput {
    ok(json!({
        "apiVersion": "machineconfiguration.openshift.io/v1",
        "kind": "MachineConfig",
        "spec": {"config": {"systemd": {"units": [{
            "name": "ovs-configuration.service",
            "contents": format!("[Service]\nExecStart=/usr/local/bin/configure-ovs.sh {network_type}\n")
        }]}}}
    }))
}

fn network_progressing() -> RawOutput {
    ok(json!({
        "apiVersion": "config.openshift.io/v1",
        "kind": "ClusterOperator",
        "metadata": {"name": "network"},
        "status": {"conditions": [
            {"type": "Available", "status": "True"},
            {"type": "Progressing", "status": "True"},
            {"type": "Degraded", "status": "False"}
        ]}
    }))
}

fn multus_rolled_out() -> RawOutput {
    ok(json!({
        "apiVersion": "apps/v1",
        "kind": "DaemonSet",
        "metadata": {"name": "multus", "namespace": "openshift-multus", "generation": 2},
        "status": {
            "observedGeneration": 2,
            "desiredNumberScheduled": 5,
            "currentNumberScheduled": 5,
            "numberMisscheduled": 0,
            "numberReady": 5,
            "updatedNumberScheduled": 5,
            "numberAvailable": 5
        }
    }))
}

/// A cluster that converges on every step of a protocol run. Reads of the
/// network config, network operator and machine config pools answer from
/// the given sequences.
fn converging_cluster(
    network_configs: Vec<RawOutput>,
    operators: Vec<RawOutput>,
    pool_lists: Vec<RawOutput>,
    rendered_for: &str,
) -> ScriptedExecutor {
    with_agents(ScriptedExecutor::new())
        .on(&["patch"], [RawOutput::success("patched")])
        .on(&["rsh"], [RawOutput::success("")])
        .on(&["delete"], [RawOutput::success("deleted")])
        .on(&["version", "--client"], [RawOutput::success("Client Version: 4.16.8")])
        .on(&["whoami"], [RawOutput::success("system:admin")])
        .on(
            &["get", CLUSTER_VERSION],
            [ok(json!({"status": {"history": [{"version": "4.16.8", "state": "Completed"}]}}))],
        )
        .on(&["get", NETWORK_CONFIG], network_configs)
        .on(&["get", NETWORK_OPERATOR], operators)
        .on(&["get", MACHINE_CONFIG_POOLS, "master"], [paused_pool("master", true), paused_pool("master", false)])
        .on(&["get", MACHINE_CONFIG_POOLS, "worker"], [paused_pool("worker", true), paused_pool("worker", false)])
        .on(&["get", MACHINE_CONFIG_POOLS], pool_lists)
        .on(&["get", MACHINE_CONFIGS], [rendered_config(rendered_for)])
        .on(&["get", "nodes"], [cluster_nodes()])
        .on(&["get", CLUSTER_OPERATORS, "network"], [network_progressing()])
        .on(&["get", CLUSTER_OPERATORS], [healthy_operators(&["dns", "network", "kube-apiserver"])])
        .on(&["daemonsets", "multus"], [multus_rolled_out()])
        .on(&["get", "namespace"], [RawOutput::success("")])
}

/// Mutating calls in the order they were made.
fn mutations(exec: &ScriptedExecutor) -> Vec<String> {
    exec.calls()
        .iter()
        .filter_map(|call| match call.args.first().map(String::as_str) {
            Some("patch" | "delete") => Some(format!("{} {}/{}", call.args[0], call.args[1], call.args[2])),
            Some("rsh") => Some(format!("rsh {} {}", call.args[3], call.args[8])),
            _ => None,
        })
        .collect()
}

fn healthy_operators(names: &[&str]) -> RawOutput {
    let items: Vec<Value> = names
        .iter()
        .map(|name| {
            json!({
                "apiVersion": "config.openshift.io/v1",
                "kind": "ClusterOperator",
                "metadata": {"name": name},
                "status": {"conditions": [
                    {"type": "Available", "status": "True"},
                    {"type": "Progressing", "status": "False"},
                    {"type": "Degraded", "status": "False"}
                ]}
            })
        })
        .collect();
    ok(json!({"apiVersion": "v1", "kind": "List", "items": items}))
}

/// A logged-in admin on an SDN cluster using `cluster_cidr`.
fn sdn_cluster(cluster_cidr: &str) -> ScriptedExecutor {
    ScriptedExecutor::new()
        .on(&["version", "--client"], [RawOutput::success("Client Version: 4.16.8")])
        .on(&["whoami"], [RawOutput::success("system:admin")])
        .on(&[NETWORK_CONFIG], [network_config("OpenShiftSDN", cluster_cidr)])
        .on(
            &[NETWORK_OPERATOR],
            [network_operator(json!({
                "type": "OpenShiftSDN",
                "openshiftSDNConfig": {"mode": "NetworkPolicy"}
            }))],
        )
        .on(
            &[CLUSTER_VERSION],
            [ok(json!({"status": {"history": [{"version": "4.16.8", "state": "Completed"}]}}))],
        )
}

fn runtime(exec: &Arc<ScriptedExecutor>) -> Runtime {
    Runtime::new(exec.clone(), CancellationToken::new())
        .with_read_retry(RetrySpec::once())
        .with_write_retry(RetrySpec::once())
}

#[tokio::test(start_paused = true)]
async fn test_preflight_passes_on_sdn_cluster() {
    let exec = Arc::new(sdn_cluster("10.128.0.0/14"));
    let mut sequence = protocol::preflight(NetworkType::OvnKubernetes, &ProtocolOptions::default()).unwrap();

    let report = sequence.run(&runtime(&exec), &Selection::default()).await.unwrap();

    assert_eq!(report.steps.len(), 6);
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Succeeded));
    assert!(report.steps.iter().all(|s| s.result.as_ref().is_some_and(|r| !r.changed)));
    assert!(exec.calls_matching(&["patch"]).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_migration_stops_at_cidr_conflict() {
    let exec = Arc::new(sdn_cluster("100.64.0.0/14"));
    let mut sequence = protocol::migration(&ProtocolOptions::default()).unwrap();

    let failure = sequence.run(&runtime(&exec), &Selection::default()).await.unwrap_err();

    assert_eq!(failure.step, "check-cidr-ranges");
    assert_eq!(failure.kind, ErrorKind::Unsatisfiable);
    assert!(failure.message.contains("100.64.0.0/14"), "{}", failure.message);
    assert_eq!(failure.report.steps.len(), 5);
    assert!(exec.calls_matching(&["patch"]).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_migration_refuses_cluster_already_on_ovn() {
    let exec = Arc::new(
        ScriptedExecutor::new()
            .on(&["version", "--client"], [RawOutput::success("Client Version: 4.16.8")])
            .on(&["whoami"], [RawOutput::success("system:admin")])
            .on(&[NETWORK_CONFIG], [network_config("OVNKubernetes", "10.128.0.0/14")]),
    );
    let mut sequence = protocol::migration(&ProtocolOptions::default()).unwrap();

    let failure = sequence.run(&runtime(&exec), &Selection::default()).await.unwrap_err();

    assert_eq!(failure.step, "check-network-type");
    assert_eq!(failure.kind, ErrorKind::Unsatisfiable);
}

fn reboots() -> Vec<String> {
    [
        ("master-0", "+1"),
        ("master-1", "+4"),
        ("master-2", "+7"),
        ("worker-0", "+1"),
        ("worker-1", "+1"),
    ]
    .iter()
    .map(|(node, delay)| format!("rsh mcd-{node} {delay}"))
    .collect()
}

#[tokio::test(start_paused = true)]
async fn test_full_migration_mutates_in_order() {
    let exec = Arc::new(converging_cluster(
        vec![
            network_config("OpenShiftSDN", "10.128.0.0/14"),
            network_config("OpenShiftSDN", "10.128.0.0/14"),
            network_config("OVNKubernetes", "10.128.0.0/14"),
        ],
        vec![
            network_operator(sdn_network()),
            migrating_operator("OVNKubernetes", sdn_network()),
            network_operator(ovn_network()),
        ],
        vec![pools(true), pools(false)],
        "OVNKubernetes",
    ));
    let mut sequence = protocol::migration(&ProtocolOptions::default()).unwrap();

    let report = sequence.run(&runtime(&exec), &Selection::default()).await.unwrap();

    assert_eq!(report.steps.len(), sequence.names().len());
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Succeeded));
    let operator = format!("patch {NETWORK_OPERATOR}/cluster");
    let mut expected = vec![operator.clone(), format!("patch {NETWORK_CONFIG}/cluster")];
    expected.extend(reboots());
    expected.extend([operator.clone(), operator, "delete namespace/openshift-sdn".to_string()]);
    assert_eq!(mutations(&exec), expected);

    let set_migration = &exec.calls_matching(&["patch", NETWORK_OPERATOR])[0];
    assert_eq!(
        set_migration.args.last().map(String::as_str),
        Some(r#"{"spec":{"migration":{"networkType":"OVNKubernetes"}}}"#)
    );
}

#[tokio::test(start_paused = true)]
async fn test_full_rollback_keeps_pools_paused_across_reboots() {
    let exec = Arc::new(converging_cluster(
        vec![
            network_config("OVNKubernetes", "10.128.0.0/14"),
            network_config("OpenShiftSDN", "10.128.0.0/14"),
        ],
        vec![
            migrating_operator("OpenShiftSDN", ovn_network()),
            network_operator(sdn_network()),
        ],
        vec![pools(false)],
        "OpenShiftSDN",
    ));
    let mut sequence = protocol::rollback(&ProtocolOptions::default()).unwrap();

    let report = sequence.run(&runtime(&exec), &Selection::default()).await.unwrap();

    assert!(report.steps.iter().all(|s| s.status == StepStatus::Succeeded));
    let master_pool = format!("patch {MACHINE_CONFIG_POOLS}/master");
    let worker_pool = format!("patch {MACHINE_CONFIG_POOLS}/worker");
    let operator = format!("patch {NETWORK_OPERATOR}/cluster");
    let mut expected = vec![
        master_pool.clone(),
        worker_pool.clone(),
        operator.clone(),
        format!("patch {NETWORK_CONFIG}/cluster"),
    ];
    expected.extend(reboots());
    expected.extend([
        master_pool,
        worker_pool,
        operator.clone(),
        operator,
        "delete namespace/openshift-ovn-kubernetes".to_string(),
    ]);
    assert_eq!(mutations(&exec), expected);

    let pool_payloads: Vec<String> = exec
        .calls_matching(&["patch", MACHINE_CONFIG_POOLS])
        .iter()
        .filter_map(|c| c.args.last().cloned())
        .collect();
    assert_eq!(
        pool_payloads,
        [
            r#"{"spec":{"paused":true}}"#,
            r#"{"spec":{"paused":true}}"#,
            r#"{"spec":{"paused":false}}"#,
            r#"{"spec":{"paused":false}}"#,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_resume_migration_after_rollout_finished() {
    let exec = Arc::new(converging_cluster(
        vec![network_config("OVNKubernetes", "10.128.0.0/14")],
        vec![
            migrating_operator("OVNKubernetes", sdn_network()),
            network_operator(ovn_network()),
        ],
        vec![pools(false)],
        "OVNKubernetes",
    ));
    let mut sequence = protocol::migration(&ProtocolOptions::default()).unwrap();
    let selection = Selection {
        from: Some("set-migration".to_string()),
        skip: Vec::new(),
    };

    let report = sequence.run(&runtime(&exec), &selection).await.unwrap();

    let updating = report
        .steps
        .iter()
        .find(|s| s.name == "wait-mco-updating")
        .and_then(|s| s.result.as_ref())
        .unwrap();
    assert!(updating.success);
    assert!(updating.message.starts_with("rollout already complete"), "{}", updating.message);
    assert!(report
        .steps
        .iter()
        .all(|s| matches!(s.status, StepStatus::Succeeded | StepStatus::Skipped)));
    assert_eq!(exec.calls_matching(&["rsh"]).len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_resume_migration_cleanup() {
    let exec = Arc::new(
        ScriptedExecutor::new()
            .on(&["patch", NETWORK_OPERATOR], [RawOutput::success("network.operator.openshift.io/cluster patched")])
            .on(&["delete", "namespace"], [RawOutput::success("namespace \"openshift-sdn\" deleted")])
            .on(&["get", "namespace"], [RawOutput::success("")])
            .on(&[NETWORK_CONFIG], [network_config("OVNKubernetes", "10.128.0.0/14")])
            .on(
                &[NETWORK_OPERATOR],
                [network_operator(json!({"type": "OVNKubernetes", "ovnKubernetesConfig": {}}))],
            )
            .on(&[CLUSTER_OPERATORS], [healthy_operators(&["dns", "network", "kube-apiserver"])]),
    );
    let mut sequence = protocol::migration(&ProtocolOptions::default()).unwrap();
    let selection = Selection {
        from: Some("wait-network-type".to_string()),
        skip: Vec::new(),
    };

    let report = sequence.run(&runtime(&exec), &selection).await.unwrap();

    let run: Vec<&str> = report
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Succeeded)
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(
        run,
        [
            "wait-network-type",
            "wait-cluster-operators",
            "clear-migration",
            "remove-sdn-config",
            "delete-sdn-namespace",
        ]
    );
    assert_eq!(report.steps.len(), sequence.names().len());
    assert_eq!(exec.calls_matching(&["patch", NETWORK_OPERATOR]).len(), 2);
    assert_eq!(exec.calls_matching(&["delete", "namespace", "openshift-sdn"]).len(), 1);
    assert_eq!(exec.calls_matching(&["get", CLUSTER_OPERATORS]).len(), 3);
    assert!(exec.calls_matching(&["rsh"]).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_cleanup_changes_nothing() {
    let exec = Arc::new(
        ScriptedExecutor::new()
            .on(&["get", "namespace"], [RawOutput::success("namespace/openshift-sdn")])
            .on(&[NETWORK_CONFIG], [network_config("OpenShiftSDN", "10.128.0.0/14")])
            .on(
                &[NETWORK_OPERATOR],
                [network_operator(json!({
                    "type": "OpenShiftSDN",
                    "openshiftSDNConfig": {"mode": "NetworkPolicy"}
                }))],
            )
            .on(&[CLUSTER_OPERATORS], [healthy_operators(&["network"])]),
    );
    let rt = runtime(&exec).with_dry_run(true);
    let mut sequence = protocol::migration(&ProtocolOptions::default()).unwrap();
    let selection = Selection {
        from: Some("wait-network-type".to_string()),
        skip: Vec::new(),
    };

    let report = sequence.run(&rt, &selection).await.unwrap();

    assert!(report.dry_run);
    assert!(report
        .steps
        .iter()
        .filter_map(|s| s.result.as_ref())
        .all(|r| !r.changed));
    assert!(exec.calls_matching(&["patch"]).is_empty());
    assert!(exec.calls_matching(&["delete"]).is_empty());
}

#[tokio::test]
async fn test_unknown_step_rejected_before_any_call() {
    let exec = Arc::new(ScriptedExecutor::new());
    let mut sequence = protocol::rollback(&ProtocolOptions::default()).unwrap();
    let selection = Selection {
        from: None,
        skip: vec!["reboot-everything".to_string()],
    };

    let failure = sequence.run(&runtime(&exec), &selection).await.unwrap_err();

    assert_eq!(failure.kind, ErrorKind::InvalidSpec);
    assert!(failure.message.contains("reboot-everything"));
    assert!(exec.calls().is_empty());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let exec = Arc::new(sdn_cluster("10.128.0.0/14"));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let rt = Runtime::new(exec.clone(), cancel);
    let mut sequence = protocol::preflight(NetworkType::OvnKubernetes, &ProtocolOptions::default()).unwrap();

    let failure = sequence.run(&rt, &Selection::default()).await.unwrap_err();

    assert_eq!(failure.kind, ErrorKind::Cancelled);
    assert_eq!(failure.step, "check-oc-client");
    assert!(exec.calls().is_empty());
}
