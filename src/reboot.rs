//! Rolling node reboots through the per-node machine config agent.
//!
//! Nodes of one role are rebooted by scheduling `shutdown -r` inside the
//! agent pod on each node. Control plane reboots are staggered so that the
//! nodes go down one at a time; the cluster is then polled until every node
//! reports Ready again.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Pod};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cluster::checks::{AllNodesReady, node_name, node_ready};
use crate::cluster::model::ItemList;
use crate::cluster::oc;
use crate::error::EngineError;
use crate::poll::{ConditionPoller, Deadline, Probe};
use crate::retry::pause;
use crate::step::{Runtime, StepResult};

const ROLE_LABEL_PREFIX: &str = "node-role.kubernetes.io/";

/// Which nodes a reboot run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRole {
    /// Control plane nodes (`master` or `control-plane` label).
    Master,
    /// Every node that is not control plane.
    Worker,
    /// Nodes carrying `node-role.kubernetes.io/<name>`.
    Custom(String),
}

impl NodeRole {
    pub const fn is_control_plane(&self) -> bool {
        matches!(self, Self::Master)
    }

    pub fn matches(&self, node: &Node) -> bool {
        let has = |role: &str| {
            node.metadata
                .labels
                .as_ref()
                .is_some_and(|labels| labels.contains_key(&format!("{ROLE_LABEL_PREFIX}{role}")))
        };
        let control_plane = has("master") || has("control-plane");
        match self {
            Self::Master => control_plane,
            Self::Worker => !control_plane,
            Self::Custom(role) => has(role.as_str()),
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => f.write_str("master"),
            Self::Worker => f.write_str("worker"),
            Self::Custom(role) => f.write_str(role),
        }
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err("node role must not be empty".to_string()),
            "master" | "control-plane" => Ok(Self::Master),
            "worker" => Ok(Self::Worker),
            other if other.contains(char::is_whitespace) || other.contains('/') => {
                Err(format!("invalid node role `{other}`"))
            }
            other => Ok(Self::Custom(other.to_string())),
        }
    }
}

/// A node as read at the start of a reboot run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: String,
    pub role: NodeRole,
    pub ready: bool,
}

/// Where the per-node agent pods live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLocator {
    pub namespace: String,
    pub selector: String,
}

impl Default for AgentLocator {
    fn default() -> Self {
        Self {
            namespace: "openshift-machine-config-operator".to_string(),
            selector: "k8s-app=machine-config-daemon".to_string(),
        }
    }
}

/// Reboot delays, in minutes, handed to `shutdown -r`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaggerPolicy {
    pub initial_minutes: u32,
    pub step_minutes: u32,
    /// Workers all reboot one minute out unless this is set.
    pub stagger_workers: bool,
}

/// `shutdown -r` is never scheduled sooner than this.
pub const MIN_REBOOT_DELAY_MINUTES: u32 = 1;

impl Default for StaggerPolicy {
    fn default() -> Self {
        Self {
            initial_minutes: 1,
            step_minutes: 3,
            stagger_workers: false,
        }
    }
}

impl StaggerPolicy {
    /// Delay for each of `count` nodes, in issue order.
    ///
    /// Control plane delays are strictly increasing so that members go down
    /// one at a time. No delay is below [`MIN_REBOOT_DELAY_MINUTES`].
    pub fn delays(&self, role: &NodeRole, count: usize) -> Result<Vec<u32>, EngineError> {
        if !role.is_control_plane() && !self.stagger_workers {
            return Ok(vec![MIN_REBOOT_DELAY_MINUTES; count]);
        }
        if role.is_control_plane() && self.step_minutes == 0 {
            return Err(EngineError::InvalidSpec(
                "control plane reboots need a stagger step of at least one minute".to_string(),
            ));
        }

        (0..count)
            .map(|i| {
                u32::try_from(i)
                    .ok()
                    .and_then(|i| i.checked_mul(self.step_minutes))
                    .and_then(|offset| offset.checked_add(self.initial_minutes.max(MIN_REBOOT_DELAY_MINUTES)))
                    .ok_or_else(|| EngineError::InvalidSpec("reboot delay overflows".to_string()))
            })
            .collect()
    }
}

pub const DEFAULT_UNREACHABLE_GRACE: Duration = Duration::from_secs(180);
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(1800);

/// Reboots every node of one role and waits for the cluster to recover.
#[derive(Debug, Clone)]
pub struct RollingReboot {
    name: String,
    role: NodeRole,
    agent: AgentLocator,
    stagger: StaggerPolicy,
    unreachable_grace: Duration,
    readiness_timeout: Duration,
    poll_interval: Duration,
}

impl RollingReboot {
    pub fn new(role: NodeRole) -> Self {
        Self {
            name: format!("reboot-{role}-nodes"),
            role,
            agent: AgentLocator::default(),
            stagger: StaggerPolicy::default(),
            unreachable_grace: DEFAULT_UNREACHABLE_GRACE,
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            poll_interval: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_agent(mut self, agent: AgentLocator) -> Self {
        self.agent = agent;
        self
    }

    #[must_use]
    pub const fn with_stagger(mut self, stagger: StaggerPolicy) -> Self {
        self.stagger = stagger;
        self
    }

    #[must_use]
    pub const fn with_unreachable_grace(mut self, grace: Duration) -> Self {
        self.unreachable_grace = grace;
        self
    }

    #[must_use]
    pub const fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn role(&self) -> &NodeRole {
        &self.role
    }

    pub const fn readiness_timeout(&self) -> Duration {
        self.readiness_timeout
    }

    /// Nodes of this role, sorted by name. Always a fresh read.
    pub async fn list_nodes(&self, probe: &Probe) -> Result<Vec<NodeRecord>, EngineError> {
        let nodes: ItemList<Node> = probe.read_json(&oc::nodes()).await?;
        let mut records: Vec<NodeRecord> = nodes
            .items
            .iter()
            .filter(|n| self.role.matches(n))
            .map(|n| NodeRecord {
                name: node_name(n).to_string(),
                role: self.role.clone(),
                ready: node_ready(n),
            })
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Name of the agent pod scheduled on `node`.
    async fn agent_pod(&self, probe: &Probe, node: &str) -> Result<String, EngineError> {
        let pods: ItemList<Pod> = probe
            .read_json(&oc::agent_pods(&self.agent.namespace, &self.agent.selector, node))
            .await?;

        let on_node = |pod: &Pod| {
            pod.spec
                .as_ref()
                .and_then(|s| s.node_name.as_deref())
                == Some(node)
        };
        let running = |pod: &Pod| {
            pod.status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                == Some("Running")
        };

        let candidates: Vec<&Pod> = pods.items.iter().filter(|p| on_node(*p)).collect();
        candidates
            .iter()
            .copied()
            .find(|p| running(*p))
            .or_else(|| candidates.first().copied())
            .and_then(|pod| pod.metadata.name.clone())
            .ok_or_else(|| {
                EngineError::Fatal(format!(
                    "no pod matching {} in {} on node {node}",
                    self.agent.selector, self.agent.namespace
                ))
            })
    }

    pub async fn run(&self, rt: &Runtime) -> StepResult {
        let start = Instant::now();
        let probe = rt.probe();
        let mut attempts = 1;

        let nodes = match self.list_nodes(&probe).await {
            Ok(nodes) => nodes,
            Err(e) => return StepResult::failed(e, false, attempts, start.elapsed()),
        };
        if nodes.is_empty() {
            warn!(role = %self.role, "No nodes found for role, nothing to reboot");
            return StepResult::succeeded(
                format!("no {} nodes found", self.role),
                false,
                attempts,
                start.elapsed(),
            );
        }

        let delays = match self.stagger.delays(&self.role, nodes.len()) {
            Ok(delays) => delays,
            Err(e) => return StepResult::failed(e, false, attempts, start.elapsed()),
        };

        let not_ready: Vec<&str> = nodes
            .iter()
            .filter(|n| !n.ready)
            .map(|n| n.name.as_str())
            .collect();
        if !not_ready.is_empty() {
            warn!(role = %self.role, "Nodes already not ready before reboot: {}", not_ready.join(", "));
        }

        let mut issued = 0;
        for (node, &minutes) in nodes.iter().zip(&delays) {
            let issue_failed = |e: EngineError| match e {
                EngineError::Cancelled => EngineError::Cancelled,
                other => EngineError::RebootIssueFailed {
                    node: node.name.clone(),
                    reason: other.to_string(),
                },
            };

            attempts += 1;
            let pod = match self.agent_pod(&probe, &node.name).await {
                Ok(pod) => pod,
                Err(e) => {
                    return StepResult::failed(issue_failed(e), issued > 0, attempts, start.elapsed());
                }
            };

            info!(node = %node.name, pod = %pod, delay_minutes = minutes, "Scheduling reboot");
            let (result, used) = rt
                .apply(&oc::reboot_via_agent(&self.agent.namespace, &pod, minutes))
                .await;
            attempts += used;
            if let Err(e) = result {
                warn!(node = %node.name, "Failed to schedule reboot: {}", e);
                return StepResult::failed(issue_failed(e), issued > 0, attempts, start.elapsed());
            }
            issued += 1;
        }

        let changed = issued > 0 && !rt.is_dry_run();
        let last_delay = delays.last().copied().unwrap_or(0);

        let readiness_timeout = if rt.is_dry_run() {
            Duration::ZERO
        } else {
            let unreachable = Duration::from_secs(u64::from(last_delay) * 60) + self.unreachable_grace;
            info!(
                role = %self.role,
                rebooted = issued,
                wait_secs = unreachable.as_secs(),
                "Reboots scheduled, waiting for nodes to go down"
            );
            if let Err(e) = pause(unreachable, rt.cancel()).await {
                return StepResult::failed(e, changed, attempts, start.elapsed());
            }
            self.readiness_timeout
        };

        let poller = ConditionPoller::new(self.poll_interval);
        let mut ready = AllNodesReady;
        match poller
            .wait_until(&mut ready, &probe, Deadline::after(readiness_timeout))
            .await
        {
            Ok(outcome) => StepResult::succeeded(
                format!(
                    "{} {issued} {} node(s); {}",
                    if rt.is_dry_run() { "would reboot" } else { "rebooted" },
                    self.role,
                    outcome.detail
                ),
                changed,
                attempts + outcome.evaluations,
                start.elapsed(),
            ),
            Err(EngineError::Timeout { evaluations, .. }) if rt.is_dry_run() => {
                StepResult::succeeded(
                    format!("would reboot {issued} {} node(s)", self.role),
                    false,
                    attempts + evaluations,
                    start.elapsed(),
                )
            }
            Err(EngineError::Timeout {
                evaluations,
                last_observation,
                ..
            }) => StepResult::failed(
                EngineError::RecoveryTimeout {
                    rebooted: issued,
                    reason: last_observation.unwrap_or_else(|| "no observation".to_string()),
                },
                changed,
                attempts + evaluations,
                start.elapsed(),
            ),
            Err(e @ EngineError::Cancelled) => StepResult::failed(e, changed, attempts, start.elapsed()),
            Err(e) if rt.is_dry_run() => StepResult::failed(e, changed, attempts, start.elapsed()),
            Err(e) => StepResult::failed(
                EngineError::RecoveryTimeout {
                    rebooted: issued,
                    reason: e.to_string(),
                },
                changed,
                attempts,
                start.elapsed(),
            ),
        }
    }
}
