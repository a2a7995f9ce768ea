//! Read models returned by the status and cleanup operations.

use std::collections::BTreeMap;

use nodeforge_provision::CleanupSummary;
use nodeforge_state::{
    Cluster, ClusterAssociation, ClusterStatus, Node, NodeAddresses, Phase,
};
use serde::Serialize;

/// Current state of one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub status: Phase,
    pub progress: u8,
    pub server_id: Option<String>,
    pub provider_status: Option<String>,
    pub addresses: NodeAddresses,
    pub cluster: Option<ClusterAssociation>,
    pub failure: Option<String>,
    /// Whether a monitor task is watching the node right now.
    pub monitored: bool,
    pub updated_at: u64,
}

impl NodeStatus {
    pub(crate) fn new(node: Node, monitored: bool) -> Self {
        Self {
            name: node.name,
            status: node.status,
            progress: node.progress,
            server_id: node.server_id,
            provider_status: node.provider_status,
            addresses: node.addresses,
            cluster: node.cluster,
            failure: node.failure,
            monitored,
            updated_at: node.updated_at,
        }
    }
}

/// Answer to a phase report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseAck {
    pub node: String,
    /// Whether the report moved the node. Late reports are kept in the
    /// history only.
    pub applied: bool,
    pub status: Phase,
    pub progress: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterOverview {
    pub name: String,
    pub status: ClusterStatus,
    pub vip: Option<String>,
    pub members: usize,
    pub joined: usize,
}

impl From<&Cluster> for ClusterOverview {
    fn from(cluster: &Cluster) -> Self {
        Self {
            name: cluster.name.clone(),
            status: cluster.status,
            vip: cluster.vip.clone(),
            members: cluster.members.len(),
            joined: cluster.members.iter().filter(|m| m.joined_at.is_some()).count(),
        }
    }
}

/// Fleet-wide overview.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeploymentSummary {
    pub nodes: usize,
    /// Node count per phase name.
    pub by_phase: BTreeMap<String, usize>,
    pub in_progress: usize,
    pub deployed: usize,
    pub failed: usize,
    pub cleaned: usize,
    pub monitored: usize,
    pub reserved_addresses: usize,
    pub dns_records: usize,
    pub attachments: usize,
    pub clusters: Vec<ClusterOverview>,
}

impl DeploymentSummary {
    pub(crate) fn count_node(&mut self, node: &Node) {
        self.nodes += 1;
        *self.by_phase.entry(node.status.to_string()).or_default() += 1;
        match node.status {
            Phase::Deployed => self.deployed += 1,
            Phase::Failed => self.failed += 1,
            Phase::Cleaned => self.cleaned += 1,
            _ => self.in_progress += 1,
        }
    }
}

/// Result of cleaning up a whole cluster deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentCleanup {
    pub cluster: String,
    pub members: Vec<CleanupSummary>,
    /// VIP address and its DNS record.
    pub vip: CleanupSummary,
}

impl DeploymentCleanup {
    pub fn is_complete(&self) -> bool {
        self.vip.is_complete() && self.members.iter().all(CleanupSummary::is_complete)
    }
}
