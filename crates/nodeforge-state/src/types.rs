//! Domain types for the NodeForge state store.
//!
//! These types represent the persisted state of provisioned nodes and the
//! provider-side resources they own. All types are serializable to/from
//! JSON for storage in redb tables.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::phase::{EventStatus, Phase};

/// Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Roles ──────────────────────────────────────────────────────────

/// Address category a reservation is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressRole {
    Management,
    Hypervisor,
    ControllerVm,
    Workload,
    ClusterVip,
}

impl AddressRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AddressRole::Management => "management",
            AddressRole::Hypervisor => "hypervisor",
            AddressRole::ControllerVm => "controller_vm",
            AddressRole::Workload => "workload",
            AddressRole::ClusterVip => "cluster_vip",
        }
    }

    /// Short label used in DNS names and provider resource names.
    pub fn label(self) -> &'static str {
        match self {
            AddressRole::Management => "mgmt",
            AddressRole::Hypervisor => "hv",
            AddressRole::ControllerVm => "cvm",
            AddressRole::Workload => "wl",
            AddressRole::ClusterVip => "vip",
        }
    }
}

impl fmt::Display for AddressRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a node plays in the hyperconverged cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterRole {
    Compute,
    Storage,
    ComputeStorage,
}

impl ClusterRole {
    /// Address categories a node of this role needs, in allocation order.
    pub fn address_roles(self) -> &'static [AddressRole] {
        match self {
            ClusterRole::Compute => &[
                AddressRole::Management,
                AddressRole::Hypervisor,
                AddressRole::Workload,
            ],
            ClusterRole::Storage => &[
                AddressRole::Management,
                AddressRole::Hypervisor,
                AddressRole::ControllerVm,
            ],
            ClusterRole::ComputeStorage => &[
                AddressRole::Management,
                AddressRole::Hypervisor,
                AddressRole::ControllerVm,
                AddressRole::Workload,
            ],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClusterRole::Compute => "compute",
            ClusterRole::Storage => "storage",
            ClusterRole::ComputeStorage => "compute-storage",
        }
    }
}

/// Whether a node founds its cluster or joins one that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterIntent {
    Create,
    Join,
}

/// Link from a node to the cluster it should end up in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAssociation {
    pub cluster: String,
    pub intent: ClusterIntent,
}

// ── Node ──────────────────────────────────────────────────────────

/// Addresses assigned to a node, one per category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddresses {
    pub management: Option<String>,
    pub hypervisor: Option<String>,
    pub controller_vm: Option<String>,
    pub workload: Option<String>,
}

impl NodeAddresses {
    pub fn get(&self, role: AddressRole) -> Option<&str> {
        match role {
            AddressRole::Management => self.management.as_deref(),
            AddressRole::Hypervisor => self.hypervisor.as_deref(),
            AddressRole::ControllerVm => self.controller_vm.as_deref(),
            AddressRole::Workload => self.workload.as_deref(),
            AddressRole::ClusterVip => None,
        }
    }

    pub fn set(&mut self, role: AddressRole, address: impl Into<String>) {
        let address = Some(address.into());
        match role {
            AddressRole::Management => self.management = address,
            AddressRole::Hypervisor => self.hypervisor = address,
            AddressRole::ControllerVm => self.controller_vm = address,
            AddressRole::Workload => self.workload = address,
            AddressRole::ClusterVip => {}
        }
    }

    /// Whether any of the node's addresses equals `address`.
    pub fn contains(&self, address: &str) -> bool {
        [
            &self.management,
            &self.hypervisor,
            &self.controller_vm,
            &self.workload,
        ]
        .into_iter()
        .any(|a| a.as_deref() == Some(address))
    }
}

/// One physical server being provisioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Server class requested from the provider.
    pub profile: String,
    pub role: ClusterRole,
    pub addresses: NodeAddresses,
    /// Provider-assigned bare-metal server ID.
    pub server_id: Option<String>,
    /// Cached current phase (latest applied event).
    pub status: Phase,
    pub progress: u8,
    /// Last lifecycle status reported by the provider poll.
    pub provider_status: Option<String>,
    pub cluster: Option<ClusterAssociation>,
    /// Storage devices selected for the data pool.
    pub storage_devices: Vec<String>,
    /// Reason for the latest failure, if any.
    pub failure: Option<String>,
    /// Unix timestamp (ms) when this node was requested.
    pub created_at: u64,
    /// Unix timestamp (ms) of the last cached-state change.
    pub updated_at: u64,
    /// Unix timestamp (ms) of the last accepted, non-regressing signal.
    /// Phase timeouts are measured from here.
    pub last_progress_at: u64,
}

impl Node {
    /// A fresh node record in `pending`.
    pub fn new(name: impl Into<String>, profile: impl Into<String>, role: ClusterRole) -> Self {
        let now = now_millis();
        Self {
            name: name.into(),
            profile: profile.into(),
            role,
            addresses: NodeAddresses::default(),
            server_id: None,
            status: Phase::Pending,
            progress: 0,
            provider_status: None,
            cluster: None,
            storage_devices: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
            last_progress_at: now,
        }
    }

    /// Move the cached phase, keeping progress and timestamps in step.
    pub fn enter_phase(&mut self, phase: Phase, at: u64) {
        if phase != self.status {
            self.status = phase;
            if !phase.is_terminal() {
                self.progress = phase.progress();
            }
        }
        self.updated_at = at;
        self.last_progress_at = at;
    }
}

// ── Provider-side resources ───────────────────────────────────────

/// An address reserved in a provider subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedAddress {
    /// Owning node name, or cluster name for `ClusterVip`.
    pub owner: String,
    pub role: AddressRole,
    pub address: String,
    pub subnet: String,
    /// Provider reservation ID. `None` while the local claim is held but
    /// the provider call has not returned yet.
    pub handle: Option<String>,
    /// Unix timestamp (ms) of the local claim.
    pub claimed_at: u64,
}

impl ReservedAddress {
    pub fn table_key(&self) -> String {
        address_key(&self.subnet, &self.address)
    }
}

/// Key of the reserved-address table.
pub fn address_key(subnet: &str, address: &str) -> String {
    format!("{subnet}/{address}")
}

/// A name→address record published in the managed zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    /// Owning node name, or cluster name for the VIP record.
    pub owner: String,
    pub zone: String,
    /// Fully qualified record name.
    pub name: String,
    pub record_type: String,
    pub target: String,
    /// The reserved address this record points at.
    pub address_role: AddressRole,
    pub handle: String,
    pub created_at: u64,
}

impl DnsRecord {
    pub fn table_key(&self) -> String {
        dns_key(&self.zone, &self.name)
    }
}

/// Key of the DNS record table.
pub fn dns_key(zone: &str, name: &str) -> String {
    format!("{zone}/{name}")
}

/// A virtual network attachment the server binds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub node: String,
    pub role: AddressRole,
    pub handle: String,
    /// Address bound to this attachment.
    pub address: String,
    pub subnet: String,
    pub security_groups: Vec<String>,
    pub created_at: u64,
}

impl NetworkAttachment {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.node, self.handle)
    }
}

// ── History ───────────────────────────────────────────────────────

/// Who produced a deployment event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Provisioner,
    Provider,
    Node,
    Monitor,
    Coordinator,
    Cleanup,
}

/// Append-only history row. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub node: String,
    /// Per-node sequence number, assigned by the store.
    pub seq: u64,
    pub phase: Phase,
    pub status: EventStatus,
    pub message: String,
    pub source: EventSource,
    /// Whether this event moved the node's cached state. Late or
    /// regressing reports are kept with `applied = false`.
    pub applied: bool,
    /// Unix timestamp (ms).
    pub timestamp: u64,
}

impl DeploymentEvent {
    pub fn new(
        node: impl Into<String>,
        phase: Phase,
        status: EventStatus,
        source: EventSource,
        message: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            seq: 0,
            phase,
            status,
            message: message.into(),
            source,
            applied: false,
            timestamp: now_millis(),
        }
    }

    pub fn table_key(&self) -> String {
        event_key(&self.node, self.seq)
    }
}

/// Key of the events table.
pub fn event_key(node: &str, seq: u64) -> String {
    format!("{node}:{seq:010}")
}

// ── Cluster ───────────────────────────────────────────────────────

/// Formation status of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    /// Waiting for quorum.
    Pending,
    /// Create call issued, polling health.
    Forming,
    Formed,
    Failed,
}

/// How a member entered the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    /// The node the create call was issued against.
    EntryPoint,
    /// Added through the entry point.
    Joining,
}

/// A node listed in a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub node: String,
    /// `None` until formation takes the node in.
    pub kind: Option<MemberKind>,
    pub joined_at: Option<u64>,
}

impl ClusterMember {
    pub fn waiting(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            kind: None,
            joined_at: None,
        }
    }
}

/// A hyperconverged cluster formed from provisioned nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub vip: Option<String>,
    /// Ready members required before formation is attempted.
    pub min_members: u32,
    pub members: Vec<ClusterMember>,
    pub status: ClusterStatus,
    pub entry_point: Option<String>,
    pub message: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Cluster {
    pub fn member(&self, node: &str) -> Option<&ClusterMember> {
        self.members.iter().find(|m| m.node == node)
    }

    pub fn member_mut(&mut self, node: &str) -> Option<&mut ClusterMember> {
        self.members.iter_mut().find(|m| m.node == node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_storage_needs_four_addresses() {
        assert_eq!(ClusterRole::ComputeStorage.address_roles().len(), 4);
        assert!(!ClusterRole::Compute
            .address_roles()
            .contains(&AddressRole::ControllerVm));
    }

    #[test]
    fn node_addresses_set_and_lookup() {
        let mut addrs = NodeAddresses::default();
        addrs.set(AddressRole::Hypervisor, "10.0.1.4");
        addrs.set(AddressRole::ClusterVip, "10.0.9.9");
        assert_eq!(addrs.get(AddressRole::Hypervisor), Some("10.0.1.4"));
        assert!(addrs.contains("10.0.1.4"));
        assert!(!addrs.contains("10.0.9.9"));
    }

    #[test]
    fn enter_phase_tracks_progress() {
        let mut node = Node::new("n1", "bx2d", ClusterRole::Compute);
        node.enter_phase(Phase::ImageDownload, 42);
        assert_eq!(node.progress, Phase::ImageDownload.progress());
        assert_eq!(node.last_progress_at, 42);

        node.enter_phase(Phase::Failed, 50);
        assert_eq!(node.progress, Phase::ImageDownload.progress());
    }

    #[test]
    fn event_keys_sort_by_sequence() {
        assert!(event_key("n1", 9) < event_key("n1", 10));
    }

    #[test]
    fn cluster_role_serializes_kebab_case() {
        let json = serde_json::to_string(&ClusterRole::ComputeStorage).unwrap();
        assert_eq!(json, "\"compute-storage\"");
    }
}
