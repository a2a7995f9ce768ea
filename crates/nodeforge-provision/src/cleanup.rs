//! Cleanup and rollback.
//!
//! Deletes an owner's provider resources in dependency order: network
//! attachments, DNS records, reserved addresses and finally the server.
//! Upstream "not found" counts as already deleted, so every operation here
//! can be repeated. A failed step is recorded in the summary and the
//! remaining steps still run.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use nodeforge_cloud::{CloudClient, CloudError};
use nodeforge_core::ForgeConfig;
use nodeforge_monitor::PhaseTracker;
use nodeforge_state::{
    AddressRole, EventSource, EventStatus, Node, Phase, StateStore, now_millis,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::allocator::ResourceAllocator;
use crate::dns::DnsRegistrar;
use crate::error::{ProvisionError, ProvisionResult};
use crate::netif::NetworkInterfaceManager;
use crate::saga::{ResourceSet, Saga};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Attachment,
    DnsRecord,
    Address,
    Server,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Attachment => "attachment",
            ResourceKind::DnsRecord => "dns_record",
            ResourceKind::Address => "address",
            ResourceKind::Server => "server",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupOutcome {
    Deleted,
    AlreadyAbsent,
    Failed,
}

/// One deletion attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupStep {
    pub kind: ResourceKind,
    /// Provider handle, address or record name. Empty when nothing was tracked.
    pub resource: String,
    pub outcome: CleanupOutcome,
    pub message: String,
}

/// What started the cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    /// Compensation of a failed provisioning request.
    Rollback,
    /// Operator-requested cleanup.
    Explicit,
    /// Periodic sweep of resources without a live owner.
    Orphan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStatus {
    Succeeded,
    PartiallySucceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub owner: String,
    pub mode: CleanupMode,
    pub status: CleanupStatus,
    pub steps: Vec<CleanupStep>,
    pub started_at: u64,
    pub finished_at: u64,
}

impl CleanupSummary {
    pub fn is_complete(&self) -> bool {
        self.status == CleanupStatus::Succeeded
    }

    pub fn count(&self, outcome: CleanupOutcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &CleanupStep> {
        self.steps
            .iter()
            .filter(|s| s.outcome == CleanupOutcome::Failed)
    }

    /// One-line description for history messages and logs.
    pub fn describe(&self) -> String {
        format!(
            "{} deleted, {} already absent, {} failed",
            self.count(CleanupOutcome::Deleted),
            self.count(CleanupOutcome::AlreadyAbsent),
            self.count(CleanupOutcome::Failed)
        )
    }
}

/// Where a leftover was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupLocation {
    /// Still tracked in the state store.
    Tracked,
    /// Still present at the provider.
    Provider,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Leftover {
    pub kind: ResourceKind,
    pub resource: String,
    pub location: CleanupLocation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupValidation {
    pub owner: String,
    pub leftovers: Vec<Leftover>,
}

impl CleanupValidation {
    pub fn is_clean(&self) -> bool {
        self.leftovers.is_empty()
    }
}

fn step(kind: ResourceKind, resource: impl Into<String>, result: ProvisionResult<bool>) -> CleanupStep {
    let resource = resource.into();
    let (outcome, message) = match result {
        Ok(true) => (CleanupOutcome::Deleted, String::new()),
        Ok(false) => (CleanupOutcome::AlreadyAbsent, "not found upstream".to_string()),
        Err(e) => (CleanupOutcome::Failed, e.to_string()),
    };
    if outcome == CleanupOutcome::Failed {
        warn!(%kind, %resource, %message, "cleanup step failed");
    } else {
        debug!(%kind, %resource, ?outcome, "cleanup step");
    }
    CleanupStep {
        kind,
        resource,
        outcome,
        message,
    }
}

fn nothing_tracked(kind: ResourceKind) -> CleanupStep {
    CleanupStep {
        kind,
        resource: String::new(),
        outcome: CleanupOutcome::AlreadyAbsent,
        message: "nothing tracked".to_string(),
    }
}

#[derive(Clone)]
pub struct CleanupService {
    store: StateStore,
    cloud: CloudClient,
    config: Arc<ForgeConfig>,
    tracker: PhaseTracker,
    allocator: ResourceAllocator,
    dns: DnsRegistrar,
    netif: NetworkInterfaceManager,
}

impl CleanupService {
    pub fn new(store: StateStore, cloud: CloudClient, config: Arc<ForgeConfig>) -> Self {
        Self {
            tracker: PhaseTracker::new(store.clone()),
            allocator: ResourceAllocator::new(store.clone(), cloud.clone(), config.clone()),
            dns: DnsRegistrar::new(store.clone(), cloud.clone(), config.clone()),
            netif: NetworkInterfaceManager::new(store.clone(), cloud.clone(), config.clone()),
            store,
            cloud,
            config,
        }
    }

    /// Delete `resources`, owned by `owner`, in dependency order.
    pub async fn execute(&self, owner: &str, resources: ResourceSet, mode: CleanupMode) -> CleanupSummary {
        let started_at = now_millis();
        let mut steps = Vec::with_capacity(resources.len() + 4);

        if resources.attachments.is_empty() {
            steps.push(nothing_tracked(ResourceKind::Attachment));
        }
        for attachment in &resources.attachments {
            let result = self.netif.detach(attachment).await;
            steps.push(step(ResourceKind::Attachment, &attachment.handle, result));
        }

        if resources.dns_records.is_empty() {
            steps.push(nothing_tracked(ResourceKind::DnsRecord));
        }
        for record in &resources.dns_records {
            let result = self.dns.deregister(record).await;
            steps.push(step(ResourceKind::DnsRecord, &record.name, result));
        }

        if resources.addresses.is_empty() {
            steps.push(nothing_tracked(ResourceKind::Address));
        }
        for reservation in &resources.addresses {
            let result = self.allocator.release(reservation).await;
            steps.push(step(ResourceKind::Address, &reservation.address, result));
        }

        match &resources.server_id {
            None => steps.push(nothing_tracked(ResourceKind::Server)),
            Some(server_id) => {
                let result = self.delete_server(owner, server_id).await;
                steps.push(step(ResourceKind::Server, server_id, result));
            }
        }

        let status = if steps.iter().any(|s| s.outcome == CleanupOutcome::Failed) {
            CleanupStatus::PartiallySucceeded
        } else {
            CleanupStatus::Succeeded
        };
        let summary = CleanupSummary {
            owner: owner.to_string(),
            mode,
            status,
            steps,
            started_at,
            finished_at: now_millis(),
        };
        info!(owner, ?mode, ?status, result = %summary.describe(), "cleanup finished");
        summary
    }

    async fn delete_server(&self, owner: &str, server_id: &str) -> ProvisionResult<bool> {
        let deleted = match self.cloud.delete_server(server_id).await {
            Ok(()) => true,
            Err(CloudError::NotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };
        self.store.update_node(owner, |n| {
            if n.server_id.as_deref() == Some(server_id) {
                n.server_id = None;
                true
            } else {
                false
            }
        })?;
        Ok(deleted)
    }

    /// Undo a provisioning saga. The node keeps its `failed` status.
    pub async fn rollback(&self, saga: Saga) -> CleanupSummary {
        let owner = saga.node().to_string();
        info!(node = %owner, steps = saga.steps().len(), "rolling back");
        self.execute(&owner, saga.into_resources(), CleanupMode::Rollback)
            .await
    }

    /// Delete everything tracked for node `name`. A complete cleanup moves
    /// the node to `cleaned`; a partial one leaves it `failed`.
    pub async fn cleanup_node(&self, name: &str) -> ProvisionResult<CleanupSummary> {
        self.cleanup_node_with(name, CleanupMode::Explicit).await
    }

    /// [`cleanup_node`](Self::cleanup_node) on a background task.
    pub fn cleanup_node_async(&self, name: &str) -> JoinHandle<ProvisionResult<CleanupSummary>> {
        let service = self.clone();
        let name = name.to_string();
        tokio::spawn(async move { service.cleanup_node(&name).await })
    }

    async fn cleanup_node_with(&self, name: &str, mode: CleanupMode) -> ProvisionResult<CleanupSummary> {
        let node = self
            .store
            .get_node(name)?
            .ok_or_else(|| ProvisionError::NodeNotFound(name.to_string()))?;
        let resources = ResourceSet::tracked(&self.store, name, node.server_id.clone())?;
        let summary = self.execute(name, resources, mode).await;

        if summary.is_complete() {
            self.tracker.record(
                name,
                Phase::Cleaned,
                EventStatus::Completed,
                EventSource::Cleanup,
                summary.describe(),
            )?;
        } else if !node.status.is_terminal() {
            self.tracker.fail(
                name,
                EventSource::Cleanup,
                format!("cleanup incomplete: {}", summary.describe()),
            )?;
        }
        Ok(summary)
    }

    /// Delete the resources of a cluster's VIP, owned by the cluster name.
    pub async fn cleanup_owner(&self, owner: &str) -> ProvisionResult<CleanupSummary> {
        let resources = ResourceSet::tracked(&self.store, owner, None)?;
        Ok(self.execute(owner, resources, CleanupMode::Explicit).await)
    }

    /// Owners whose tracked resources are eligible for the orphan sweep.
    ///
    /// Eligible: rows whose owner is neither a node nor a cluster, rows of
    /// cleaned nodes, and resources of nodes that have sat in an unfinished
    /// phase for longer than `threshold`. Deployed and failed nodes keep
    /// their resources until an operator cleans them up, and members
    /// waiting in `cluster_formation` belong to their cluster's coordinator.
    pub fn find_orphans(&self, now: u64, threshold: Duration) -> ProvisionResult<Vec<String>> {
        let mut owners: BTreeSet<String> = BTreeSet::new();
        owners.extend(self.store.list_addresses()?.into_iter().map(|r| r.owner));
        owners.extend(self.store.list_dns_records()?.into_iter().map(|r| r.owner));
        owners.extend(self.store.list_attachments()?.into_iter().map(|a| a.node));

        let threshold_ms = threshold.as_millis() as u64;
        let mut eligible = Vec::new();
        for node in self.store.list_nodes()? {
            let has_resources = owners.remove(&node.name) || node.server_id.is_some();
            if has_resources && self.node_is_orphaned(&node, now, threshold_ms) {
                eligible.push(node.name);
            }
        }
        for owner in owners {
            if self.store.get_cluster(&owner)?.is_none() {
                eligible.push(owner);
            }
        }
        Ok(eligible)
    }

    fn node_is_orphaned(&self, node: &Node, now: u64, threshold_ms: u64) -> bool {
        match node.status {
            Phase::Cleaned => true,
            Phase::Deployed | Phase::Failed | Phase::ClusterFormation => false,
            _ => now.saturating_sub(node.updated_at) > threshold_ms,
        }
    }

    /// Sweep every eligible owner. Per-owner failures are logged and skipped.
    pub async fn cleanup_orphans(&self, now: u64, threshold: Duration) -> ProvisionResult<Vec<CleanupSummary>> {
        let owners = self.find_orphans(now, threshold)?;
        let mut summaries = Vec::with_capacity(owners.len());
        for owner in owners {
            let result = if self.store.get_node(&owner)?.is_some() {
                self.cleanup_node_with(&owner, CleanupMode::Orphan).await
            } else {
                let resources = ResourceSet::tracked(&self.store, &owner, None)?;
                Ok(self.execute(&owner, resources, CleanupMode::Orphan).await)
            };
            match result {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!(%owner, error = %e, "orphan cleanup failed"),
            }
        }
        if !summaries.is_empty() {
            info!(owners = summaries.len(), "orphan sweep finished");
        }
        Ok(summaries)
    }

    /// Look for anything of `owner` left in the store or at the provider.
    pub async fn validate(&self, owner: &str) -> ProvisionResult<CleanupValidation> {
        let node = self.store.get_node(owner)?;
        let tracked = ResourceSet::tracked(
            &self.store,
            owner,
            node.as_ref().and_then(|n| n.server_id.clone()),
        )?;
        let mut leftovers = Vec::new();
        let mut tracked_leftover = |kind, resource: &str| {
            leftovers.push(Leftover {
                kind,
                resource: resource.to_string(),
                location: CleanupLocation::Tracked,
            })
        };
        for a in &tracked.attachments {
            tracked_leftover(ResourceKind::Attachment, &a.handle);
        }
        for r in &tracked.dns_records {
            tracked_leftover(ResourceKind::DnsRecord, &r.name);
        }
        for r in &tracked.addresses {
            tracked_leftover(ResourceKind::Address, &r.address);
        }
        if let Some(server_id) = &tracked.server_id {
            tracked_leftover(ResourceKind::Server, server_id);
        }

        let roles: Vec<AddressRole> = match &node {
            Some(n) => n.role.address_roles().to_vec(),
            None => vec![AddressRole::ClusterVip],
        };

        if let Some(server_id) = &tracked.server_id {
            match self.cloud.get_server(server_id).await {
                Ok(_) => leftovers.push(Leftover {
                    kind: ResourceKind::Server,
                    resource: server_id.clone(),
                    location: CleanupLocation::Provider,
                }),
                Err(CloudError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        for role in &roles {
            let name = self.dns.record_name(owner, *role);
            if self
                .cloud
                .find_dns_record(&self.config.dns.zone, &name)
                .await?
                .is_some()
            {
                leftovers.push(Leftover {
                    kind: ResourceKind::DnsRecord,
                    resource: name,
                    location: CleanupLocation::Provider,
                });
            }
        }

        for role in &roles {
            let Some(range) = self.config.range_for(*role) else {
                continue;
            };
            let reservation_name = format!("{owner}-{}", role.label());
            for r in self.cloud.list_reserved_addresses(&range.subnet).await? {
                if r.name == reservation_name {
                    leftovers.push(Leftover {
                        kind: ResourceKind::Address,
                        resource: r.address,
                        location: CleanupLocation::Provider,
                    });
                }
            }
        }

        Ok(CleanupValidation {
            owner: owner.to_string(),
            leftovers,
        })
    }
}
