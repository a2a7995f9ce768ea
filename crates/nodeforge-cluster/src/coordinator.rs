//! Cluster formation coordinator.

use std::sync::Arc;
use std::time::Duration;

use nodeforge_core::ForgeConfig;
use nodeforge_monitor::PhaseTracker;
use nodeforge_provision::{CleanupService, DnsRegistrar, ResourceAllocator};
use nodeforge_state::{
    AddressRole, Cluster, ClusterMember, ClusterStatus, DnsRecord, EventSource, MemberKind, Node,
    Phase, ReservedAddress, StateError, StateStore, now_millis,
};
use tracing::{debug, info, warn};

use crate::api::{ClusterApi, CreateClusterRequest, MemberSpec};
use crate::error::{ClusterError, ClusterResult};

/// What a readiness check led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormationOutcome {
    /// Fewer ready members than required.
    Waiting { ready: usize, required: usize },
    /// Another task is forming or joining.
    InProgress,
    Formed { entry_point: String, members: Vec<String> },
    Joined { node: String },
    Failed { message: String },
    /// The node has nothing left to do here.
    Skipped,
}

#[derive(Clone)]
pub struct ClusterCoordinator {
    store: StateStore,
    tracker: PhaseTracker,
    config: Arc<ForgeConfig>,
    api: Arc<dyn ClusterApi>,
    allocator: ResourceAllocator,
    dns: DnsRegistrar,
    cleanup: CleanupService,
    health_poll_interval: Duration,
}

fn member_spec(node: &Node) -> Option<MemberSpec> {
    Some(MemberSpec {
        node: node.name.clone(),
        management_address: node.addresses.management.clone()?,
        hypervisor_address: node.addresses.hypervisor.clone(),
        controller_vm_address: node.addresses.controller_vm.clone(),
    })
}

impl ClusterCoordinator {
    pub fn new(
        store: StateStore,
        config: Arc<ForgeConfig>,
        api: Arc<dyn ClusterApi>,
        allocator: ResourceAllocator,
        dns: DnsRegistrar,
        cleanup: CleanupService,
    ) -> Self {
        Self {
            tracker: PhaseTracker::new(store.clone()),
            health_poll_interval: Duration::from_secs(config.cluster.health_poll_interval_secs),
            store,
            config,
            api,
            allocator,
            dns,
            cleanup,
        }
    }

    /// Override the health poll interval (tests use a few milliseconds).
    pub fn with_health_poll_interval(mut self, interval: Duration) -> Self {
        self.health_poll_interval = interval;
        self
    }

    fn formation_timeout(&self) -> Duration {
        Duration::from_secs(self.config.cluster.formation_timeout_secs)
    }

    /// Create the cluster row and publish its VIP.
    pub async fn register(
        &self,
        name: &str,
        members: &[String],
        min_members: Option<u32>,
    ) -> ClusterResult<Cluster> {
        if self.store.get_cluster(name)?.is_some() {
            return Err(ClusterError::AlreadyExists(name.to_string()));
        }
        let min_members = min_members.unwrap_or(self.config.cluster.min_members);
        if min_members == 0 {
            return Err(ClusterError::InvalidRequest(
                "min_members must be at least 1".to_string(),
            ));
        }

        let vip = self.allocator.reserve(name, AddressRole::ClusterVip).await?;
        let record = match self.dns.register(&vip).await {
            Ok(record) => record,
            Err(e) => {
                self.release_vip(name, &vip, None).await;
                return Err(e.into());
            }
        };

        let now = now_millis();
        let cluster = Cluster {
            name: name.to_string(),
            vip: Some(vip.address.clone()),
            min_members,
            members: members.iter().map(ClusterMember::waiting).collect(),
            status: ClusterStatus::Pending,
            entry_point: None,
            message: None,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.create_cluster(&cluster) {
            self.release_vip(name, &vip, Some(&record)).await;
            return Err(match e {
                StateError::AlreadyExists(_) => ClusterError::AlreadyExists(name.to_string()),
                other => other.into(),
            });
        }
        info!(cluster = name, vip = %vip.address, min_members, "cluster registered");
        Ok(cluster)
    }

    async fn release_vip(&self, cluster: &str, vip: &ReservedAddress, record: Option<&DnsRecord>) {
        if let Some(record) = record
            && let Err(e) = self.dns.deregister(record).await
        {
            warn!(cluster, error = %e, "could not remove VIP record");
        }
        if let Err(e) = self.allocator.release(vip).await {
            warn!(cluster, error = %e, "could not release VIP");
        }
    }

    /// List `node` as a member of `cluster`.
    pub fn add_member(&self, cluster: &str, node: &str) -> ClusterResult<Cluster> {
        self.store
            .update_cluster(cluster, |c| {
                if c.member(node).is_some() {
                    return false;
                }
                c.members.push(ClusterMember::waiting(node));
                c.updated_at = now_millis();
                true
            })?
            .into_inner()
            .ok_or_else(|| ClusterError::NotFound(cluster.to_string()))
    }

    /// React to `node` waiting in `cluster_formation`.
    pub async fn node_ready(&self, node: &str) -> ClusterResult<FormationOutcome> {
        let Some(current) = self.store.get_node(node)? else {
            return Ok(FormationOutcome::Skipped);
        };
        if current.status != Phase::ClusterFormation {
            return Ok(FormationOutcome::Skipped);
        }
        let Some(association) = current.cluster.clone() else {
            return Ok(FormationOutcome::Skipped);
        };
        let cluster = self
            .store
            .get_cluster(&association.cluster)?
            .ok_or_else(|| ClusterError::NotFound(association.cluster.clone()))?;

        match cluster.status {
            ClusterStatus::Pending => self.try_form(&cluster.name).await,
            ClusterStatus::Forming => Ok(FormationOutcome::InProgress),
            ClusterStatus::Formed => match cluster.member(node).and_then(|m| m.kind) {
                None => self.join(&cluster.name, &current).await,
                Some(_) => {
                    self.advance(node, &cluster.name)?;
                    Ok(FormationOutcome::Skipped)
                }
            },
            ClusterStatus::Failed => {
                let message = cluster
                    .message
                    .unwrap_or_else(|| "cluster formation failed".to_string());
                self.settle_member(node, &message).await;
                Ok(FormationOutcome::Failed { message })
            }
        }
    }

    /// Put a failed cluster back to pending and try to form it again with
    /// the members that are still waiting.
    pub async fn retry_formation(&self, cluster: &str) -> ClusterResult<FormationOutcome> {
        let reset = self.store.update_cluster(cluster, |c| {
            if c.status != ClusterStatus::Failed {
                return false;
            }
            c.status = ClusterStatus::Pending;
            c.entry_point = None;
            c.message = None;
            c.updated_at = now_millis();
            true
        })?;
        let changed = reset.is_changed();
        let Some(snapshot) = reset.into_inner() else {
            return Err(ClusterError::NotFound(cluster.to_string()));
        };
        if !changed {
            return Err(ClusterError::InvalidRequest(format!(
                "cluster {cluster} is {:?}, only a failed cluster can be retried",
                snapshot.status
            )));
        }
        for member in &snapshot.members {
            self.store.update_node(&member.node, |n| {
                n.status == Phase::ClusterFormation && n.failure.take().is_some()
            })?;
        }
        info!(cluster, "retrying cluster formation");
        self.try_form(cluster).await
    }

    /// Listed members currently waiting in `cluster_formation`, by name.
    fn ready_members(&self, cluster: &Cluster) -> ClusterResult<Vec<Node>> {
        let mut ready = Vec::new();
        for member in &cluster.members {
            if let Some(node) = self.store.get_node(&member.node)?
                && node.status == Phase::ClusterFormation
            {
                ready.push(node);
            }
        }
        ready.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ready)
    }

    /// Form `cluster` if enough members are ready and nobody else is on it.
    pub async fn try_form(&self, cluster: &str) -> ClusterResult<FormationOutcome> {
        let snapshot = self
            .store
            .get_cluster(cluster)?
            .ok_or_else(|| ClusterError::NotFound(cluster.to_string()))?;
        let ready = self.ready_members(&snapshot)?;
        let required = snapshot.min_members as usize;
        if ready.len() < required {
            debug!(cluster, ready = ready.len(), required, "waiting for quorum");
            return Ok(FormationOutcome::Waiting {
                ready: ready.len(),
                required,
            });
        }

        let Some(entry) = ready.first() else {
            return Ok(FormationOutcome::Waiting { ready: 0, required });
        };
        let entry_point = entry.name.clone();
        let claimed = self.store.update_cluster(cluster, |c| {
            if c.status != ClusterStatus::Pending {
                return false;
            }
            c.status = ClusterStatus::Forming;
            c.entry_point = Some(entry_point.clone());
            c.updated_at = now_millis();
            true
        })?;
        if !claimed.is_changed() {
            return Ok(FormationOutcome::InProgress);
        }

        let members: Vec<MemberSpec> = ready.iter().filter_map(member_spec).collect();
        let names: Vec<String> = members.iter().map(|m| m.node.clone()).collect();
        let Some(entry_address) = entry.addresses.management.clone() else {
            let message = format!("entry point {entry_point} has no management address");
            self.formation_failed(cluster, &names, &message).await?;
            return Ok(FormationOutcome::Failed { message });
        };
        info!(cluster, entry_point = %entry_point, members = names.len(), "forming cluster");

        let request = CreateClusterRequest {
            name: cluster.to_string(),
            vip: snapshot.vip.clone(),
            members,
        };
        let result = match self.api.create_cluster(&entry_address, &request).await {
            Ok(()) => self.await_healthy(cluster, &entry_address).await,
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(()) => {
                self.formation_succeeded(cluster, &entry_point, &names)?;
                Ok(FormationOutcome::Formed {
                    entry_point,
                    members: names,
                })
            }
            Err(message) => {
                self.formation_failed(cluster, &names, &message).await?;
                Ok(FormationOutcome::Failed { message })
            }
        }
    }

    /// Poll health until the cluster is up or the formation timeout elapses.
    async fn await_healthy(&self, cluster: &str, entry_address: &str) -> Result<(), String> {
        let timeout = self.formation_timeout();
        let poll = async {
            loop {
                match self.api.cluster_health(entry_address, cluster).await {
                    Ok(health) if health.up => return,
                    Ok(health) => debug!(cluster, members_up = health.members_up, "cluster not up yet"),
                    Err(e) => debug!(cluster, error = %e, "cluster health poll failed"),
                }
                tokio::time::sleep(self.health_poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| format!("cluster not healthy after {}s", timeout.as_secs()))
    }

    fn formation_succeeded(&self, cluster: &str, entry_point: &str, members: &[String]) -> ClusterResult<()> {
        let now = now_millis();
        self.store.update_cluster(cluster, |c| {
            c.status = ClusterStatus::Formed;
            c.message = None;
            c.updated_at = now;
            for name in members {
                if let Some(m) = c.member_mut(name) {
                    m.kind = Some(if name == entry_point {
                        MemberKind::EntryPoint
                    } else {
                        MemberKind::Joining
                    });
                    m.joined_at = Some(now);
                }
            }
            true
        })?;
        info!(cluster, entry_point, members = members.len(), "cluster formed");
        for name in members {
            self.advance(name, cluster)?;
        }
        Ok(())
    }

    async fn formation_failed(&self, cluster: &str, members: &[String], message: &str) -> ClusterResult<()> {
        warn!(cluster, %message, "cluster formation failed");
        self.store.update_cluster(cluster, |c| {
            c.status = ClusterStatus::Failed;
            c.message = Some(message.to_string());
            c.updated_at = now_millis();
            true
        })?;
        for name in members {
            self.settle_member(name, message).await;
        }
        Ok(())
    }

    /// Apply the formation failure policy to a member. Without rollback
    /// the member keeps waiting in `cluster_formation`, annotated with the
    /// failure, so the cluster can be retried.
    async fn settle_member(&self, node: &str, message: &str) {
        if self.config.cluster.rollback_members_on_failure {
            self.fail_member(node, message).await;
            return;
        }
        let failure = format!("cluster formation failed: {message}");
        let annotated = self.store.update_node(node, |n| {
            if n.status != Phase::ClusterFormation || n.failure.as_deref() == Some(failure.as_str()) {
                return false;
            }
            n.failure = Some(failure.clone());
            true
        });
        match annotated {
            Ok(updated) if updated.is_changed() => {
                info!(node, "member kept for retry after failed formation")
            }
            Ok(_) => {}
            Err(e) => warn!(node, error = %e, "could not annotate member"),
        }
    }

    /// Mark a member failed, rolling it back only if policy says so.
    async fn fail_member(&self, node: &str, message: &str) {
        if let Err(e) = self.tracker.fail(
            node,
            EventSource::Coordinator,
            format!("cluster formation failed: {message}"),
        ) {
            warn!(node, error = %e, "could not mark member failed");
        }
        if self.config.cluster.rollback_members_on_failure {
            match self.cleanup.cleanup_node(node).await {
                Ok(summary) => info!(node, result = %summary.describe(), "member rolled back"),
                Err(e) => warn!(node, error = %e, "member rollback failed"),
            }
        }
    }

    /// Join a late member through the existing entry point.
    async fn join(&self, cluster: &str, node: &Node) -> ClusterResult<FormationOutcome> {
        let snapshot = self
            .store
            .get_cluster(cluster)?
            .ok_or_else(|| ClusterError::NotFound(cluster.to_string()))?;
        let entry_address = snapshot
            .entry_point
            .as_deref()
            .map(|name| self.store.get_node(name))
            .transpose()?
            .flatten()
            .and_then(|n| n.addresses.management);
        let (Some(entry_address), Some(spec)) = (entry_address, member_spec(node)) else {
            let message = format!("cannot join {} to {cluster}: missing addresses", node.name);
            self.fail_member(&node.name, &message).await;
            return Ok(FormationOutcome::Failed { message });
        };

        let name = node.name.clone();
        let claimed = self.store.update_cluster(cluster, |c| {
            if c.member(&name).is_none() {
                c.members.push(ClusterMember::waiting(name.as_str()));
            }
            match c.member_mut(&name) {
                Some(m) if m.kind.is_none() => {
                    m.kind = Some(MemberKind::Joining);
                    c.updated_at = now_millis();
                    true
                }
                _ => false,
            }
        })?;
        if !claimed.is_changed() {
            return Ok(FormationOutcome::InProgress);
        }

        info!(cluster, node = %name, "joining late member");
        match self.api.join_cluster(&entry_address, cluster, &spec).await {
            Ok(()) => {
                self.store.update_cluster(cluster, |c| {
                    if let Some(m) = c.member_mut(&name) {
                        m.joined_at = Some(now_millis());
                    }
                    true
                })?;
                self.advance(&name, cluster)?;
                Ok(FormationOutcome::Joined { node: name })
            }
            Err(e) => {
                let message = e.to_string();
                self.fail_member(&name, &message).await;
                Ok(FormationOutcome::Failed { message })
            }
        }
    }

    fn advance(&self, node: &str, cluster: &str) -> ClusterResult<()> {
        self.tracker.enter(
            node,
            Phase::DnsRegistration,
            EventSource::Coordinator,
            format!("member of {cluster}"),
        )?;
        // A failure note left by an earlier attempt no longer applies.
        self.store.update_node(node, |n| {
            n.status == Phase::DnsRegistration && n.failure.take().is_some()
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ClusterHealth;
    use async_trait::async_trait;
    use nodeforge_cloud::{CloudClient, RetryConfig, SimulatedCloud};
    use nodeforge_state::{ClusterAssociation, ClusterIntent, ClusterRole, NodeAddresses};
    use std::sync::Mutex;

    /// Scripted management API: records calls, reports up after
    /// `healthy_after` health polls.
    #[derive(Default)]
    struct ScriptedApi {
        calls: Mutex<Vec<String>>,
        healthy_after: Option<usize>,
        polls: Mutex<usize>,
        /// Upcoming create calls that fail.
        failing_creates: Mutex<usize>,
    }

    impl ScriptedApi {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClusterApi for ScriptedApi {
        async fn create_cluster(&self, entry_point: &str, request: &CreateClusterRequest) -> ClusterResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("create {} via {entry_point} ({} members)", request.name, request.members.len()));
            let mut failing = self.failing_creates.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(ClusterError::Api {
                    status: 500,
                    message: "create failed".to_string(),
                });
            }
            Ok(())
        }

        async fn join_cluster(&self, entry_point: &str, cluster: &str, member: &MemberSpec) -> ClusterResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("join {} to {cluster} via {entry_point}", member.node));
            Ok(())
        }

        async fn cluster_health(&self, _entry_point: &str, _cluster: &str) -> ClusterResult<ClusterHealth> {
            let mut polls = self.polls.lock().unwrap();
            *polls += 1;
            Ok(ClusterHealth {
                up: self.healthy_after.is_some_and(|n| *polls >= n),
                members_up: 0,
                message: None,
            })
        }
    }

    struct Fixture {
        store: StateStore,
        coordinator: ClusterCoordinator,
        api: Arc<ScriptedApi>,
        sim: Arc<SimulatedCloud>,
    }

    fn fixture(api: ScriptedApi, mutate: impl FnOnce(&mut ForgeConfig)) -> Fixture {
        let mut config = ForgeConfig::sample();
        config.cluster.formation_timeout_secs = 1;
        mutate(&mut config);
        let config = Arc::new(config);
        let sim = Arc::new(SimulatedCloud::new());
        let store = StateStore::open_in_memory().unwrap();
        let cloud = CloudClient::new(sim.clone(), RetryConfig::none(), Duration::from_secs(5));
        let api = Arc::new(api);
        let coordinator = ClusterCoordinator::new(
            store.clone(),
            config.clone(),
            api.clone(),
            ResourceAllocator::new(store.clone(), cloud.clone(), config.clone()),
            DnsRegistrar::new(store.clone(), cloud.clone(), config.clone()),
            CleanupService::new(store.clone(), cloud, config),
        )
        .with_health_poll_interval(Duration::from_millis(5));
        Fixture {
            store,
            coordinator,
            api,
            sim,
        }
    }

    fn add_node(store: &StateStore, name: &str, index: u8, phase: Phase) {
        let mut node = Node::new(name, "bx2d-metal-96x384", ClusterRole::ComputeStorage);
        node.status = phase;
        node.addresses = NodeAddresses {
            management: Some(format!("10.10.0.{}", 10 + index)),
            hypervisor: Some(format!("10.10.1.{}", 10 + index)),
            controller_vm: Some(format!("10.10.2.{}", 10 + index)),
            workload: None,
        };
        node.cluster = Some(ClusterAssociation {
            cluster: "hci-a".to_string(),
            intent: ClusterIntent::Create,
        });
        store.create_node(&node).unwrap();
    }

    fn status(store: &StateStore, node: &str) -> Phase {
        store.get_node(node).unwrap().unwrap().status
    }

    async fn three_member_cluster(f: &Fixture) {
        let members: Vec<String> = (1..=3).map(|i| format!("node-{i}")).collect();
        f.coordinator.register("hci-a", &members, None).await.unwrap();
    }

    #[tokio::test]
    async fn register_publishes_vip() {
        let f = fixture(ScriptedApi::default(), |_| {});
        three_member_cluster(&f).await;
        let cluster = f.store.get_cluster("hci-a").unwrap().unwrap();
        assert_eq!(cluster.vip.as_deref(), Some("10.10.2.200"));
        assert_eq!(cluster.members.len(), 3);
        assert_eq!(f.sim.dns_record_count(), 1);

        let err = f.coordinator.register("hci-a", &[], None).await.unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn waits_for_quorum_then_forms_once() {
        let api = ScriptedApi {
            healthy_after: Some(2),
            ..ScriptedApi::default()
        };
        let f = fixture(api, |_| {});
        three_member_cluster(&f).await;
        add_node(&f.store, "node-1", 1, Phase::ClusterFormation);
        add_node(&f.store, "node-2", 2, Phase::ClusterFormation);
        add_node(&f.store, "node-3", 3, Phase::Installation);

        let outcome = f.coordinator.node_ready("node-1").await.unwrap();
        assert_eq!(outcome, FormationOutcome::Waiting { ready: 2, required: 3 });
        assert!(f.api.calls().is_empty());

        f.coordinator
            .tracker
            .report("node-3", Phase::Installation, nodeforge_state::EventStatus::Completed, "")
            .unwrap();
        let outcome = f.coordinator.node_ready("node-3").await.unwrap();
        assert_eq!(
            outcome,
            FormationOutcome::Formed {
                entry_point: "node-1".to_string(),
                members: vec!["node-1".into(), "node-2".into(), "node-3".into()],
            }
        );
        assert_eq!(f.api.calls(), vec!["create hci-a via 10.10.0.11 (3 members)".to_string()]);

        let cluster = f.store.get_cluster("hci-a").unwrap().unwrap();
        assert_eq!(cluster.status, ClusterStatus::Formed);
        assert_eq!(cluster.entry_point.as_deref(), Some("node-1"));
        assert_eq!(cluster.member("node-1").unwrap().kind, Some(MemberKind::EntryPoint));
        assert_eq!(cluster.member("node-2").unwrap().kind, Some(MemberKind::Joining));
        for i in 1..=3 {
            assert_eq!(status(&f.store, &format!("node-{i}")), Phase::DnsRegistration);
        }

        // Later readiness ticks do not form again.
        f.coordinator.node_ready("node-2").await.unwrap();
        assert_eq!(f.api.calls().len(), 1);
    }

    #[tokio::test]
    async fn late_member_joins_through_entry_point() {
        let api = ScriptedApi {
            healthy_after: Some(1),
            ..ScriptedApi::default()
        };
        let f = fixture(api, |_| {});
        three_member_cluster(&f).await;
        for i in 1..=3 {
            add_node(&f.store, &format!("node-{i}"), i, Phase::ClusterFormation);
        }
        f.coordinator.node_ready("node-1").await.unwrap();

        add_node(&f.store, "node-4", 4, Phase::ClusterFormation);
        f.coordinator.add_member("hci-a", "node-4").unwrap();
        let outcome = f.coordinator.node_ready("node-4").await.unwrap();
        assert_eq!(outcome, FormationOutcome::Joined { node: "node-4".to_string() });
        assert_eq!(
            f.api.calls().last().unwrap(),
            "join node-4 to hci-a via 10.10.0.11"
        );
        assert_eq!(status(&f.store, "node-4"), Phase::DnsRegistration);
    }

    #[tokio::test]
    async fn formation_timeout_fails_cluster_without_rollback() {
        let f = fixture(ScriptedApi::default(), |_| {});
        three_member_cluster(&f).await;
        for i in 1..=3 {
            add_node(&f.store, &format!("node-{i}"), i, Phase::ClusterFormation);
        }

        let outcome = f.coordinator.node_ready("node-2").await.unwrap();
        assert!(matches!(outcome, FormationOutcome::Failed { .. }));
        let cluster = f.store.get_cluster("hci-a").unwrap().unwrap();
        assert_eq!(cluster.status, ClusterStatus::Failed);
        assert!(cluster.message.unwrap().contains("not healthy"));
        for i in 1..=3 {
            let node = f.store.get_node(&format!("node-{i}")).unwrap().unwrap();
            assert_eq!(node.status, Phase::ClusterFormation);
            assert!(node.failure.unwrap().contains("not healthy"));
        }
        // No cleanup ran: the VIP record and reservation are still there.
        assert_eq!(f.sim.dns_record_count(), 1);

        // Readiness ticks against the failed cluster change nothing.
        let outcome = f.coordinator.node_ready("node-1").await.unwrap();
        assert!(matches!(outcome, FormationOutcome::Failed { .. }));
        assert_eq!(status(&f.store, "node-1"), Phase::ClusterFormation);
        assert_eq!(f.api.calls().len(), 1);
    }

    #[tokio::test]
    async fn failed_formation_can_be_retried() {
        let api = ScriptedApi {
            healthy_after: Some(1),
            failing_creates: Mutex::new(1),
            ..ScriptedApi::default()
        };
        let f = fixture(api, |_| {});
        three_member_cluster(&f).await;
        for i in 1..=3 {
            add_node(&f.store, &format!("node-{i}"), i, Phase::ClusterFormation);
        }
        let outcome = f.coordinator.node_ready("node-1").await.unwrap();
        assert!(matches!(outcome, FormationOutcome::Failed { .. }));
        assert_eq!(
            f.store.get_cluster("hci-a").unwrap().unwrap().status,
            ClusterStatus::Failed
        );

        let outcome = f.coordinator.retry_formation("hci-a").await.unwrap();
        assert!(matches!(outcome, FormationOutcome::Formed { .. }));
        assert_eq!(f.api.calls().len(), 2);
        let cluster = f.store.get_cluster("hci-a").unwrap().unwrap();
        assert_eq!(cluster.status, ClusterStatus::Formed);
        assert!(cluster.message.is_none());
        for i in 1..=3 {
            let node = f.store.get_node(&format!("node-{i}")).unwrap().unwrap();
            assert_eq!(node.status, Phase::DnsRegistration);
            assert!(node.failure.is_none());
        }

        let err = f.coordinator.retry_formation("hci-a").await.unwrap_err();
        assert!(matches!(err, ClusterError::InvalidRequest(_)));
        let err = f.coordinator.retry_formation("nope").await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_failure_rolls_members_back_when_configured() {
        let api = ScriptedApi {
            failing_creates: Mutex::new(1),
            ..ScriptedApi::default()
        };
        let f = fixture(api, |c| {
            c.cluster.rollback_members_on_failure = true;
            c.cluster.min_members = 1;
        });
        f.coordinator
            .register("hci-a", &["node-1".to_string()], None)
            .await
            .unwrap();
        add_node(&f.store, "node-1", 1, Phase::ClusterFormation);

        let outcome = f.coordinator.node_ready("node-1").await.unwrap();
        assert!(matches!(outcome, FormationOutcome::Failed { .. }));
        assert_eq!(status(&f.store, "node-1"), Phase::Cleaned);
    }

    #[tokio::test]
    async fn nodes_outside_formation_are_skipped() {
        let f = fixture(ScriptedApi::default(), |_| {});
        three_member_cluster(&f).await;
        add_node(&f.store, "node-1", 1, Phase::ImageDownload);
        assert_eq!(
            f.coordinator.node_ready("node-1").await.unwrap(),
            FormationOutcome::Skipped
        );
        assert_eq!(
            f.coordinator.node_ready("ghost").await.unwrap(),
            FormationOutcome::Skipped
        );
    }
}
