//! The orchestrator facade.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use nodeforge_boot::{BootConfigGenerator, BootError, BootPointer, InstallConfig};
use nodeforge_cloud::{CloudClient, CloudProvider, RetryConfig, build_provider};
use nodeforge_cluster::{ClusterApi, ClusterCoordinator, FormationOutcome, HttpClusterApi};
use nodeforge_core::ForgeConfig;
use nodeforge_monitor::{
    DeploymentMonitor, FailureCallback, HttpProbe, NodeFailure, NodeProbe, ReadyCallback,
};
use nodeforge_provision::{
    CleanupService, CleanupSummary, CleanupValidation, DnsRegistrar, NodeProvisioner,
    ProvisionReceipt, ProvisionRequest, ResourceAllocator, ResourceSet, cleanup_script,
};
use nodeforge_state::{
    Cluster, ClusterAssociation, ClusterIntent, ClusterStatus, DeploymentEvent, EventStatus, Node,
    Phase, StateStore, now_millis,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ForgeError, ForgeResult};
use crate::status::{DeploymentCleanup, DeploymentSummary, NodeStatus, PhaseAck};

/// How the members of a cluster request enter the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormationMode {
    /// A new cluster: VIP, quorum, one create call.
    Create,
    /// Extend an existing cluster; each member joins through its entry point.
    Join,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRequest {
    pub name: String,
    /// Node names. They may be provisioned before or after the request.
    #[serde(default)]
    pub members: Vec<String>,
    pub mode: FormationMode,
    /// Ready members required before formation; defaults to
    /// `cluster.min_members`.
    #[serde(default)]
    pub min_members: Option<u32>,
}

impl ClusterRequest {
    pub fn create<S: Into<String>>(name: impl Into<String>, members: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            members: members.into_iter().map(Into::into).collect(),
            mode: FormationMode::Create,
            min_members: None,
        }
    }

    pub fn join<S: Into<String>>(name: impl Into<String>, members: impl IntoIterator<Item = S>) -> Self {
        Self {
            mode: FormationMode::Join,
            ..Self::create(name, members)
        }
    }
}

/// Assembles an [`Orchestrator`]. Unset collaborators are built from the
/// configuration.
pub struct OrchestratorBuilder {
    store: StateStore,
    config: ForgeConfig,
    provider: Option<Arc<dyn CloudProvider>>,
    retry: Option<RetryConfig>,
    probe: Option<Arc<dyn NodeProbe>>,
    cluster_api: Option<Arc<dyn ClusterApi>>,
    poll_interval: Option<Duration>,
    health_poll_interval: Option<Duration>,
}

impl OrchestratorBuilder {
    pub fn provider(mut self, provider: Arc<dyn CloudProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn NodeProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn cluster_api(mut self, api: Arc<dyn ClusterApi>) -> Self {
        self.cluster_api = Some(api);
        self
    }

    /// Monitor tick, overriding `service.poll_interval_secs`.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Cluster health poll, overriding `cluster.health_poll_interval_secs`.
    pub fn health_poll_interval(mut self, interval: Duration) -> Self {
        self.health_poll_interval = Some(interval);
        self
    }

    pub fn build(self) -> ForgeResult<Orchestrator> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let store = self.store;

        let provider = match self.provider {
            Some(provider) => provider,
            None => build_provider(&config.provider)?,
        };
        let cloud = match self.retry {
            Some(retry) => CloudClient::new(provider, retry, config.call_timeout()),
            None => CloudClient::from_config(provider, &config.provider),
        };

        let cleanup = CleanupService::new(store.clone(), cloud.clone(), config.clone());

        let api: Arc<dyn ClusterApi> = self.cluster_api.unwrap_or_else(|| {
            Arc::new(HttpClusterApi::new(
                config.cluster.management_port,
                config.call_timeout(),
            ))
        });
        let mut coordinator = ClusterCoordinator::new(
            store.clone(),
            config.clone(),
            api,
            ResourceAllocator::new(store.clone(), cloud.clone(), config.clone()),
            DnsRegistrar::new(store.clone(), cloud.clone(), config.clone()),
            cleanup.clone(),
        );
        if let Some(interval) = self.health_poll_interval {
            coordinator = coordinator.with_health_poll_interval(interval);
        }

        let probe: Arc<dyn NodeProbe> = self
            .probe
            .unwrap_or_else(|| Arc::new(HttpProbe::new(&config.health)));
        let mut monitor = DeploymentMonitor::new(store.clone(), cloud.clone(), config.clone(), probe)
            .with_failure_callback(failure_callback(
                cleanup.clone(),
                config.policy.rollback_on_phase_timeout,
            ))
            .with_ready_callback(ready_callback(coordinator.clone()));
        if let Some(interval) = self.poll_interval {
            monitor = monitor.with_interval(interval);
        }

        let provisioner = NodeProvisioner::new(store.clone(), cloud.clone(), config.clone())
            .with_monitor(monitor.clone());
        let boot = Arc::new(BootConfigGenerator::new(store.clone(), config.clone())?);

        info!(
            ranges = config.ranges.len(),
            profiles = config.profiles.len(),
            provider = ?config.provider.kind,
            "orchestrator ready"
        );
        Ok(Orchestrator {
            store,
            config,
            monitor,
            provisioner,
            boot,
            coordinator,
            cleanup,
        })
    }
}

/// Roll back a node the monitor failed, if policy allows.
fn failure_callback(cleanup: CleanupService, rollback: bool) -> FailureCallback {
    Arc::new(move |failure: NodeFailure| {
        let cleanup = cleanup.clone();
        Box::pin(async move {
            if !rollback {
                info!(
                    node = %failure.node,
                    phase = %failure.phase,
                    reason = ?failure.reason,
                    "node failed, rollback disabled by policy"
                );
                return;
            }
            warn!(
                node = %failure.node,
                phase = %failure.phase,
                reason = ?failure.reason,
                message = %failure.message,
                "node failed, rolling back"
            );
            spawn_rollback(&cleanup, &failure.node);
        })
    })
}

/// Hand nodes waiting in `cluster_formation` to the coordinator.
fn ready_callback(coordinator: ClusterCoordinator) -> ReadyCallback {
    Arc::new(move |node: String| {
        let coordinator = coordinator.clone();
        Box::pin(async move {
            // Formation can outlast many monitor ticks.
            tokio::spawn(async move {
                match coordinator.node_ready(&node).await {
                    Ok(FormationOutcome::Formed { entry_point, members }) => {
                        info!(%node, %entry_point, members = members.len(), "cluster formed");
                    }
                    Ok(outcome) => debug!(%node, ?outcome, "cluster readiness handled"),
                    Err(e) => warn!(%node, error = %e, "cluster formation step failed"),
                }
            });
        })
    })
}

fn spawn_rollback(cleanup: &CleanupService, node: &str) {
    let handle = cleanup.cleanup_node_async(node);
    let node = node.to_string();
    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(summary)) => info!(%node, result = %summary.describe(), "rollback finished"),
            Ok(Err(e)) => warn!(%node, error = %e, "rollback failed"),
            Err(e) => warn!(%node, error = %e, "rollback task panicked"),
        }
    });
}

fn boot_error(e: BootError) -> ForgeError {
    match e {
        BootError::UnknownAddress(address) => ForgeError::UnknownAddress(address),
        other => other.into(),
    }
}

/// Every operation NodeForge exposes, over one shared store and config.
#[derive(Clone)]
pub struct Orchestrator {
    store: StateStore,
    config: Arc<ForgeConfig>,
    monitor: DeploymentMonitor,
    provisioner: NodeProvisioner,
    boot: Arc<BootConfigGenerator>,
    coordinator: ClusterCoordinator,
    cleanup: CleanupService,
}

impl Orchestrator {
    pub fn builder(store: StateStore, config: ForgeConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            config,
            provider: None,
            retry: None,
            probe: None,
            cluster_api: None,
            poll_interval: None,
            health_poll_interval: None,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    pub fn monitor(&self) -> &DeploymentMonitor {
        &self.monitor
    }

    /// Restart monitoring of every unsettled node.
    pub async fn resume(&self) -> ForgeResult<usize> {
        Ok(self.monitor.resume_all().await?)
    }

    pub async fn shutdown(&self) {
        self.monitor.stop_all().await;
    }

    // ── Provisioning ──────────────────────────────────────────────

    /// Provision a node. Returns once the server is requested; the
    /// deployment monitor takes it from there.
    pub async fn create_node(&self, mut request: ProvisionRequest) -> ForgeResult<ProvisionReceipt> {
        match request.cluster.take() {
            Some(mut association) => {
                let cluster = self.cluster(&association.cluster)?;
                match cluster.status {
                    ClusterStatus::Failed => {
                        return Err(ForgeError::InvalidRequest(format!(
                            "cluster {} has failed",
                            cluster.name
                        )));
                    }
                    // Someone already created it: this node can only join.
                    ClusterStatus::Forming | ClusterStatus::Formed
                        if association.intent == ClusterIntent::Create =>
                    {
                        debug!(node = %request.name, cluster = %cluster.name, "cluster exists, joining instead");
                        association.intent = ClusterIntent::Join;
                    }
                    _ => {}
                }
                request.cluster = Some(association);
            }
            None => request.cluster = self.listed_membership(&request.name)?,
        }

        let association = request.cluster.clone();
        let receipt = self.provisioner.provision(request).await?;
        if let Some(association) = association
            && let Err(e) = self.coordinator.add_member(&association.cluster, &receipt.node)
        {
            warn!(node = %receipt.node, cluster = %association.cluster, error = %e, "could not list cluster member");
        }
        Ok(receipt)
    }

    /// The cluster that already lists `node`, if any.
    fn listed_membership(&self, node: &str) -> ForgeResult<Option<ClusterAssociation>> {
        for cluster in self.store.list_clusters()? {
            if cluster.member(node).is_some() {
                let intent = match cluster.status {
                    ClusterStatus::Pending => ClusterIntent::Create,
                    _ => ClusterIntent::Join,
                };
                return Ok(Some(ClusterAssociation {
                    cluster: cluster.name,
                    intent,
                }));
            }
        }
        Ok(None)
    }

    pub fn get_node(&self, name: &str) -> ForgeResult<Node> {
        self.store
            .get_node(name)?
            .ok_or_else(|| ForgeError::NodeNotFound(name.to_string()))
    }

    pub fn list_nodes(&self) -> ForgeResult<Vec<Node>> {
        Ok(self.store.list_nodes()?)
    }

    /// Create a cluster, or extend one, from node names.
    pub async fn create_cluster(&self, request: ClusterRequest) -> ForgeResult<Cluster> {
        let mut seen = HashSet::new();
        if let Some(dup) = request.members.iter().find(|m| !seen.insert(m.as_str())) {
            return Err(ForgeError::InvalidRequest(format!("member {dup} listed twice")));
        }
        for member in &request.members {
            if let Some(node) = self.store.get_node(member)? {
                self.check_joinable(&node, &request.name)?;
            }
        }

        let intent = match request.mode {
            FormationMode::Create => {
                self.coordinator
                    .register(&request.name, &request.members, request.min_members)
                    .await?;
                ClusterIntent::Create
            }
            FormationMode::Join => {
                let cluster = self.cluster(&request.name)?;
                if cluster.status == ClusterStatus::Failed {
                    return Err(ForgeError::InvalidRequest(format!(
                        "cluster {} has failed",
                        cluster.name
                    )));
                }
                for member in &request.members {
                    self.coordinator.add_member(&request.name, member)?;
                }
                ClusterIntent::Join
            }
        };

        for member in &request.members {
            let association = ClusterAssociation {
                cluster: request.name.clone(),
                intent,
            };
            self.store.update_node(member, |n| {
                n.cluster = Some(association);
                true
            })?;
        }
        info!(cluster = %request.name, mode = ?request.mode, members = request.members.len(), "cluster requested");
        self.cluster(&request.name)
    }

    /// A node may be listed while it is still installing and not bound
    /// to another cluster.
    fn check_joinable(&self, node: &Node, cluster: &str) -> ForgeResult<()> {
        if node.status.is_terminal() || node.status.index() > Phase::Installation.index() {
            return Err(ForgeError::InvalidRequest(format!(
                "node {} is {} and can no longer join a cluster",
                node.name, node.status
            )));
        }
        if let Some(current) = &node.cluster
            && current.cluster != cluster
        {
            return Err(ForgeError::InvalidRequest(format!(
                "node {} already belongs to cluster {}",
                node.name, current.cluster
            )));
        }
        Ok(())
    }

    fn cluster(&self, name: &str) -> ForgeResult<Cluster> {
        self.store
            .get_cluster(name)?
            .ok_or_else(|| ForgeError::ClusterNotFound(name.to_string()))
    }

    pub fn get_cluster(&self, name: &str) -> ForgeResult<Cluster> {
        self.cluster(name)
    }

    /// Form a failed cluster again with the members still waiting in
    /// `cluster_formation`.
    pub async fn retry_cluster(&self, name: &str) -> ForgeResult<Cluster> {
        let outcome = self.coordinator.retry_formation(name).await?;
        info!(cluster = name, ?outcome, "cluster formation retried");
        self.cluster(name)
    }

    pub fn list_clusters(&self) -> ForgeResult<Vec<Cluster>> {
        Ok(self.store.list_clusters()?)
    }

    // ── Boot time ─────────────────────────────────────────────────

    pub fn boot_pointer(&self, address: &str) -> ForgeResult<BootPointer> {
        self.boot.boot_pointer(address).map_err(boot_error)
    }

    pub fn install_config(&self, address: &str) -> ForgeResult<InstallConfig> {
        self.boot.install_config(address).map_err(boot_error)
    }

    /// A phase report from the node presenting `address`.
    pub fn report_phase(
        &self,
        address: &str,
        phase: Phase,
        status: EventStatus,
        message: &str,
    ) -> ForgeResult<PhaseAck> {
        let node = self
            .store
            .find_node_by_address(address)?
            .ok_or_else(|| ForgeError::UnknownAddress(address.to_string()))?;
        let transition = self
            .monitor
            .tracker()
            .report(&node.name, phase, status, message)?;

        if transition.applied() && transition.node.status == Phase::Failed {
            if self.config.policy.rollback_on_install_failure {
                warn!(node = %node.name, %phase, "node reported failure, rolling back");
                spawn_rollback(&self.cleanup, &node.name);
            } else {
                info!(node = %node.name, %phase, "node reported failure, left in place");
            }
        }

        Ok(PhaseAck {
            node: node.name,
            applied: transition.applied(),
            status: transition.node.status,
            progress: transition.node.progress,
        })
    }

    // ── Status ────────────────────────────────────────────────────

    pub async fn node_status(&self, name: &str) -> ForgeResult<NodeStatus> {
        let node = self.get_node(name)?;
        let monitored = self.monitor.is_monitoring(name).await;
        Ok(NodeStatus::new(node, monitored))
    }

    pub fn node_history(&self, name: &str) -> ForgeResult<Vec<DeploymentEvent>> {
        self.get_node(name)?;
        Ok(self.store.list_events_for_node(name)?)
    }

    pub async fn deployment_summary(&self) -> ForgeResult<DeploymentSummary> {
        let mut summary = DeploymentSummary::default();
        for node in self.store.list_nodes()? {
            summary.count_node(&node);
        }
        summary.monitored = self.monitor.active_monitors().await.len();
        summary.reserved_addresses = self.store.list_addresses()?.len();
        summary.dns_records = self.store.list_dns_records()?.len();
        summary.attachments = self.store.list_attachments()?.len();
        summary.clusters = self.store.list_clusters()?.iter().map(Into::into).collect();
        Ok(summary)
    }

    // ── Cleanup ───────────────────────────────────────────────────

    /// Delete everything a node owns and stop watching it.
    pub async fn cleanup_node(&self, name: &str) -> ForgeResult<CleanupSummary> {
        self.get_node(name)?;
        self.monitor.stop(name).await;
        Ok(self.cleanup.cleanup_node(name).await?)
    }

    /// Clean up every member of `cluster`, then its VIP.
    pub async fn cleanup_deployment(&self, cluster: &str) -> ForgeResult<DeploymentCleanup> {
        let snapshot = self.cluster(cluster)?;
        warn!(cluster, members = snapshot.members.len(), "cleaning up deployment");

        let mut members = Vec::with_capacity(snapshot.members.len());
        for member in &snapshot.members {
            if self.store.get_node(&member.node)?.is_none() {
                debug!(cluster, node = %member.node, "member was never provisioned");
                continue;
            }
            members.push(self.cleanup_node(&member.node).await?);
        }
        let vip = self.cleanup.cleanup_owner(cluster).await?;

        let result = DeploymentCleanup {
            cluster: cluster.to_string(),
            members,
            vip,
        };
        info!(cluster, complete = result.is_complete(), "deployment cleanup finished");
        Ok(result)
    }

    /// Sweep resources whose owner is gone or stuck for longer than
    /// `threshold` (default `service.orphan_age_threshold_secs`).
    pub async fn cleanup_orphans(&self, threshold: Option<Duration>) -> ForgeResult<Vec<CleanupSummary>> {
        let threshold = threshold.unwrap_or_else(|| self.config.orphan_age_threshold());
        Ok(self.cleanup.cleanup_orphans(now_millis(), threshold).await?)
    }

    pub async fn validate_cleanup(&self, owner: &str) -> ForgeResult<CleanupValidation> {
        Ok(self.cleanup.validate(owner).await?)
    }

    /// A bash script deleting what `owner` still has tracked.
    pub fn cleanup_script(&self, owner: &str) -> ForgeResult<String> {
        let server_id = self.store.get_node(owner)?.and_then(|n| n.server_id);
        let resources = ResourceSet::tracked(&self.store, owner, server_id)?;
        Ok(cleanup_script(owner, &resources, &self.config))
    }
}
