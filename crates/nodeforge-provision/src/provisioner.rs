//! Node provisioner: the provisioning saga.

use std::sync::Arc;

use nodeforge_cloud::{CloudClient, ServerSpec};
use nodeforge_core::{ForgeConfig, ServerProfile};
use nodeforge_monitor::{DeploymentMonitor, PhaseTracker};
use nodeforge_state::{
    ClusterAssociation, ClusterRole, EventSource, Node, NodeAddresses, Phase, StateError,
    StateStore,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::allocator::ResourceAllocator;
use crate::cleanup::CleanupService;
use crate::dns::DnsRegistrar;
use crate::error::{ProvisionError, ProvisionResult};
use crate::netif::NetworkInterfaceManager;
use crate::saga::{Compensation, Saga};

/// What a caller asks for.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub name: String,
    pub profile: String,
    pub role: ClusterRole,
    pub cluster: Option<ClusterAssociation>,
    /// Data disks to hand to storage. Defaults to the profile's data disks.
    pub storage_devices: Option<Vec<String>>,
}

impl ProvisionRequest {
    pub fn new(name: impl Into<String>, profile: impl Into<String>, role: ClusterRole) -> Self {
        Self {
            name: name.into(),
            profile: profile.into(),
            role,
            cluster: None,
            storage_devices: None,
        }
    }

    pub fn with_cluster(mut self, cluster: ClusterAssociation) -> Self {
        self.cluster = Some(cluster);
        self
    }
}

/// Returned once the server has been requested.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReceipt {
    pub node: String,
    pub server_id: String,
    pub status: Phase,
    pub addresses: NodeAddresses,
    /// Whether a deployment monitor took the node over.
    pub monitored: bool,
}

/// The init payload every server boots with: chain-load the boot
/// descriptor for its management address.
pub fn boot_pointer_payload(public_base_url: &str, management_address: &str) -> String {
    format!(
        "#!ipxe\nchain {}/boot/ipxe?address={management_address}\n",
        public_base_url.trim_end_matches('/')
    )
}

fn valid_node_name(name: &str) -> bool {
    (1..=48).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

type StepError = (&'static str, ProvisionError);

fn at<E: Into<ProvisionError>>(step: &'static str) -> impl FnOnce(E) -> StepError {
    move |e| (step, e.into())
}

#[derive(Clone)]
pub struct NodeProvisioner {
    store: StateStore,
    cloud: CloudClient,
    config: Arc<ForgeConfig>,
    tracker: PhaseTracker,
    allocator: ResourceAllocator,
    dns: DnsRegistrar,
    netif: NetworkInterfaceManager,
    cleanup: CleanupService,
    monitor: Option<DeploymentMonitor>,
}

impl NodeProvisioner {
    pub fn new(store: StateStore, cloud: CloudClient, config: Arc<ForgeConfig>) -> Self {
        Self {
            tracker: PhaseTracker::new(store.clone()),
            allocator: ResourceAllocator::new(store.clone(), cloud.clone(), config.clone()),
            dns: DnsRegistrar::new(store.clone(), cloud.clone(), config.clone()),
            netif: NetworkInterfaceManager::new(store.clone(), cloud.clone(), config.clone()),
            cleanup: CleanupService::new(store.clone(), cloud.clone(), config.clone()),
            store,
            cloud,
            config,
            monitor: None,
        }
    }

    /// Hand nodes to `monitor` once their server is requested.
    pub fn with_monitor(mut self, monitor: DeploymentMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn allocator(&self) -> &ResourceAllocator {
        &self.allocator
    }

    pub fn dns(&self) -> &DnsRegistrar {
        &self.dns
    }

    pub fn cleanup(&self) -> &CleanupService {
        &self.cleanup
    }

    /// Reject requests that cannot succeed before anything is created.
    fn check(&self, request: &ProvisionRequest) -> ProvisionResult<&ServerProfile> {
        if !valid_node_name(&request.name) {
            return Err(ProvisionError::InvalidRequest(format!(
                "node name {:?} must be 1-48 lowercase letters, digits or dashes",
                request.name
            )));
        }
        let profile = self
            .config
            .profile(&request.profile)
            .ok_or_else(|| ProvisionError::UnknownProfile(request.profile.clone()))?;
        if !profile.roles.contains(&request.role) {
            return Err(ProvisionError::UnsupportedRole {
                profile: request.profile.clone(),
                role: request.role.as_str().to_string(),
            });
        }
        for role in request.role.address_roles() {
            if self.config.range_for(*role).is_none() {
                return Err(ProvisionError::NoRange(role.to_string()));
            }
        }
        if let Some(devices) = &request.storage_devices
            && let Some(bad) = devices.iter().find(|d| !d.starts_with("/dev/"))
        {
            return Err(ProvisionError::InvalidRequest(format!(
                "storage device {bad:?} is not a device path"
            )));
        }
        Ok(profile)
    }

    /// Provision a node up to the server request. On failure everything
    /// created so far is rolled back and the node is left `failed`.
    pub async fn provision(&self, request: ProvisionRequest) -> ProvisionResult<ProvisionReceipt> {
        let profile = self.check(&request)?;

        let mut node = Node::new(&request.name, &request.profile, request.role);
        node.cluster = request.cluster.clone();
        node.storage_devices = request
            .storage_devices
            .clone()
            .unwrap_or_else(|| profile.data_disks.clone());
        match self.store.create_node(&node) {
            Ok(()) => {}
            Err(StateError::AlreadyExists(_)) => {
                return Err(ProvisionError::NodeExists(request.name));
            }
            Err(e) => return Err(e.into()),
        }
        info!(node = %request.name, profile = %request.profile, role = request.role.as_str(), "provisioning node");

        let mut saga = Saga::new(&request.name);
        match self.run(&request, &mut saga).await {
            Ok(mut receipt) => {
                if let Some(monitor) = &self.monitor {
                    monitor.start(&receipt.node).await;
                    receipt.monitored = true;
                }
                Ok(receipt)
            }
            Err((step, error)) => Err(self.abort(&request.name, step, error, saga).await),
        }
    }

    async fn run(&self, request: &ProvisionRequest, saga: &mut Saga) -> Result<ProvisionReceipt, StepError> {
        let name = request.name.as_str();

        let mut reserved = Vec::new();
        for role in request.role.address_roles() {
            let reservation = self
                .allocator
                .reserve(name, *role)
                .await
                .map_err(at("reserve_address"))?;
            saga.record(Compensation::ReleaseAddress(reservation.clone()));

            let record = self
                .dns
                .register(&reservation)
                .await
                .map_err(at("register_dns"))?;
            saga.record(Compensation::DeleteDnsRecord(record));
            reserved.push(reservation);
        }

        let mut attachment_ids = Vec::with_capacity(reserved.len());
        for reservation in &reserved {
            let attachment = self
                .netif
                .attach(name, reservation)
                .await
                .map_err(at("attach_network"))?;
            attachment_ids.push(attachment.handle.clone());
            saga.record(Compensation::DeleteAttachment(attachment));
        }

        let mut addresses = NodeAddresses::default();
        for reservation in &reserved {
            addresses.set(reservation.role, reservation.address.as_str());
        }
        self.store
            .update_node(name, |n| {
                n.addresses = addresses.clone();
                true
            })
            .map_err(at("persist_addresses"))?;

        let management = addresses.management.clone().ok_or_else(|| {
            (
                "create_server",
                ProvisionError::InvalidRequest("no management address".to_string()),
            )
        })?;
        let spec = ServerSpec {
            name: name.to_string(),
            profile: request.profile.clone(),
            image: self.config.provider.image.clone(),
            attachments: attachment_ids,
            user_data: boot_pointer_payload(&self.config.service.public_base_url, &management),
        };
        let server = self
            .cloud
            .create_server(&spec)
            .await
            .map_err(at("create_server"))?;
        saga.record(Compensation::DeleteServer {
            server_id: server.id.clone(),
        });

        self.store
            .update_node(name, |n| {
                n.server_id = Some(server.id.clone());
                n.provider_status = Some(server.status.to_string());
                true
            })
            .map_err(at("persist_server"))?;
        let transition = self
            .tracker
            .enter(
                name,
                Phase::ServerRequested,
                EventSource::Provisioner,
                format!("server {} requested", server.id),
            )
            .map_err(at("persist_server"))?;

        Ok(ProvisionReceipt {
            node: name.to_string(),
            server_id: server.id,
            status: transition.node.status,
            addresses,
            monitored: false,
        })
    }

    async fn abort(&self, node: &str, step: &'static str, error: ProvisionError, saga: Saga) -> ProvisionError {
        warn!(node, step, %error, "provisioning failed, rolling back");
        if let Err(e) = self
            .tracker
            .fail(node, EventSource::Provisioner, format!("{step} failed: {error}"))
        {
            warn!(node, error = %e, "could not mark node failed");
        }
        let rollback = self.cleanup.rollback(saga).await;
        ProvisionError::Failed {
            node: node.to_string(),
            step: step.to_string(),
            source: Box::new(error),
            rollback: Box::new(rollback),
        }
    }
}
