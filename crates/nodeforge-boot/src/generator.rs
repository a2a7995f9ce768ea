//! Boot descriptor and install config rendering.

use std::sync::Arc;

use nodeforge_core::ForgeConfig;
use nodeforge_monitor::PhaseTracker;
use nodeforge_state::{
    AddressRole, ClusterIntent, EventSource, EventStatus, Node, Phase, StateStore,
};
use serde::Serialize;
use tera::{Context, Tera};
use tracing::{debug, info};

use crate::error::{BootError, BootResult};

const BOOT_TEMPLATE: &str = "boot.ipxe";

/// The rendered iPXE script for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootPointer {
    pub node: String,
    pub script: String,
    /// Where the node fetches its install config.
    pub config_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceConfig {
    pub role: AddressRole,
    pub address: String,
    pub netmask: String,
    pub gateway: Option<String>,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterSection {
    pub name: String,
    pub intent: ClusterIntent,
    pub vip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallerSection {
    pub version: String,
    pub image_url: String,
    pub foundation_image: String,
    pub hypervisor_image: String,
}

/// Everything the installer needs, served as one JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallConfig {
    pub node: String,
    pub role: String,
    pub profile: String,
    pub boot_disk: String,
    pub data_disks: Vec<String>,
    pub interfaces: Vec<InterfaceConfig>,
    pub cluster: Option<ClusterSection>,
    pub installer: InstallerSection,
    pub domain: String,
    /// Where the node posts its phase reports.
    pub report_url: String,
}

impl InstallConfig {
    pub fn to_json(&self) -> BootResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct BootConfigGenerator {
    store: StateStore,
    tracker: PhaseTracker,
    config: Arc<ForgeConfig>,
    tera: Tera,
}

impl BootConfigGenerator {
    pub fn new(store: StateStore, config: Arc<ForgeConfig>) -> BootResult<Self> {
        let mut tera = Tera::default();
        tera.add_raw_template(BOOT_TEMPLATE, include_str!("../templates/boot.ipxe"))?;
        Ok(Self {
            tracker: PhaseTracker::new(store.clone()),
            store,
            config,
            tera,
        })
    }

    fn base_url(&self) -> &str {
        self.config.service.public_base_url.trim_end_matches('/')
    }

    /// The node owning `address`, if it may still boot.
    fn bootable_node(&self, address: &str) -> BootResult<Node> {
        let node = self
            .store
            .find_node_by_address(address)?
            .ok_or_else(|| BootError::UnknownAddress(address.to_string()))?;
        if node.status.is_terminal() {
            return Err(BootError::NotBootable {
                node: node.name,
                phase: node.status.to_string(),
            });
        }
        Ok(node)
    }

    /// Render the iPXE descriptor for the node presenting `address`.
    pub fn boot_pointer(&self, address: &str) -> BootResult<BootPointer> {
        let node = self.bootable_node(address)?;
        let management = node
            .addresses
            .management
            .clone()
            .ok_or_else(|| BootError::MissingAddress(node.name.clone()))?;
        let range = self.config.range_for(AddressRole::Management);
        let config_url = format!("{}/boot/config?address={management}", self.base_url());

        let mut context = Context::new();
        context.insert("node", &node.name);
        context.insert("role", node.role.as_str());
        context.insert("hostname", &self.config.fqdn(&node.name));
        context.insert("management_address", &management);
        context.insert(
            "gateway",
            &range
                .and_then(|r| r.gateway)
                .map(|g| g.to_string())
                .unwrap_or_default(),
        );
        context.insert(
            "netmask",
            &range.map(|r| r.netmask().to_string()).unwrap_or_default(),
        );
        context.insert("kernel_url", &self.config.boot.kernel_url);
        context.insert("initrd_url", &self.config.boot.initrd_url);
        context.insert("image_url", &self.config.boot.image_url);
        context.insert("kernel_args", &self.config.boot.kernel_args);
        context.insert("config_url", &config_url);
        let script = self.tera.render(BOOT_TEMPLATE, &context)?;

        let transition = self.tracker.record_once(
            &node.name,
            Phase::IpxeBoot,
            EventStatus::Started,
            EventSource::Node,
            format!("boot descriptor served to {address}"),
        )?;
        if transition.applied() {
            info!(node = %node.name, %address, "boot descriptor served");
        } else {
            debug!(node = %node.name, %address, "boot descriptor served again");
        }

        Ok(BootPointer {
            node: node.name,
            script,
            config_url,
        })
    }

    /// Assemble the install document for the node presenting `address`.
    pub fn install_config(&self, address: &str) -> BootResult<InstallConfig> {
        let node = self.bootable_node(address)?;
        let profile = self
            .config
            .profile(&node.profile)
            .ok_or_else(|| BootError::UnknownProfile(node.profile.clone()))?;

        let interfaces = node
            .role
            .address_roles()
            .iter()
            .filter_map(|role| {
                let address = node.addresses.get(*role)?;
                let range = self.config.range_for(*role);
                Some(InterfaceConfig {
                    role: *role,
                    address: address.to_string(),
                    netmask: range.map(|r| r.netmask().to_string()).unwrap_or_default(),
                    gateway: range.and_then(|r| r.gateway).map(|g| g.to_string()),
                    hostname: self
                        .config
                        .fqdn(&format!("{}-{}", node.name, role.label())),
                })
            })
            .collect();

        let cluster = match &node.cluster {
            Some(association) => Some(ClusterSection {
                name: association.cluster.clone(),
                intent: association.intent,
                vip: self
                    .store
                    .get_cluster(&association.cluster)?
                    .and_then(|c| c.vip),
            }),
            None => None,
        };

        let data_disks = if node.storage_devices.is_empty() {
            profile.data_disks.clone()
        } else {
            node.storage_devices.clone()
        };

        let document = InstallConfig {
            node: node.name.clone(),
            role: node.role.as_str().to_string(),
            profile: node.profile.clone(),
            boot_disk: profile.boot_disk.clone(),
            data_disks,
            interfaces,
            cluster,
            installer: InstallerSection {
                version: self.config.boot.installer_version.clone(),
                image_url: self.config.boot.image_url.clone(),
                foundation_image: self.config.boot.foundation_image.clone(),
                hypervisor_image: self.config.boot.hypervisor_image.clone(),
            },
            domain: self.config.dns.domain.clone(),
            report_url: format!("{}/api/v1/phase", self.base_url()),
        };

        let transition = self.tracker.record_once(
            &node.name,
            Phase::ConfigDownload,
            EventStatus::Started,
            EventSource::Node,
            format!("install config served to {address}"),
        )?;
        if transition.applied() {
            info!(node = %node.name, %address, "install config served");
        }
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_state::{ClusterAssociation, ClusterRole, NodeAddresses, ReservedAddress};

    fn setup() -> BootConfigGenerator {
        let store = StateStore::open_in_memory().unwrap();
        let mut node = Node::new("node-1", "bx2d-metal-96x384", ClusterRole::ComputeStorage);
        node.status = Phase::ServerRunning;
        node.addresses = NodeAddresses {
            management: Some("10.10.0.10".to_string()),
            hypervisor: Some("10.10.1.10".to_string()),
            controller_vm: Some("10.10.2.10".to_string()),
            workload: Some("10.10.3.10".to_string()),
        };
        node.cluster = Some(ClusterAssociation {
            cluster: "hci-a".to_string(),
            intent: ClusterIntent::Join,
        });
        store.create_node(&node).unwrap();
        store
            .put_address(&ReservedAddress {
                owner: "node-1".to_string(),
                role: AddressRole::Management,
                address: "10.10.0.10".to_string(),
                subnet: "subnet-mgmt".to_string(),
                handle: Some("rip-1".to_string()),
                claimed_at: 0,
            })
            .unwrap();

        let mut config = ForgeConfig::sample();
        config.boot.kernel_args = vec!["console=ttyS0".to_string()];
        BootConfigGenerator::new(store, Arc::new(config)).unwrap()
    }

    fn phase(generator: &BootConfigGenerator) -> Phase {
        generator.store.get_node("node-1").unwrap().unwrap().status
    }

    #[test]
    fn boot_pointer_renders_kernel_line() {
        let generator = setup();
        let pointer = generator.boot_pointer("10.10.0.10").unwrap();

        assert!(pointer.script.starts_with("#!ipxe"));
        assert!(pointer.script.contains("ip=10.10.0.10::10.10.0.1:255.255.255.0:node-1.nodeforge.local::none"));
        assert!(pointer.script.contains("nodeforge.config=http://127.0.0.1:8080/boot/config?address=10.10.0.10"));
        assert!(pointer.script.contains(" console=ttyS0"));
        assert!(pointer.script.contains("initrd http://127.0.0.1:8080/images/initrd.img"));
        assert_eq!(phase(&generator), Phase::IpxeBoot);
    }

    #[test]
    fn repeated_boot_requests_record_once() {
        let generator = setup();
        let first = generator.boot_pointer("10.10.0.10").unwrap();
        let second = generator.boot_pointer("10.10.0.10").unwrap();
        assert_eq!(first, second);

        let events = generator.store.list_events_for_node("node-1").unwrap();
        assert_eq!(events.iter().filter(|e| e.phase == Phase::IpxeBoot).count(), 1);
    }

    #[test]
    fn any_owned_address_resolves_the_node() {
        let generator = setup();
        let pointer = generator.boot_pointer("10.10.1.10").unwrap();
        assert_eq!(pointer.node, "node-1");
    }

    #[test]
    fn unknown_address() {
        let generator = setup();
        let err = generator.boot_pointer("10.99.0.1").unwrap_err();
        assert!(matches!(err, BootError::UnknownAddress(_)));
    }

    #[test]
    fn install_config_combines_profile_and_node() {
        let generator = setup();
        let doc = generator.install_config("10.10.0.10").unwrap();

        assert_eq!(doc.boot_disk, "/dev/sda");
        assert_eq!(doc.data_disks.len(), 8);
        assert_eq!(doc.interfaces.len(), 4);
        assert_eq!(doc.interfaces[2].role, AddressRole::ControllerVm);
        assert_eq!(doc.interfaces[2].hostname, "node-1-cvm.nodeforge.local");
        let cluster = doc.cluster.as_ref().unwrap();
        assert_eq!(cluster.intent, ClusterIntent::Join);
        assert_eq!(doc.report_url, "http://127.0.0.1:8080/api/v1/phase");
        assert_eq!(phase(&generator), Phase::ConfigDownload);

        let json: serde_json::Value = serde_json::from_str(&doc.to_json().unwrap()).unwrap();
        assert_eq!(json["cluster"]["intent"], "join");
    }

    #[test]
    fn late_requests_never_regress() {
        let generator = setup();
        generator
            .tracker
            .report("node-1", Phase::ImageDownload, EventStatus::InProgress, "")
            .unwrap();

        generator.boot_pointer("10.10.0.10").unwrap();
        generator.install_config("10.10.0.10").unwrap();
        assert_eq!(phase(&generator), Phase::ImageDownload);
    }

    #[test]
    fn failed_node_cannot_boot() {
        let generator = setup();
        generator
            .tracker
            .fail("node-1", EventSource::Monitor, "timed out")
            .unwrap();
        let err = generator.install_config("10.10.0.10").unwrap_err();
        assert!(matches!(err, BootError::NotBootable { .. }));
    }
}
