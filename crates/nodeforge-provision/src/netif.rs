//! Network interface manager: binds reserved addresses to the server.

use std::sync::Arc;

use nodeforge_cloud::{AttachmentSpec, CloudClient, CloudError};
use nodeforge_core::ForgeConfig;
use nodeforge_state::{NetworkAttachment, ReservedAddress, StateStore, now_millis};
use tracing::info;

use crate::error::ProvisionResult;

#[derive(Clone)]
pub struct NetworkInterfaceManager {
    store: StateStore,
    cloud: CloudClient,
    config: Arc<ForgeConfig>,
}

impl NetworkInterfaceManager {
    pub fn new(store: StateStore, cloud: CloudClient, config: Arc<ForgeConfig>) -> Self {
        Self {
            store,
            cloud,
            config,
        }
    }

    /// Create an attachment in the reservation's subnet, bound to its address.
    pub async fn attach(
        &self,
        node: &str,
        reservation: &ReservedAddress,
    ) -> ProvisionResult<NetworkAttachment> {
        let spec = AttachmentSpec {
            name: format!("{node}-{}", reservation.role.label()),
            subnet: reservation.subnet.clone(),
            reservation_id: reservation.handle.clone(),
            address: reservation.address.clone(),
            security_groups: self.config.provider.security_groups.clone(),
        };
        let created = self.cloud.create_attachment(&spec).await?;

        let attachment = NetworkAttachment {
            node: node.to_string(),
            role: reservation.role,
            handle: created.id,
            address: reservation.address.clone(),
            subnet: reservation.subnet.clone(),
            security_groups: spec.security_groups,
            created_at: now_millis(),
        };
        self.store.put_attachment(&attachment)?;
        info!(node, role = %attachment.role, handle = %attachment.handle, "network attachment created");
        Ok(attachment)
    }

    /// Delete the attachment upstream and drop the local row. Returns
    /// `false` if the provider no longer had it.
    pub async fn detach(&self, attachment: &NetworkAttachment) -> ProvisionResult<bool> {
        let deleted = match self.cloud.delete_attachment(&attachment.handle).await {
            Ok(()) => true,
            Err(CloudError::NotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };
        self.store
            .delete_attachment(&attachment.node, &attachment.handle)?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_cloud::{RetryConfig, SimulatedCloud};
    use nodeforge_state::AddressRole;
    use std::time::Duration;

    #[tokio::test]
    async fn attach_binds_reservation() {
        let sim = Arc::new(SimulatedCloud::new());
        let store = StateStore::open_in_memory().unwrap();
        let cloud = CloudClient::new(sim.clone(), RetryConfig::none(), Duration::from_secs(5));
        let netif = NetworkInterfaceManager::new(store.clone(), cloud, Arc::new(ForgeConfig::sample()));

        let reservation = ReservedAddress {
            owner: "node-1".to_string(),
            role: AddressRole::Hypervisor,
            address: "10.10.1.10".to_string(),
            subnet: "subnet-hv".to_string(),
            handle: Some("rip-7".to_string()),
            claimed_at: 0,
        };
        let attachment = netif.attach("node-1", &reservation).await.unwrap();
        assert_eq!(attachment.address, "10.10.1.10");
        assert_eq!(attachment.security_groups, vec!["hci-default".to_string()]);
        assert_eq!(sim.attachment_count(), 1);

        assert!(netif.detach(&attachment).await.unwrap());
        assert!(!netif.detach(&attachment).await.unwrap());
        assert_eq!(sim.attachment_count(), 0);
        assert!(store.list_attachments_for_node("node-1").unwrap().is_empty());
    }
}
