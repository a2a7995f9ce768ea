//! Resource allocator: reserves addresses from the configured ranges.
//!
//! A reservation is claimed locally before the provider is asked, so two
//! concurrent requests never pick the same address. The local claim is
//! released again whenever the provider call does not succeed, unless the
//! provider may still hold the address and that could not be undone.

use std::collections::HashSet;
use std::sync::Arc;

use nodeforge_cloud::{CloudClient, CloudError};
use nodeforge_core::ForgeConfig;
use nodeforge_state::{AddressRole, ReservedAddress, StateStore, now_millis};
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, ProvisionResult};

/// Name the provider reservation carries, used to find it again.
fn reservation_name(owner: &str, role: AddressRole) -> String {
    format!("{owner}-{}", role.label())
}

#[derive(Clone)]
pub struct ResourceAllocator {
    store: StateStore,
    cloud: CloudClient,
    config: Arc<ForgeConfig>,
}

impl ResourceAllocator {
    pub fn new(store: StateStore, cloud: CloudClient, config: Arc<ForgeConfig>) -> Self {
        Self {
            store,
            cloud,
            config,
        }
    }

    /// Reserve the lowest free address of `role`'s range for `owner`.
    pub async fn reserve(&self, owner: &str, role: AddressRole) -> ProvisionResult<ReservedAddress> {
        let range = self
            .config
            .range_for(role)
            .ok_or_else(|| ProvisionError::NoRange(role.to_string()))?;
        let subnet = range.subnet.as_str();

        let mut taken: HashSet<String> = self
            .cloud
            .list_reserved_addresses(subnet)
            .await?
            .into_iter()
            .map(|r| r.address)
            .collect();
        taken.extend(
            self.store
                .list_addresses_in_subnet(subnet)?
                .into_iter()
                .map(|r| r.address),
        );

        let name = reservation_name(owner, role);
        for candidate in range.addresses() {
            let address = candidate.to_string();
            if taken.contains(&address) {
                continue;
            }

            let mut claim = ReservedAddress {
                owner: owner.to_string(),
                role,
                address: address.clone(),
                subnet: subnet.to_string(),
                handle: None,
                claimed_at: now_millis(),
            };
            if !self.store.claim_address(&claim)? {
                debug!(%address, subnet, "address claimed concurrently, trying next");
                continue;
            }

            match self.cloud.reserve_address(subnet, &address, &name).await {
                Ok(reservation) => {
                    claim.handle = Some(reservation.id);
                    self.store.put_address(&claim)?;
                    info!(owner, %role, %address, subnet, "address reserved");
                    return Ok(claim);
                }
                Err(CloudError::Conflict(reason)) => {
                    debug!(%address, subnet, %reason, "address taken upstream, trying next");
                    self.store.delete_address(subnet, &address)?;
                }
                Err(e) if e.is_ambiguous() => {
                    warn!(owner, %role, %address, error = %e, "address reservation unanswered");
                    match self.release_upstream(subnet, &address, &name).await {
                        Ok(_) => {
                            self.store.delete_address(subnet, &address)?;
                        }
                        // Still tracked for the owner, so cleanup finds it later.
                        Err(release) => warn!(
                            owner,
                            %address,
                            error = %release,
                            "could not release unanswered reservation, keeping claim"
                        ),
                    }
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(owner, %role, %address, error = %e, "address reservation failed");
                    self.store.delete_address(subnet, &address)?;
                    return Err(e.into());
                }
            }
        }

        warn!(owner, %role, subnet, "address range exhausted");
        Err(ProvisionError::RangeExhausted {
            role: role.to_string(),
            subnet: subnet.to_string(),
        })
    }

    /// Release a reservation upstream and drop the local row. Returns
    /// `false` if the provider no longer held it.
    ///
    /// A row without a handle is looked up by address and name, since the
    /// provider may have created it without answering.
    pub async fn release(&self, reservation: &ReservedAddress) -> ProvisionResult<bool> {
        let released = match &reservation.handle {
            Some(handle) => self.release_handle(&reservation.subnet, handle).await?,
            None => {
                let name = reservation_name(&reservation.owner, reservation.role);
                self.release_upstream(&reservation.subnet, &reservation.address, &name)
                    .await?
            }
        };
        self.store
            .delete_address(&reservation.subnet, &reservation.address)?;
        Ok(released)
    }

    async fn release_handle(&self, subnet: &str, handle: &str) -> ProvisionResult<bool> {
        match self.cloud.release_address(subnet, handle).await {
            Ok(()) => Ok(true),
            Err(CloudError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn release_upstream(&self, subnet: &str, address: &str, name: &str) -> ProvisionResult<bool> {
        let held = self
            .cloud
            .list_reserved_addresses(subnet)
            .await?
            .into_iter()
            .find(|r| r.address == address && r.name == name);
        match held {
            Some(r) => {
                debug!(subnet, address, id = %r.id, "releasing reservation found upstream");
                self.release_handle(subnet, &r.id).await
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_cloud::{CloudOp, FaultKind, RetryConfig, SimulatedCloud};
    use std::time::Duration;

    fn setup() -> (ResourceAllocator, Arc<SimulatedCloud>, StateStore) {
        let sim = Arc::new(SimulatedCloud::new());
        let store = StateStore::open_in_memory().unwrap();
        let cloud = CloudClient::new(sim.clone(), RetryConfig::none(), Duration::from_secs(5));
        let allocator = ResourceAllocator::new(store.clone(), cloud, Arc::new(ForgeConfig::sample()));
        (allocator, sim, store)
    }

    #[tokio::test]
    async fn lowest_free_address_first() {
        let (allocator, _sim, store) = setup();
        let first = allocator.reserve("node-1", AddressRole::Management).await.unwrap();
        let second = allocator.reserve("node-2", AddressRole::Management).await.unwrap();

        assert_eq!(first.address, "10.10.0.10");
        assert_eq!(second.address, "10.10.0.11");
        assert!(first.handle.is_some());
        let row = store.get_address("subnet-mgmt", "10.10.0.10").unwrap().unwrap();
        assert_eq!(row.owner, "node-1");
    }

    #[tokio::test]
    async fn skips_addresses_held_upstream() {
        let (allocator, sim, _store) = setup();
        sim.mark_in_use("subnet-mgmt", "10.10.0.10");
        sim.mark_in_use("subnet-mgmt", "10.10.0.11");
        let r = allocator.reserve("node-1", AddressRole::Management).await.unwrap();
        assert_eq!(r.address, "10.10.0.12");
    }

    #[tokio::test]
    async fn vip_and_controller_share_a_subnet_without_collision() {
        let (allocator, _sim, store) = setup();
        allocator.reserve("node-1", AddressRole::ControllerVm).await.unwrap();
        allocator.reserve("hci-a", AddressRole::ClusterVip).await.unwrap();
        let rows = store.list_addresses_in_subnet("subnet-cvm").unwrap();
        assert_eq!(rows.len(), 2);
        assert_ne!(rows[0].address, rows[1].address);
    }

    #[tokio::test]
    async fn exhaustion_is_distinct_and_leaves_no_claim() {
        let (allocator, sim, store) = setup();
        for i in 200..=220 {
            sim.mark_in_use("subnet-cvm", &format!("10.10.2.{i}"));
        }
        let err = allocator.reserve("hci-a", AddressRole::ClusterVip).await.unwrap_err();
        assert!(matches!(err, ProvisionError::RangeExhausted { .. }));
        assert!(err.is_capacity());
        assert!(store.list_addresses().unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_error_releases_local_claim() {
        let (allocator, sim, store) = setup();
        sim.fail_next(CloudOp::ReserveAddress, 1, FaultKind::Permanent);
        let err = allocator.reserve("node-1", AddressRole::Hypervisor).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Cloud(_)));
        assert!(store.list_addresses().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unanswered_reservation_is_adopted() {
        let (allocator, sim, store) = setup();
        sim.fail_next(CloudOp::ReserveAddress, 1, FaultKind::LostResponse);
        let r = allocator.reserve("node-1", AddressRole::Management).await.unwrap();
        assert!(r.handle.is_some());
        assert_eq!(sim.reservation_count(), 1);
        assert_eq!(store.list_addresses().unwrap(), vec![r]);
    }

    #[tokio::test]
    async fn unanswered_reservation_is_released_when_not_adopted() {
        let (allocator, sim, store) = setup();
        sim.fail_next(CloudOp::ReserveAddress, 1, FaultKind::LostResponse);
        // The client's own check fails, the allocator's succeeds.
        sim.fail_nth(CloudOp::ListReservedAddresses, 2, FaultKind::Permanent);

        let err = allocator.reserve("node-1", AddressRole::Management).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Cloud(CloudError::Timeout(_))));
        assert_eq!(sim.reservation_count(), 0);
        assert_eq!(sim.calls(CloudOp::ReleaseAddress), 1);
        assert!(store.list_addresses().unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_survives_when_upstream_state_is_unknown() {
        let (allocator, sim, store) = setup();
        sim.fail_next(CloudOp::ReserveAddress, 1, FaultKind::LostResponse);
        sim.fail_nth(CloudOp::ListReservedAddresses, 2, FaultKind::Permanent);
        sim.fail_nth(CloudOp::ListReservedAddresses, 3, FaultKind::Permanent);

        allocator.reserve("node-1", AddressRole::Management).await.unwrap_err();
        let claims = store.list_addresses_for_owner("node-1").unwrap();
        assert_eq!(claims.len(), 1);
        assert!(claims[0].handle.is_none());
        assert_eq!(sim.reservation_count(), 1);

        assert!(allocator.release(&claims[0]).await.unwrap());
        assert_eq!(sim.reservation_count(), 0);
        assert!(store.list_addresses().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_requests_get_distinct_addresses() {
        let (allocator, _sim, store) = setup();
        let mut handles = Vec::new();
        for i in 0..10 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                allocator
                    .reserve(&format!("node-{i}"), AddressRole::Management)
                    .await
            }));
        }
        let mut addresses = HashSet::new();
        for h in handles {
            let r = h.await.unwrap().unwrap();
            assert!(addresses.insert(r.address));
        }
        assert_eq!(store.list_addresses_in_subnet("subnet-mgmt").unwrap().len(), 10);
    }

    #[tokio::test]
    async fn release_tolerates_missing_upstream() {
        let (allocator, sim, store) = setup();
        let r = allocator.reserve("node-1", AddressRole::Management).await.unwrap();
        assert!(allocator.release(&r).await.unwrap());
        assert!(!allocator.release(&r).await.unwrap());
        assert!(store.list_addresses().unwrap().is_empty());
        assert_eq!(sim.reservation_count(), 0);
    }
}
