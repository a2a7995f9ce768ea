//! DNS registrar: one A record per reserved address.

use std::sync::Arc;

use nodeforge_cloud::{CloudClient, CloudError, DnsRecordSpec};
use nodeforge_core::ForgeConfig;
use nodeforge_state::{AddressRole, DnsRecord, ReservedAddress, StateStore, now_millis};
use tracing::{info, warn};

use crate::error::{ProvisionError, ProvisionResult};

#[derive(Clone)]
pub struct DnsRegistrar {
    store: StateStore,
    cloud: CloudClient,
    config: Arc<ForgeConfig>,
}

impl DnsRegistrar {
    pub fn new(store: StateStore, cloud: CloudClient, config: Arc<ForgeConfig>) -> Self {
        Self {
            store,
            cloud,
            config,
        }
    }

    /// `{owner}-{label}.{domain}` for node addresses, `{owner}.{domain}`
    /// for a cluster VIP.
    pub fn record_name(&self, owner: &str, role: AddressRole) -> String {
        match role {
            AddressRole::ClusterVip => self.config.fqdn(owner),
            _ => self.config.fqdn(&format!("{owner}-{}", role.label())),
        }
    }

    /// Publish a record pointing at `reservation`'s address.
    pub async fn register(&self, reservation: &ReservedAddress) -> ProvisionResult<DnsRecord> {
        let zone = self.config.dns.zone.as_str();
        let name = self.record_name(&reservation.owner, reservation.role);
        if self.store.get_dns_record(zone, &name)?.is_some() {
            return Err(ProvisionError::DnsNameTaken(name));
        }

        let spec = DnsRecordSpec::a_record(zone, &name, &reservation.address, self.config.dns.ttl);
        let created = self.cloud.create_dns_record(&spec).await.map_err(|e| match e {
            CloudError::Conflict(_) => ProvisionError::DnsNameTaken(name.clone()),
            other => other.into(),
        })?;

        let record = DnsRecord {
            owner: reservation.owner.clone(),
            zone: zone.to_string(),
            name: name.clone(),
            record_type: created.record_type,
            target: reservation.address.clone(),
            address_role: reservation.role,
            handle: created.id,
            created_at: now_millis(),
        };
        if !self.store.insert_dns_record(&record)? {
            warn!(%name, "record name registered concurrently, removing duplicate");
            self.delete_upstream(&record).await?;
            return Err(ProvisionError::DnsNameTaken(name));
        }
        info!(owner = %record.owner, %name, target = %record.target, "DNS record created");
        Ok(record)
    }

    /// Remove the record upstream and drop the local row. Returns `false`
    /// if the provider no longer had it.
    pub async fn deregister(&self, record: &DnsRecord) -> ProvisionResult<bool> {
        let deleted = self.delete_upstream(record).await?;
        self.store.delete_dns_record(&record.zone, &record.name)?;
        Ok(deleted)
    }

    async fn delete_upstream(&self, record: &DnsRecord) -> ProvisionResult<bool> {
        match self.cloud.delete_dns_record(&record.zone, &record.handle).await {
            Ok(()) => Ok(true),
            Err(CloudError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the record is published upstream with the expected target.
    pub async fn verify(&self, record: &DnsRecord) -> ProvisionResult<bool> {
        let found = self.cloud.find_dns_record(&record.zone, &record.name).await?;
        Ok(found.is_some_and(|r| r.target == record.target))
    }
}
