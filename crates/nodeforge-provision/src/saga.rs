//! Compensation ledger for the provisioning saga.
//!
//! Each forward step that creates something upstream records the action
//! that undoes it. On failure the ledger becomes a [`ResourceSet`] and is
//! handed to the cleanup service, which deletes in dependency order.

use nodeforge_state::{DnsRecord, NetworkAttachment, ReservedAddress, StateResult, StateStore};
use serde::Serialize;

/// The undo action of one completed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Compensation {
    ReleaseAddress(ReservedAddress),
    DeleteDnsRecord(DnsRecord),
    DeleteAttachment(NetworkAttachment),
    DeleteServer { server_id: String },
}

/// Undo actions recorded so far, oldest first.
#[derive(Debug, Clone, Default)]
pub struct Saga {
    node: String,
    steps: Vec<Compensation>,
}

impl Saga {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            steps: Vec::new(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn record(&mut self, compensation: Compensation) {
        self.steps.push(compensation);
    }

    pub fn steps(&self) -> &[Compensation] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn into_resources(self) -> ResourceSet {
        let mut set = ResourceSet::default();
        for step in self.steps {
            match step {
                Compensation::ReleaseAddress(r) => set.addresses.push(r),
                Compensation::DeleteDnsRecord(r) => set.dns_records.push(r),
                Compensation::DeleteAttachment(a) => set.attachments.push(a),
                Compensation::DeleteServer { server_id } => set.server_id = Some(server_id),
            }
        }
        set
    }
}

/// Provider-side resources of one owner, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSet {
    pub attachments: Vec<NetworkAttachment>,
    pub dns_records: Vec<DnsRecord>,
    pub addresses: Vec<ReservedAddress>,
    pub server_id: Option<String>,
}

impl ResourceSet {
    /// Everything the store tracks for `owner`.
    pub fn tracked(store: &StateStore, owner: &str, server_id: Option<String>) -> StateResult<Self> {
        Ok(Self {
            attachments: store.list_attachments_for_node(owner)?,
            dns_records: store.list_dns_records_for_owner(owner)?,
            addresses: store.list_addresses_for_owner(owner)?,
            server_id,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
            && self.dns_records.is_empty()
            && self.addresses.is_empty()
            && self.server_id.is_none()
    }

    pub fn len(&self) -> usize {
        self.attachments.len()
            + self.dns_records.len()
            + self.addresses.len()
            + usize::from(self.server_id.is_some())
    }
}
