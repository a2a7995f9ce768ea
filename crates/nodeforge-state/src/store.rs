//! StateStore: redb-backed state persistence for NodeForge.
//!
//! Provides typed CRUD operations over nodes, reserved addresses, DNS
//! records, network attachments, deployment events and clusters. All values
//! are JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::phase::Phase;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Outcome of a read-modify-write helper.
#[derive(Debug, Clone, PartialEq)]
pub enum Updated<T> {
    /// No record under the key.
    Missing,
    /// The closure declined the change; carries the current value.
    Unchanged(T),
    /// The change was committed; carries the new value.
    Changed(T),
}

impl<T> Updated<T> {
    pub fn is_changed(&self) -> bool {
        matches!(self, Updated::Changed(_))
    }

    pub fn into_inner(self) -> Option<T> {
        match self {
            Updated::Missing => None,
            Updated::Unchanged(v) | Updated::Changed(v) => Some(v),
        }
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in ALL {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert only if the key is free. Returns false if it was taken.
    fn insert_if_absent<T: Serialize>(
        &self,
        table: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<bool> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            if t.get(key).map_err(map_err!(Read))?.is_some() {
                return Ok(false);
            }
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix` (empty prefix lists everything).
    fn scan_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn remove_key(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read, let `f` mutate, and write back in one write transaction.
    /// `f` returns whether it changed anything.
    fn update_json<T, F>(&self, table: JsonTable, key: &str, f: F) -> StateResult<Updated<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            let current = t
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let Some(bytes) = current else {
                return Ok(Updated::Missing);
            };
            let mut value: T = serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
            if !f(&mut value) {
                return Ok(Updated::Unchanged(value));
            }
            let bytes = serde_json::to_vec(&value).map_err(map_err!(Serialize))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
            outcome = Updated::Changed(value);
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(outcome)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Create a node record. Fails if the name is already in use.
    pub fn create_node(&self, node: &Node) -> StateResult<()> {
        if self.insert_if_absent(NODES, &node.name, node)? {
            debug!(node = %node.name, "node created");
            Ok(())
        } else {
            Err(StateError::AlreadyExists(format!("node {}", node.name)))
        }
    }

    /// Insert or overwrite a node record.
    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        self.put_json(NODES, &node.name, node)
    }

    pub fn get_node(&self, name: &str) -> StateResult<Option<Node>> {
        self.get_json(NODES, name)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.scan_json(NODES, "")
    }

    /// Atomically mutate a node. See [`Updated`].
    pub fn update_node<F>(&self, name: &str, f: F) -> StateResult<Updated<Node>>
    where
        F: FnOnce(&mut Node) -> bool,
    {
        self.update_json(NODES, name, f)
    }

    /// Resolve the node that owns `address`, by any of its assigned roles.
    pub fn find_node_by_address(&self, address: &str) -> StateResult<Option<Node>> {
        let owner = self
            .list_addresses()?
            .into_iter()
            .find(|r| r.address == address && r.role != AddressRole::ClusterVip)
            .map(|r| r.owner);
        if let Some(owner) = owner {
            return self.get_node(&owner);
        }
        // Cleaned nodes lose their reservation rows but keep the cached
        // addresses, so fall back to a scan of the node table.
        Ok(self
            .list_nodes()?
            .into_iter()
            .find(|n| n.addresses.contains(address)))
    }

    // ── Reserved addresses ─────────────────────────────────────────

    /// Claim `(subnet, address)`. Returns false if it is already claimed.
    ///
    /// This is the uniqueness constraint: the check and the insert happen
    /// in one write transaction, and redb serializes writers.
    pub fn claim_address(&self, reservation: &ReservedAddress) -> StateResult<bool> {
        let claimed = self.insert_if_absent(RESERVED_ADDRESSES, &reservation.table_key(), reservation)?;
        debug!(
            subnet = %reservation.subnet,
            address = %reservation.address,
            claimed,
            "address claim"
        );
        Ok(claimed)
    }

    /// Overwrite an existing reservation (e.g. to record the provider handle).
    pub fn put_address(&self, reservation: &ReservedAddress) -> StateResult<()> {
        self.put_json(RESERVED_ADDRESSES, &reservation.table_key(), reservation)
    }

    pub fn get_address(&self, subnet: &str, address: &str) -> StateResult<Option<ReservedAddress>> {
        self.get_json(RESERVED_ADDRESSES, &address_key(subnet, address))
    }

    /// Drop a reservation row. Returns true if it existed.
    pub fn delete_address(&self, subnet: &str, address: &str) -> StateResult<bool> {
        self.remove_key(RESERVED_ADDRESSES, &address_key(subnet, address))
    }

    pub fn list_addresses(&self) -> StateResult<Vec<ReservedAddress>> {
        self.scan_json(RESERVED_ADDRESSES, "")
    }

    pub fn list_addresses_in_subnet(&self, subnet: &str) -> StateResult<Vec<ReservedAddress>> {
        self.scan_json(RESERVED_ADDRESSES, &format!("{subnet}/"))
    }

    pub fn list_addresses_for_owner(&self, owner: &str) -> StateResult<Vec<ReservedAddress>> {
        Ok(self
            .list_addresses()?
            .into_iter()
            .filter(|r| r.owner == owner)
            .collect())
    }

    // ── DNS records ────────────────────────────────────────────────

    /// Track a DNS record. Returns false if the name is already tracked.
    pub fn insert_dns_record(&self, record: &DnsRecord) -> StateResult<bool> {
        self.insert_if_absent(DNS_RECORDS, &record.table_key(), record)
    }

    pub fn get_dns_record(&self, zone: &str, name: &str) -> StateResult<Option<DnsRecord>> {
        self.get_json(DNS_RECORDS, &dns_key(zone, name))
    }

    pub fn delete_dns_record(&self, zone: &str, name: &str) -> StateResult<bool> {
        self.remove_key(DNS_RECORDS, &dns_key(zone, name))
    }

    pub fn list_dns_records(&self) -> StateResult<Vec<DnsRecord>> {
        self.scan_json(DNS_RECORDS, "")
    }

    pub fn list_dns_records_for_owner(&self, owner: &str) -> StateResult<Vec<DnsRecord>> {
        Ok(self
            .list_dns_records()?
            .into_iter()
            .filter(|r| r.owner == owner)
            .collect())
    }

    // ── Network attachments ────────────────────────────────────────

    pub fn put_attachment(&self, attachment: &NetworkAttachment) -> StateResult<()> {
        self.put_json(ATTACHMENTS, &attachment.table_key(), attachment)
    }

    pub fn delete_attachment(&self, node: &str, handle: &str) -> StateResult<bool> {
        self.remove_key(ATTACHMENTS, &format!("{node}/{handle}"))
    }

    pub fn list_attachments(&self) -> StateResult<Vec<NetworkAttachment>> {
        self.scan_json(ATTACHMENTS, "")
    }

    pub fn list_attachments_for_node(&self, node: &str) -> StateResult<Vec<NetworkAttachment>> {
        self.scan_json(ATTACHMENTS, &format!("{node}/"))
    }

    // ── Deployment events ──────────────────────────────────────────

    /// Append `event` to the node's history and, if `apply` accepts it,
    /// update the cached node, all in one write transaction.
    ///
    /// The history row is inserted first and is kept even when `apply`
    /// rejects the event (it is stored with `applied = false`). Returns
    /// `None` if the node does not exist.
    pub fn record_event<F>(
        &self,
        event: DeploymentEvent,
        apply: F,
    ) -> StateResult<Option<(DeploymentEvent, Node)>>
    where
        F: FnOnce(&mut Node, &DeploymentEvent) -> bool,
    {
        self.record_event_inner(event, false, apply)
    }

    /// Like [`record_event`](Self::record_event), but does nothing if the
    /// node already has an applied event for the same phase. Used for
    /// idempotent signals that may be repeated by a retrying node.
    pub fn record_event_once<F>(
        &self,
        event: DeploymentEvent,
        apply: F,
    ) -> StateResult<Option<(DeploymentEvent, Node)>>
    where
        F: FnOnce(&mut Node, &DeploymentEvent) -> bool,
    {
        self.record_event_inner(event, true, apply)
    }

    fn record_event_inner<F>(
        &self,
        mut event: DeploymentEvent,
        once: bool,
        apply: F,
    ) -> StateResult<Option<(DeploymentEvent, Node)>>
    where
        F: FnOnce(&mut Node, &DeploymentEvent) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut events = txn.open_table(EVENTS).map_err(map_err!(Table))?;

            let current = nodes
                .get(event.node.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let Some(bytes) = current else {
                return Ok(None);
            };
            let mut node: Node = serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;

            let prefix = format!("{}:", event.node);
            let mut seq = 0u64;
            let mut seen_phase = false;
            for entry in events.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if !key.value().starts_with(&prefix) {
                    continue;
                }
                seq += 1;
                if once {
                    let past: DeploymentEvent =
                        serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                    seen_phase |= past.applied && past.phase == event.phase;
                }
            }
            if once && seen_phase {
                return Ok(Some((event, node)));
            }

            event.seq = seq;
            event.applied = apply(&mut node, &event);

            let event_bytes = serde_json::to_vec(&event).map_err(map_err!(Serialize))?;
            events
                .insert(event.table_key().as_str(), event_bytes.as_slice())
                .map_err(map_err!(Write))?;

            if event.applied {
                let node_bytes = serde_json::to_vec(&node).map_err(map_err!(Serialize))?;
                nodes
                    .insert(node.name.as_str(), node_bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
            outcome = Some((event, node));
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(outcome)
    }

    /// Full history for a node, oldest first.
    pub fn list_events_for_node(&self, node: &str) -> StateResult<Vec<DeploymentEvent>> {
        self.scan_json(EVENTS, &format!("{node}:"))
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Create a cluster record. Fails if the name is already in use.
    pub fn create_cluster(&self, cluster: &Cluster) -> StateResult<()> {
        if self.insert_if_absent(CLUSTERS, &cluster.name, cluster)? {
            debug!(cluster = %cluster.name, "cluster created");
            Ok(())
        } else {
            Err(StateError::AlreadyExists(format!("cluster {}", cluster.name)))
        }
    }

    pub fn get_cluster(&self, name: &str) -> StateResult<Option<Cluster>> {
        self.get_json(CLUSTERS, name)
    }

    pub fn list_clusters(&self) -> StateResult<Vec<Cluster>> {
        self.scan_json(CLUSTERS, "")
    }

    /// Atomically mutate a cluster. See [`Updated`].
    pub fn update_cluster<F>(&self, name: &str, f: F) -> StateResult<Updated<Cluster>>
    where
        F: FnOnce(&mut Cluster) -> bool,
    {
        self.update_json(CLUSTERS, name, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::EventStatus;

    fn test_node(name: &str) -> Node {
        let mut node = Node::new(name, "bx2d-metal-96x384", ClusterRole::ComputeStorage);
        node.addresses.set(AddressRole::Management, "10.0.0.10");
        node
    }

    fn test_reservation(owner: &str, subnet: &str, address: &str) -> ReservedAddress {
        ReservedAddress {
            owner: owner.to_string(),
            role: AddressRole::Management,
            address: address.to_string(),
            subnet: subnet.to_string(),
            handle: Some(format!("rip-{address}")),
            claimed_at: 1000,
        }
    }

    fn advance_to(phase: Phase) -> impl FnOnce(&mut Node, &DeploymentEvent) -> bool {
        move |node, event| {
            if node.status.can_advance_to(phase) {
                node.enter_phase(phase, event.timestamp);
                true
            } else {
                false
            }
        }
    }

    // ── Node CRUD ──────────────────────────────────────────────────

    #[test]
    fn node_create_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let node = test_node("node-1");

        store.create_node(&node).unwrap();
        assert_eq!(store.get_node("node-1").unwrap(), Some(node));
    }

    #[test]
    fn node_create_rejects_duplicate_name() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_node(&test_node("node-1")).unwrap();

        let err = store.create_node(&test_node("node-1")).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn node_update_declined_leaves_record() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_node(&test_node("node-1")).unwrap();

        let outcome = store.update_node("node-1", |_| false).unwrap();
        assert!(matches!(outcome, Updated::Unchanged(_)));

        let outcome = store
            .update_node("node-1", |n| {
                n.server_id = Some("srv-1".to_string());
                true
            })
            .unwrap();
        assert!(outcome.is_changed());
        assert_eq!(
            store.get_node("node-1").unwrap().unwrap().server_id.as_deref(),
            Some("srv-1")
        );

        assert_eq!(store.update_node("ghost", |_| true).unwrap(), Updated::Missing);
    }

    // ── Addresses ──────────────────────────────────────────────────

    #[test]
    fn address_claim_is_unique_per_subnet() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.claim_address(&test_reservation("a", "subnet-1", "10.0.0.10")).unwrap());
        assert!(!store.claim_address(&test_reservation("b", "subnet-1", "10.0.0.10")).unwrap());
        // Same address in another subnet is a different key.
        assert!(store.claim_address(&test_reservation("b", "subnet-2", "10.0.0.10")).unwrap());

        let owner = store.get_address("subnet-1", "10.0.0.10").unwrap().unwrap().owner;
        assert_eq!(owner, "a");
    }

    #[test]
    fn address_concurrent_claims_single_winner() {
        let store = StateStore::open_in_memory().unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .claim_address(&test_reservation(&format!("n{i}"), "s", "10.0.0.1"))
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn find_node_by_any_address() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_node(&test_node("node-1")).unwrap();
        store
            .claim_address(&test_reservation("node-1", "subnet-1", "10.0.0.10"))
            .unwrap();

        let found = store.find_node_by_address("10.0.0.10").unwrap().unwrap();
        assert_eq!(found.name, "node-1");

        // Falls back to cached addresses once reservation rows are gone.
        store.delete_address("subnet-1", "10.0.0.10").unwrap();
        assert!(store.find_node_by_address("10.0.0.10").unwrap().is_some());
        assert!(store.find_node_by_address("10.9.9.9").unwrap().is_none());
    }

    // ── DNS / attachments ──────────────────────────────────────────

    #[test]
    fn dns_record_names_unique_in_zone() {
        let store = StateStore::open_in_memory().unwrap();
        let record = DnsRecord {
            owner: "node-1".to_string(),
            zone: "zone-1".to_string(),
            name: "node-1-mgmt.hci.example".to_string(),
            record_type: "A".to_string(),
            target: "10.0.0.10".to_string(),
            address_role: AddressRole::Management,
            handle: "rec-1".to_string(),
            created_at: 1000,
        };

        assert!(store.insert_dns_record(&record).unwrap());
        assert!(!store.insert_dns_record(&record).unwrap());
        assert_eq!(store.list_dns_records_for_owner("node-1").unwrap().len(), 1);
        assert!(store.delete_dns_record("zone-1", &record.name).unwrap());
        assert!(!store.delete_dns_record("zone-1", &record.name).unwrap());
    }

    #[test]
    fn attachments_scoped_by_node_prefix() {
        let store = StateStore::open_in_memory().unwrap();
        for (node, handle) in [("node-1", "att-1"), ("node-1", "att-2"), ("node-10", "att-3")] {
            store
                .put_attachment(&NetworkAttachment {
                    node: node.to_string(),
                    role: AddressRole::Management,
                    handle: handle.to_string(),
                    address: "10.0.0.10".to_string(),
                    subnet: "subnet-1".to_string(),
                    security_groups: vec!["sg-hci".to_string()],
                    created_at: 1000,
                })
                .unwrap();
        }

        assert_eq!(store.list_attachments_for_node("node-1").unwrap().len(), 2);
        assert_eq!(store.list_attachments_for_node("node-10").unwrap().len(), 1);
    }

    // ── Events ─────────────────────────────────────────────────────

    #[test]
    fn rejected_event_still_recorded() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_node(&test_node("node-1")).unwrap();

        let ev = DeploymentEvent::new(
            "node-1",
            Phase::ImageDownload,
            EventStatus::Started,
            EventSource::Node,
            "",
        );
        let (ev, node) = store.record_event(ev, advance_to(Phase::ImageDownload)).unwrap().unwrap();
        assert!(ev.applied);
        assert_eq!(node.status, Phase::ImageDownload);

        let late = DeploymentEvent::new(
            "node-1",
            Phase::IpxeBoot,
            EventStatus::Started,
            EventSource::Node,
            "late",
        );
        let (late, node) = store.record_event(late, advance_to(Phase::IpxeBoot)).unwrap().unwrap();
        assert!(!late.applied);
        assert_eq!(late.seq, 1);
        assert_eq!(node.status, Phase::ImageDownload);

        let history = store.list_events_for_node("node-1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(store.get_node("node-1").unwrap().unwrap().status, Phase::ImageDownload);
    }

    #[test]
    fn record_event_once_skips_repeats() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_node(&test_node("node-1")).unwrap();

        for _ in 0..3 {
            let ev = DeploymentEvent::new(
                "node-1",
                Phase::IpxeBoot,
                EventStatus::Started,
                EventSource::Node,
                "boot pointer served",
            );
            store.record_event_once(ev, advance_to(Phase::IpxeBoot)).unwrap();
        }

        let events = store.list_events_for_node("node-1").unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].applied);
    }

    #[test]
    fn record_event_for_unknown_node() {
        let store = StateStore::open_in_memory().unwrap();
        let ev = DeploymentEvent::new("ghost", Phase::IpxeBoot, EventStatus::Started, EventSource::Node, "");
        assert!(store.record_event(ev, |_, _| true).unwrap().is_none());
        assert!(store.list_events_for_node("ghost").unwrap().is_empty());
    }

    // ── Clusters ───────────────────────────────────────────────────

    #[test]
    fn cluster_compare_and_set() {
        let store = StateStore::open_in_memory().unwrap();
        let cluster = Cluster {
            name: "hci-a".to_string(),
            vip: Some("10.0.9.10".to_string()),
            min_members: 3,
            members: vec![ClusterMember::waiting("node-1")],
            status: ClusterStatus::Pending,
            entry_point: None,
            message: None,
            created_at: 1000,
            updated_at: 1000,
        };
        store.create_cluster(&cluster).unwrap();

        let begin = |c: &mut Cluster| {
            if c.status != ClusterStatus::Pending {
                return false;
            }
            c.status = ClusterStatus::Forming;
            true
        };
        assert!(store.update_cluster("hci-a", begin).unwrap().is_changed());
        assert!(!store.update_cluster("hci-a", begin).unwrap().is_changed());
        assert_eq!(store.list_clusters().unwrap().len(), 1);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.create_node(&test_node("node-1")).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let node = store.get_node("node-1").unwrap();
        assert_eq!(node.unwrap().profile, "bx2d-metal-96x384");
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_nodes().unwrap().is_empty());
        assert!(store.list_addresses().unwrap().is_empty());
        assert!(store.list_dns_records().unwrap().is_empty());
        assert!(store.list_attachments().unwrap().is_empty());
        assert!(store.list_clusters().unwrap().is_empty());
        assert!(!store.delete_address("s", "10.0.0.1").unwrap());
        assert!(!store.delete_attachment("n", "h").unwrap());
    }
}
