//! redb table definitions for the NodeForge state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Shape shared by every table in the store.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Node records keyed by `{node_name}`.
pub const NODES: JsonTable = TableDefinition::new("nodes");

/// Reserved addresses keyed by `{subnet}/{address}`. The key is the
/// uniqueness constraint the allocator relies on.
pub const RESERVED_ADDRESSES: JsonTable = TableDefinition::new("reserved_addresses");

/// DNS records keyed by `{zone}/{record_name}`.
pub const DNS_RECORDS: JsonTable = TableDefinition::new("dns_records");

/// Network attachments keyed by `{node_name}/{provider_handle}`.
pub const ATTACHMENTS: JsonTable = TableDefinition::new("network_attachments");

/// Append-only deployment history keyed by `{node_name}:{seq:010}`.
pub const EVENTS: JsonTable = TableDefinition::new("deployment_events");

/// Clusters keyed by `{cluster_name}`.
pub const CLUSTERS: JsonTable = TableDefinition::new("clusters");

/// Every table, for creation at open time.
pub const ALL: [JsonTable; 6] = [
    NODES,
    RESERVED_ADDRESSES,
    DNS_RECORDS,
    ATTACHMENTS,
    EVENTS,
    CLUSTERS,
];
