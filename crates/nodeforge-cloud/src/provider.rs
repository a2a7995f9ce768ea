//! Cloud provider trait definition

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CloudResult;

/// Infrastructure control-plane operations NodeForge depends on.
///
/// Implementations map upstream "does not exist" responses to
/// [`CloudError::NotFound`](crate::CloudError::NotFound) and "address
/// already taken" to [`CloudError::Conflict`](crate::CloudError::Conflict).
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Provider name for logs (e.g. "rest", "simulated").
    fn name(&self) -> &str;

    /// Every reservation currently held in `subnet`, by anyone.
    async fn list_reserved_addresses(&self, subnet: &str) -> CloudResult<Vec<AddressReservation>>;

    async fn reserve_address(
        &self,
        subnet: &str,
        address: &str,
        name: &str,
    ) -> CloudResult<AddressReservation>;

    async fn release_address(&self, subnet: &str, reservation_id: &str) -> CloudResult<()>;

    async fn create_dns_record(&self, spec: &DnsRecordSpec) -> CloudResult<ProviderDnsRecord>;

    async fn delete_dns_record(&self, zone: &str, record_id: &str) -> CloudResult<()>;

    async fn find_dns_record(&self, zone: &str, name: &str) -> CloudResult<Option<ProviderDnsRecord>>;

    async fn create_attachment(&self, spec: &AttachmentSpec) -> CloudResult<ProviderAttachment>;

    async fn delete_attachment(&self, attachment_id: &str) -> CloudResult<()>;

    /// Look an attachment up by the name it was created with.
    async fn find_attachment(&self, subnet: &str, name: &str) -> CloudResult<Option<ProviderAttachment>>;

    async fn create_server(&self, spec: &ServerSpec) -> CloudResult<ServerInfo>;

    async fn get_server(&self, server_id: &str) -> CloudResult<ServerInfo>;

    /// Look a server up by the name it was created with.
    async fn find_server(&self, name: &str) -> CloudResult<Option<ServerInfo>>;

    async fn delete_server(&self, server_id: &str) -> CloudResult<()>;
}

/// Identifies a provider operation (logging, fault injection, call counts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudOp {
    ListReservedAddresses,
    ReserveAddress,
    ReleaseAddress,
    CreateDnsRecord,
    DeleteDnsRecord,
    FindDnsRecord,
    CreateAttachment,
    DeleteAttachment,
    FindAttachment,
    CreateServer,
    GetServer,
    FindServer,
    DeleteServer,
}

impl CloudOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CloudOp::ListReservedAddresses => "list_reserved_addresses",
            CloudOp::ReserveAddress => "reserve_address",
            CloudOp::ReleaseAddress => "release_address",
            CloudOp::CreateDnsRecord => "create_dns_record",
            CloudOp::DeleteDnsRecord => "delete_dns_record",
            CloudOp::FindDnsRecord => "find_dns_record",
            CloudOp::CreateAttachment => "create_attachment",
            CloudOp::DeleteAttachment => "delete_attachment",
            CloudOp::FindAttachment => "find_attachment",
            CloudOp::CreateServer => "create_server",
            CloudOp::GetServer => "get_server",
            CloudOp::FindServer => "find_server",
            CloudOp::DeleteServer => "delete_server",
        }
    }

    /// The read that finds what this operation creates, for operations
    /// that create something upstream.
    pub fn lookup(self) -> Option<CloudOp> {
        match self {
            CloudOp::ReserveAddress => Some(CloudOp::ListReservedAddresses),
            CloudOp::CreateDnsRecord => Some(CloudOp::FindDnsRecord),
            CloudOp::CreateAttachment => Some(CloudOp::FindAttachment),
            CloudOp::CreateServer => Some(CloudOp::FindServer),
            _ => None,
        }
    }
}

impl fmt::Display for CloudOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An address held in a subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressReservation {
    pub id: String,
    #[serde(default)]
    pub subnet: String,
    pub address: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecordSpec {
    pub zone: String,
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub target: String,
    pub ttl: u32,
}

impl DnsRecordSpec {
    pub fn a_record(zone: &str, name: &str, target: &str, ttl: u32) -> Self {
        Self {
            zone: zone.to_string(),
            name: name.to_string(),
            record_type: "A".to_string(),
            target: target.to_string(),
            ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDnsRecord {
    pub id: String,
    pub zone: String,
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentSpec {
    pub name: String,
    pub subnet: String,
    /// Reservation the attachment binds to.
    pub reservation_id: Option<String>,
    pub address: String,
    pub security_groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAttachment {
    pub id: String,
    pub name: String,
    pub subnet: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    pub profile: String,
    pub image: String,
    /// Attachment IDs, primary first.
    pub attachments: Vec<String>,
    /// Initialization payload, an iPXE script pointing back at the boot endpoint.
    pub user_data: String,
}

/// Lifecycle status of a bare-metal server as the provider reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Pending,
    Provisioning,
    Running,
    Stopped,
    Deleting,
    Failed,
}

impl ServerStatus {
    /// Parse the provider's status string. Unknown values are treated as
    /// still provisioning.
    pub fn from_provider(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" => ServerStatus::Pending,
            "running" | "active" => ServerStatus::Running,
            "stopped" | "stopping" => ServerStatus::Stopped,
            "deleting" => ServerStatus::Deleting,
            "failed" | "error" => ServerStatus::Failed,
            _ => ServerStatus::Provisioning,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Pending => "pending",
            ServerStatus::Provisioning => "provisioning",
            ServerStatus::Running => "running",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Deleting => "deleting",
            ServerStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    pub status: ServerStatus,
    pub status_reason: Option<String>,
}
