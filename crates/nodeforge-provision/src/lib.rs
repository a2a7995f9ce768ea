//! nodeforge-provision: turning a request into a booting server.
//!
//! The [`NodeProvisioner`] runs a saga over non-atomic provider calls:
//!
//! ```text
//! for each address category:
//!     ResourceAllocator::reserve  ──▶ ReleaseAddress
//!     DnsRegistrar::register      ──▶ DeleteDnsRecord
//! for each reserved address:
//!     NetworkInterfaceManager::attach ──▶ DeleteAttachment
//! persist addresses on the node
//! create server (iPXE init payload)   ──▶ DeleteServer
//! ```
//!
//! Each step records its compensation when it succeeds. A failure before
//! the server exists replays the recorded compensations through the
//! [`CleanupService`] before the error is returned, so a failed request
//! leaves nothing behind but the node row (in `failed`) and its history.

pub mod allocator;
pub mod cleanup;
pub mod dns;
pub mod error;
pub mod netif;
pub mod provisioner;
pub mod saga;
pub mod script;

pub use allocator::ResourceAllocator;
pub use cleanup::{
    CleanupLocation, CleanupMode, CleanupOutcome, CleanupService, CleanupStatus, CleanupStep,
    CleanupSummary, CleanupValidation, Leftover, ResourceKind,
};
pub use dns::DnsRegistrar;
pub use error::{ProvisionError, ProvisionResult};
pub use netif::NetworkInterfaceManager;
pub use provisioner::{NodeProvisioner, ProvisionReceipt, ProvisionRequest, boot_pointer_payload};
pub use saga::{Compensation, ResourceSet, Saga};
pub use script::cleanup_script;
