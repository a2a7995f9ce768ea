//! nodeforge-cloud: infrastructure provider abstraction.
//!
//! Everything NodeForge asks of the cloud control plane goes through the
//! [`CloudProvider`] trait: reserved addresses, DNS records, virtual network
//! attachments and bare-metal servers. Call sites use [`CloudClient`], which
//! bounds every call with a timeout and retries transient failures with
//! exponential backoff.
//!
//! Two providers ship with the crate:
//!
//! - [`RestCloudProvider`] talks JSON over HTTPS with bearer-token auth.
//! - [`SimulatedCloud`] keeps everything in memory and supports fault
//!   injection. It backs the test suite and `provider.kind = "simulated"`.

pub mod client;
pub mod error;
pub mod provider;
pub mod rest;
pub mod simulated;

use std::sync::Arc;

use nodeforge_core::{ProviderConfig, ProviderKind};

pub use client::{CloudClient, RetryConfig};
pub use error::{CloudError, CloudResult};
pub use provider::{
    AddressReservation, AttachmentSpec, CloudOp, CloudProvider, DnsRecordSpec, ProviderAttachment,
    ProviderDnsRecord, ServerInfo, ServerSpec, ServerStatus,
};
pub use rest::RestCloudProvider;
pub use simulated::{FaultKind, SimulatedCloud};

/// Build the provider selected by `[provider] kind`.
pub fn build_provider(config: &ProviderConfig) -> CloudResult<Arc<dyn CloudProvider>> {
    match config.kind {
        ProviderKind::Rest => Ok(Arc::new(RestCloudProvider::new(config)?)),
        ProviderKind::Simulated => Ok(Arc::new(SimulatedCloud::new())),
    }
}
