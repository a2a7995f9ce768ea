//! nodeforge-core: configuration shared by every NodeForge component.
//!
//! A single [`ForgeConfig`] is loaded from TOML at start-up, validated, and
//! then passed by reference (usually behind an `Arc`) to the allocator,
//! monitor, boot generator and cluster coordinator.

pub mod config;
pub mod error;
pub mod range;

pub use config::{
    BootConfig, ClusterConfig, DnsConfig, ForgeConfig, HealthProbeConfig, PhaseTimeouts,
    PolicyConfig, ProviderConfig, ProviderKind, RetrySettings, ServerProfile, ServiceConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use range::AddressRange;
