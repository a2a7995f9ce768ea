//! nodeforge-boot: what a network-booting node is told.
//!
//! A node asks twice, identified only by the address it presents:
//!
//! 1. [`BootConfigGenerator::boot_pointer`] renders the iPXE descriptor:
//!    kernel, initrd and image locations plus the URL of the install
//!    config. Serving it records `ipxe_boot`.
//! 2. [`BootConfigGenerator::install_config`] assembles the install
//!    document: disk layout from the server profile, the node's
//!    addresses, its role and cluster intent. Serving it records
//!    `config_download`.
//!
//! Both are safe to call repeatedly and concurrently. Only the first
//! serving of each phase is recorded, and a node that has moved on is
//! never pulled back.

pub mod error;
pub mod generator;

pub use error::{BootError, BootResult};
pub use generator::{
    BootConfigGenerator, BootPointer, ClusterSection, InstallConfig, InstallerSection,
    InterfaceConfig,
};
