//! Provisioning error types.

use thiserror::Error;

use crate::cleanup::CleanupSummary;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Every address in the range is taken.
    #[error("address range exhausted for {role} in {subnet}")]
    RangeExhausted { role: String, subnet: String },

    #[error("no address range configured for {0}")]
    NoRange(String),

    #[error("unknown server profile: {0}")]
    UnknownProfile(String),

    #[error("profile {profile} cannot be provisioned as {role}")]
    UnsupportedRole { profile: String, role: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("DNS name already registered: {0}")]
    DnsNameTaken(String),

    /// Provisioning failed after creating resources; they were rolled back.
    #[error("provisioning {node} failed at {step}: {source}")]
    Failed {
        node: String,
        step: String,
        source: Box<ProvisionError>,
        rollback: Box<CleanupSummary>,
    },

    #[error("provider error: {0}")]
    Cloud(#[from] nodeforge_cloud::CloudError),

    #[error("state store error: {0}")]
    State(#[from] nodeforge_state::StateError),

    #[error("monitor error: {0}")]
    Monitor(#[from] nodeforge_monitor::MonitorError),
}

impl ProvisionError {
    /// Capacity errors are reported as-is and never retried.
    pub fn is_capacity(&self) -> bool {
        match self {
            ProvisionError::RangeExhausted { .. }
            | ProvisionError::NoRange(_)
            | ProvisionError::UnknownProfile(_)
            | ProvisionError::UnsupportedRole { .. } => true,
            ProvisionError::Failed { source, .. } => source.is_capacity(),
            _ => false,
        }
    }

    /// The summary of the rollback that ran, if any.
    pub fn rollback(&self) -> Option<&CleanupSummary> {
        match self {
            ProvisionError::Failed { rollback, .. } => Some(rollback),
            _ => None,
        }
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
