//! Orchestrator error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    /// No node owns the address a boot-time request came from.
    #[error("no node owns address {0}")]
    UnknownAddress(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Provision(#[from] nodeforge_provision::ProvisionError),

    #[error(transparent)]
    Boot(#[from] nodeforge_boot::BootError),

    #[error(transparent)]
    Cluster(#[from] nodeforge_cluster::ClusterError),

    #[error(transparent)]
    Monitor(#[from] nodeforge_monitor::MonitorError),

    #[error(transparent)]
    State(#[from] nodeforge_state::StateError),

    #[error(transparent)]
    Cloud(#[from] nodeforge_cloud::CloudError),

    #[error(transparent)]
    Config(#[from] nodeforge_core::ConfigError),
}

impl ForgeError {
    /// Range exhausted, unknown profile and the like: never retried.
    pub fn is_capacity(&self) -> bool {
        match self {
            ForgeError::Provision(e) => e.is_capacity(),
            ForgeError::Cluster(nodeforge_cluster::ClusterError::Provision(e)) => e.is_capacity(),
            _ => false,
        }
    }
}

pub type ForgeResult<T> = Result<T, ForgeError>;
