//! Cluster formation error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster not found: {0}")]
    NotFound(String),

    #[error("cluster already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid cluster request: {0}")]
    InvalidRequest(String),

    /// The management API answered with a non-2xx status.
    #[error("management API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("management API unreachable: {0}")]
    Transport(String),

    #[error("management API call timed out after {0}s")]
    Timeout(u64),

    #[error("invalid management API response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("provisioning error: {0}")]
    Provision(#[from] nodeforge_provision::ProvisionError),

    #[error("state store error: {0}")]
    State(#[from] nodeforge_state::StateError),

    #[error("monitor error: {0}")]
    Monitor(#[from] nodeforge_monitor::MonitorError),
}

pub type ClusterResult<T> = Result<T, ClusterError>;
