//! Monitor error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("invalid phase report: {0}")]
    InvalidReport(String),

    #[error("state store error: {0}")]
    State(#[from] nodeforge_state::StateError),

    #[error("provider error: {0}")]
    Cloud(#[from] nodeforge_cloud::CloudError),
}

pub type MonitorResult<T> = Result<T, MonitorError>;
