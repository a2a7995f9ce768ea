//! Boot config error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootError {
    /// No node owns the presented address.
    #[error("no node owns address {0}")]
    UnknownAddress(String),

    /// The node is failed or cleaned and must not boot.
    #[error("node {node} is {phase} and cannot boot")]
    NotBootable { node: String, phase: String },

    #[error("unknown server profile: {0}")]
    UnknownProfile(String),

    #[error("node {0} has no management address")]
    MissingAddress(String),

    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state store error: {0}")]
    State(#[from] nodeforge_state::StateError),

    #[error("monitor error: {0}")]
    Monitor(#[from] nodeforge_monitor::MonitorError),
}

pub type BootResult<T> = Result<T, BootError>;
