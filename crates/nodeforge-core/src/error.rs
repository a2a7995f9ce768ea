//! Configuration error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid address range for {role}: {reason}")]
    InvalidRange { role: String, reason: String },

    #[error("duplicate address range for role {0}")]
    DuplicateRange(String),

    #[error("no address range configured for role {0}")]
    MissingRange(String),

    #[error("unknown phase in [timeouts]: {0}")]
    UnknownPhase(String),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: String, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
