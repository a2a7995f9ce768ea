//! Provider error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    /// The resource does not exist. Cleanup treats this as already absent.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The resource (usually an address) is already taken upstream.
    #[error("resource conflict: {0}")]
    Conflict(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CloudError::RateLimited(_)
                | CloudError::Timeout(_)
                | CloudError::Unavailable(_)
                | CloudError::Transport(_)
        )
    }

    /// Whether the request may have taken effect upstream even though it
    /// reported failure.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, CloudError::Timeout(_) | CloudError::Transport(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, CloudError::Conflict(_))
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 | 422 => CloudError::InvalidRequest(message),
            401 | 403 => CloudError::Auth(message),
            404 => CloudError::NotFound(message),
            409 => CloudError::Conflict(message),
            429 => CloudError::RateLimited(message),
            500..=599 => CloudError::Unavailable(message),
            _ => CloudError::Api { status, message },
        }
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CloudError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            CloudError::from_status(status.as_u16(), e.to_string())
        } else if e.is_decode() {
            CloudError::Api {
                status: 0,
                message: e.to_string(),
            }
        } else {
            CloudError::Transport(e.to_string())
        }
    }
}

pub type CloudResult<T> = Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(CloudError::from_status(404, "gone").is_not_found());
        assert!(CloudError::from_status(409, "taken").is_conflict());
        assert!(CloudError::from_status(429, "slow down").is_transient());
        assert!(CloudError::from_status(503, "busy").is_transient());
        assert!(!CloudError::from_status(400, "bad").is_transient());
        assert!(matches!(
            CloudError::from_status(418, "teapot"),
            CloudError::Api { status: 418, .. }
        ));
    }
}
