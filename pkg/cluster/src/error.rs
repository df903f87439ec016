use thiserror::Error;

/// Cluster API errors, classified by how the controller reacts to them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    /// Optimistic-concurrency conflict: the object changed since it was read.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unreachable, rate-limited or otherwise temporarily failing API.
    #[error("transient cluster error: {0}")]
    Transient(String),

    /// Non-retryable API rejection.
    #[error("cluster API error ({code}): {message}")]
    Api { code: u16, message: String },

    /// Invalid or missing cluster credentials. Fatal at startup.
    #[error("cluster configuration error: {0}")]
    Configuration(String),
}

impl ClusterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Transient(_))
    }

    /// Classify an HTTP status returned by the API server.
    pub fn from_status(code: u16, reason: &str, message: &str) -> Self {
        match code {
            404 => ClusterError::NotFound,
            409 if reason == "AlreadyExists" => ClusterError::AlreadyExists,
            409 => ClusterError::Conflict(message.to_string()),
            408 | 429 | 500..=599 => ClusterError::Transient(format!("{}: {}", code, message)),
            _ => ClusterError::Api {
                code,
                message: message.to_string(),
            },
        }
    }
}
