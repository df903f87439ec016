use chrono::{DateTime, Utc};
use thiserror::Error;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Invalid, missing or mismatched CA key material. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The certificate request itself is unusable
    #[error("invalid certificate request: {0}")]
    InvalidRequest(String),

    /// Key generation or signing failed
    #[error("signing failed: {0}")]
    Signing(String),

    /// The root certificate is past its validity; no further issuance is possible
    #[error("root certificate expired at {0}")]
    ExpiredRoot(DateTime<Utc>),

    /// A stored certificate could not be parsed
    #[error("certificate parsing error: {0}")]
    Parse(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;
