use thiserror::Error;

use crate::types::DenyReason;

pub type ClinicResult<T> = Result<T, ClinicError>;

#[derive(Error, Debug)]
pub enum ClinicError {
    /// Malformed identifier or argument, rejected before any lookup.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Access denied: {0}")]
    AccessDenied(DenyReason),

    #[error("Incomplete consent: missing clauses {missing_clauses:?}, missing signature: {missing_signature}")]
    IncompleteConsent {
        missing_clauses: Vec<String>,
        missing_signature: bool,
    },

    #[error("Concurrent modification of {0}")]
    ConcurrentModification(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ClinicError {
    /// Infrastructure or programmer errors, as opposed to business outcomes.
    pub fn is_hard_failure(&self) -> bool {
        matches!(
            self,
            ClinicError::InvalidArgument(_)
                | ClinicError::StorageUnavailable(_)
                | ClinicError::Config(_)
                | ClinicError::Serialization(_)
                | ClinicError::Internal(_)
        )
    }
}

impl From<config::ConfigError> for ClinicError {
    fn from(err: config::ConfigError) -> Self {
        ClinicError::Config(err.to_string())
    }
}
