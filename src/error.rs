//! Error taxonomy for the aggregation core.
//!
//! Everything the library can fail with lives in [`EpiError`]. Malformed
//! records, unclassified routing and insufficient baseline history are not
//! errors: they degrade into counters and statuses.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EpiError {
    #[error("Unknown geographic unit: {0}")]
    UnknownGeoUnit(String),

    #[error("Invalid geography hierarchy: {0}")]
    InvalidHierarchy(String),

    #[error("Record ingestion timed out after {0:?}")]
    IngestionTimeout(Duration),

    #[error("Record store unavailable: {0}")]
    IngestionUnavailable(String),

    #[error("Geographic scope resolves to no units")]
    EmptyScope,

    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Aggregation worker failed: {0}")]
    Worker(String),

    #[error("Report archive error: {0}")]
    Archive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EpiError {
    /// Whether a caller may retry the whole run after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EpiError::IngestionTimeout(_) | EpiError::IngestionUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EpiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EpiError::IngestionTimeout(Duration::from_secs(3)).is_retryable());
        assert!(EpiError::IngestionUnavailable("down".to_string()).is_retryable());
        assert!(!EpiError::EmptyScope.is_retryable());
        assert!(!EpiError::InvalidHierarchy("cycle".to_string()).is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = EpiError::UnknownGeoUnit("gabu-x".to_string());
        assert_eq!(err.to_string(), "Unknown geographic unit: gabu-x");
        assert_eq!(
            EpiError::EmptyScope.to_string(),
            "Geographic scope resolves to no units"
        );
    }
}
