use std::path::PathBuf;

use thiserror::Error;

/* ============================= STORE ERRORS ============================= */

/// Outcome classification for calls against the cluster store.
///
/// `NotFound` and `Conflict` are semantic answers from the API server and are
/// never retried. `Transient` covers timeouts, throttling and connection
/// failures, which the retry wrapper backs off on.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient store error: {0}")]
    Transient(#[source] kube::Error),

    #[error(transparent)]
    Kube(kube::Error),
}

impl StoreError {
    /// Classify a `kube::Error` by API status code or transport failure.
    pub fn from_kube(error: kube::Error) -> Self {
        match &error {
            kube::Error::Api(response) => match response.code {
                404 => StoreError::NotFound,
                409 => StoreError::Conflict(response.message.clone()),
                code if is_transient_status(code) => StoreError::Transient(error),
                _ => StoreError::Kube(error),
            },
            kube::Error::HyperError(_) | kube::Error::Service(_) => StoreError::Transient(error),
            _ => StoreError::Kube(error),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(error: kube::Error) -> Self {
        StoreError::from_kube(error)
    }
}

fn is_transient_status(code: u16) -> bool {
    matches!(code, 408 | 429 | 500 | 502 | 503 | 504)
}

/* ============================= WATCH ERRORS ============================= */

#[derive(Debug, Error)]
pub enum WatchError {
    /// The event cache never received its initial listing.
    #[error("failed to sync events")]
    SyncFailed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/* ============================= LEASE ERRORS ============================= */

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("failed to create lease: {0}")]
    Create(#[source] StoreError),

    #[error(transparent)]
    Claim(#[from] kubert::lease::Error),

    /// The background claim task ended while the election was still running.
    #[error("lease claim task stopped")]
    ClaimsClosed,
}

/* ============================= EXCEPTION ERRORS ============================= */

#[derive(Debug, Error)]
pub enum ExceptionError {
    #[error("policy {0} not found")]
    PolicyNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to render policy exception: {0}")]
    Render(#[from] serde_yaml::Error),
}

/* ============================= CONFIG ERRORS ============================= */

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_not_found_classified() {
        let err = StoreError::from_kube(api_error(404));
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_conflict_keeps_message() {
        let err = StoreError::from_kube(api_error(409));
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), "conflict: status 409");
    }

    #[test]
    fn test_throttling_and_server_errors_are_transient() {
        for code in [408, 429, 500, 502, 503, 504] {
            assert!(StoreError::from_kube(api_error(code)).is_transient(), "code {code}");
        }
    }

    #[test]
    fn test_forbidden_is_permanent() {
        let err = StoreError::from_kube(api_error(403));
        assert!(matches!(err, StoreError::Kube(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_config_invalid_message() {
        let err = ConfigError::Invalid("retryPeriod must be positive".to_string());
        assert_eq!(err.to_string(), "invalid config: retryPeriod must be positive");
    }

    #[test]
    fn test_lease_create_wraps_store_error() {
        let err = LeaseError::Create(StoreError::from_kube(api_error(403)));
        assert!(err.to_string().starts_with("failed to create lease"));
    }

    #[test]
    fn test_sync_failed_message() {
        assert_eq!(WatchError::SyncFailed.to_string(), "failed to sync events");
    }
}
