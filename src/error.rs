//! Error types for the VPA operator

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Operator configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A label selector that cannot be evaluated or rendered
    #[error("Invalid label selector: {0}")]
    SelectorError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    /// Whether a retry with backoff has a chance of succeeding.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => {
                resp.code == 409 || resp.code == 429 || resp.code >= 500
            }
            // Transport-level failures (connection refused, timeouts) are
            // transient as far as the queue is concerned.
            Error::KubeError(_) => true,
            Error::ConfigError(_) | Error::SelectorError(_) | Error::SerializationError(_) => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_not_retriable() {
        let err = Error::ConfigError("bad address".to_string());
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_api_conflict_is_retriable() {
        let err = Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "Operation cannot be fulfilled: the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_api_bad_request_not_retriable() {
        let err = Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "invalid spec".to_string(),
            reason: "Invalid".to_string(),
            code: 422,
        }));
        assert!(!err.is_retriable());
    }
}
