//! Error types for the HostForge Kubernetes Operator

use std::fmt;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors surfaced by the host controller.
///
/// Failures classified by the state machine never reach this type; they
/// are recorded on the host status as an `ErrorType` and requeued. Only
/// the driver's own failures end up here: Kubernetes API calls, and
/// unexpected internal errors reported by a reconcile tick.
#[derive(Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    KubeApi(String),
    /// Reconciliation error
    Reconciliation(String),
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorError::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            OperatorError::Reconciliation(msg) => write!(f, "Reconciliation error: {}", msg),
        }
    }
}

impl std::error::Error for OperatorError {}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        OperatorError::KubeApi(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::KubeApi("connection refused".to_string());
        assert!(err.to_string().contains("Kubernetes API error"));
        let err = OperatorError::Reconciliation("no BMC credentials loaded".to_string());
        assert!(err.to_string().contains("Reconciliation error"));
    }

    #[test]
    fn test_kube_error_converts_to_kube_api() {
        let api_err = kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "metalhosts.hostforge.io \"node-0\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        };
        let err = OperatorError::from(kube::Error::Api(api_err));
        match err {
            OperatorError::KubeApi(msg) => assert!(msg.contains("node-0")),
            other => panic!("expected KubeApi, got {other:?}"),
        }
    }
}
