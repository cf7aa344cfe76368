//! Error taxonomy shared by every component that talks to a control plane.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the federation crate.
pub type Result<T, E = ClusterError> = std::result::Result<T, E>;

/// Errors raised while talking to a cluster control plane.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// A condition is not yet true; callers keep polling until their deadline.
    #[error("not ready: {0}")]
    NotReady(String),

    /// A resource that was expected to exist does not.
    #[error("not found: {0}")]
    NotFound(String),

    /// The API server could not be reached or the transport failed.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// The current identity lacks the rights to perform the request.
    #[error("permission denied: {0}")]
    Permission(String),

    /// A bounded wait elapsed.
    #[error(
        "timed out after {}s waiting for {what}{}",
        .after.as_secs(),
        .last_error.as_deref().map(|e| format!(" (last error: {e})")).unwrap_or_default()
    )]
    Timeout {
        /// What was being waited on.
        what: String,
        /// How long the wait lasted.
        after: Duration,
        /// The last retryable error seen while waiting.
        last_error: Option<String>,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Any other API status the server returned.
    #[error("API error ({code}): {message}")]
    Api {
        /// HTTP status code.
        code: u16,
        /// Server supplied message.
        message: String,
    },

    /// A kubeconfig could not be read or turned into a client.
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// A minted credential does not grant exactly the access it should.
    #[error("credential rejected: {0}")]
    Credential(String),

    /// JSON or YAML could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An external CLI (`kubectl`, `helm`) exited with an error.
    #[error("command failed: {0}")]
    Command(String),

    /// Invalid configuration passed in by the caller.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClusterError {
    /// Whether retrying the same call may succeed without operator action.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotReady(_) | Self::Connectivity(_) | Self::Timeout { .. } => true,
            Self::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }

    /// Whether the error means the caller is not allowed to do this at all.
    #[must_use]
    pub fn is_permission(&self) -> bool {
        matches!(self, Self::Permission(_))
    }

    /// Whether the error means the target resource is absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                401 | 403 => Self::Permission(resp.message),
                404 => Self::NotFound(resp.message),
                code => Self::Api {
                    code,
                    message: resp.message,
                },
            },
            kube::Error::SerdeError(e) => Self::Serialization(e.to_string()),
            other => Self::Connectivity(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ClusterError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_kube_error_classification() {
        assert!(ClusterError::from(api_error(403)).is_permission());
        assert!(ClusterError::from(api_error(401)).is_permission());
        assert!(ClusterError::from(api_error(404)).is_not_found());
        assert!(matches!(
            ClusterError::from(api_error(409)),
            ClusterError::Api { code: 409, .. }
        ));
    }

    #[test]
    fn test_transient_errors() {
        assert!(ClusterError::NotReady("pods".into()).is_transient());
        assert!(ClusterError::Connectivity("refused".into()).is_transient());
        assert!(ClusterError::from(api_error(503)).is_transient());
        assert!(!ClusterError::from(api_error(403)).is_transient());
        assert!(!ClusterError::NotFound("x".into()).is_transient());
        assert!(!ClusterError::Cancelled.is_transient());
        assert!(!ClusterError::Serialization("bad".into()).is_transient());
        assert!(!ClusterError::Credential("too broad".into()).is_transient());
    }

    #[test]
    fn test_timeout_message() {
        let err = ClusterError::Timeout {
            what: "kustomization controllers".to_string(),
            after: Duration::from_secs(600),
            last_error: None,
        };
        assert_eq!(
            err.to_string(),
            "timed out after 600s waiting for kustomization controllers"
        );

        let err = ClusterError::Timeout {
            what: "nodes".to_string(),
            after: Duration::from_secs(30),
            last_error: Some("connectivity error: refused".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "timed out after 30s waiting for nodes (last error: connectivity error: refused)"
        );
    }
}
