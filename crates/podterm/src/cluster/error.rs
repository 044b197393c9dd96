//! Cluster access error types.

use thiserror::Error;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that can occur while talking to a cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// No credentials are stored for the cluster id.
    #[error("cluster {0} not found")]
    ClusterNotFound(i64),

    /// Stored credentials do not form a usable client configuration.
    #[error("invalid cluster configuration: {0}")]
    ConfigInvalid(String),

    /// Transport failure, timeout or failed reachability check.
    #[error("cluster unreachable: {0}")]
    Unreachable(String),

    /// The addressed object does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The object already exists.
    #[error("{0}")]
    AlreadyExists(String),

    /// The API server does not serve the requested kind or subresource.
    #[error("kind is not registered on the cluster: {0}")]
    NotRegistered(String),

    /// The initial exec/attach upgrade failed.
    #[error("stream handshake failed: {0}")]
    Handshake(String),

    /// Any other API status.
    #[error("cluster api error ({code} {reason}): {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },

    /// The request could not be built from the given input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The local credential store failed.
    #[error("cluster store error: {0}")]
    Store(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Transient errors are skipped by background loops instead of mutating state.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Io(_))
    }

    /// Translate a status returned by the API server.
    pub fn from_status(code: u16, reason: &str, message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("not registered") || code == 415 {
            return Self::NotRegistered(message.to_string());
        }
        match (code, reason) {
            // A 404 without a named object means the path itself is unknown.
            (404, _) if lower.contains("could not find the requested resource") => {
                Self::NotRegistered(message.to_string())
            }
            (404, _) | (_, "NotFound") => Self::NotFound(message.to_string()),
            (409, "AlreadyExists") | (_, "AlreadyExists") => {
                Self::AlreadyExists(message.to_string())
            }
            _ => Self::Api {
                code,
                reason: reason.to_string(),
                message: message.to_string(),
            },
        }
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(status) => Self::from_status(status.code, &status.reason, &status.message),
            kube::Error::UpgradeConnection(e) => Self::Handshake(e.to_string()),
            kube::Error::SerdeError(e) => Self::InvalidInput(e.to_string()),
            kube::Error::BuildRequest(e) => Self::InvalidInput(e.to_string()),
            other => Self::Unreachable(other.to_string()),
        }
    }
}
