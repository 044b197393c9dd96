//! Domain errors for terminal sessions and ephemeral containers.

use thiserror::Error;

use crate::cluster::ClusterError;

pub type TerminalResult<T> = Result<T, TerminalError>;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    /// The session already reached Terminated or Error.
    #[error("terminal session {0} is already terminated")]
    AlreadyTerminated(i64),

    #[error("cannot start new session more than configured {max}")]
    ConcurrencyLimit { max: usize },

    #[error("{0}")]
    FeatureUnsupported(String),

    /// The ephemeral container was not created through this service.
    #[error("ephemeral container {0} was not created by this service and cannot be terminated")]
    ExternallyInjected(String),

    #[error("pod gone: {0}")]
    PodGone(String),

    #[error("cluster unreachable: {0}")]
    Unreachable(String),

    #[error("{0}")]
    Internal(String),
}

impl From<ClusterError> for TerminalError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::ClusterNotFound(id) => Self::NotFound(format!("cluster {id} not found")),
            ClusterError::NotFound(message) => Self::NotFound(message),
            ClusterError::InvalidInput(message) => Self::BadRequest(message),
            ClusterError::Api { code, message, .. } if code == 400 || code == 422 => {
                Self::BadRequest(message)
            }
            ClusterError::Api { code, message, .. } if code == 403 => Self::Forbidden(message),
            ClusterError::NotRegistered(message) => Self::FeatureUnsupported(message),
            ClusterError::Unreachable(message) | ClusterError::Handshake(message) => {
                Self::Unreachable(message)
            }
            ClusterError::Io(e) => Self::Unreachable(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for TerminalError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}
