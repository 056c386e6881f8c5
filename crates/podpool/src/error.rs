//! Pool manager error types.

use thiserror::Error;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur while managing pods.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The backend could not be reached or answered with a server error.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A conditional label patch lost against a concurrent writer.
    #[error("conflicting update on pod {pod_id}")]
    Conflict { pod_id: String },

    /// The pod exists but has no address yet.
    #[error("pod {pod_id} is not ready yet ({phase})")]
    NotReady { pod_id: String, phase: String },

    /// The pod reached a failed or unknown phase.
    #[error("pod {pod_id} failed ({phase})")]
    PodFailure { pod_id: String, phase: String },

    /// The backend rejected pod creation.
    #[error("failed to spawn pod: {0}")]
    SpawnFailure(String),

    /// Pod was not found.
    #[error("pod not found: {0}")]
    NotFound(String),

    /// No template is registered under this environment id.
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    /// No session is registered under this id.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Failed to parse backend output.
    #[error("failed to parse backend output: {0}")]
    ParseError(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::BackendUnavailable(_) | PoolError::Conflict { .. } | PoolError::NotReady { .. }
        )
    }

    /// Whether the error means the pod no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PoolError::NotFound(_))
    }
}

impl From<reqwest::Error> for PoolError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PoolError::ParseError(err.to_string())
        } else {
            PoolError::BackendUnavailable(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(PoolError::BackendUnavailable("down".into()).is_retryable());
        assert!(
            PoolError::NotReady {
                pod_id: "p".into(),
                phase: "pending".into()
            }
            .is_retryable()
        );
        assert!(
            !PoolError::PodFailure {
                pod_id: "p".into(),
                phase: "failed".into()
            }
            .is_retryable()
        );
        assert!(!PoolError::SpawnFailure("quota".into()).is_retryable());
        assert!(PoolError::NotFound("p".into()).is_not_found());
    }
}
