//! Error types for the EMQX Kubernetes Operator

use std::time::Duration;
use thiserror::Error;

/// Delay used when a transient error is turned into a requeue
pub const TRANSIENT_REQUEUE_DELAY: Duration = Duration::from_secs(5);

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Another writer updated the object since it was read
    #[error("Conflict writing {0}")]
    Conflict(String),

    /// Object was created concurrently
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Broker admin API unreachable or returned an unexpected response
    #[error("Broker API error: {0}")]
    BrokerApi(String),

    /// No free revision name could be found for a replicant pod template
    #[error("Revision name collisions for {name} not resolved after {attempts} attempts")]
    CollisionRetriesExhausted { name: String, attempts: u32 },

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Wrap an error with the step that produced it.
    ///
    /// Transient errors are returned unchanged so that callers can still
    /// classify them.
    pub fn context(self, what: &str) -> Self {
        if self.is_transient() {
            return self;
        }
        OperatorError::ReconcileFailed(format!("{}: {}", what, self))
    }

    /// Check if this error only needs a short requeue
    pub fn is_transient(&self) -> bool {
        match self {
            OperatorError::Conflict(_)
            | OperatorError::AlreadyExists(_)
            | OperatorError::Timeout(_) => true,
            OperatorError::KubeError(kube::Error::Api(ae)) => ae.code == 429 || ae.code >= 500,
            OperatorError::KubeError(_) => true,
            _ => false,
        }
    }

    /// Get a suggested requeue delay for transient errors
    pub fn requeue_delay(&self) -> Option<Duration> {
        if self.is_transient() {
            Some(TRANSIENT_REQUEUE_DELAY)
        } else {
            None
        }
    }
}

/// Classify a kube error, mapping optimistic-concurrency failures to
/// [`OperatorError::Conflict`] and create races to [`OperatorError::AlreadyExists`].
pub fn from_kube(err: kube::Error, what: &str) -> OperatorError {
    match err {
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            OperatorError::AlreadyExists(what.to_string())
        }
        kube::Error::Api(ae) if ae.code == 409 => OperatorError::Conflict(what.to_string()),
        other => OperatorError::KubeError(other),
    }
}
