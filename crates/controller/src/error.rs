//! Error types shared by the engine and the reconciliation driver.

use std::time::Duration;

use thiserror::Error;

use crate::engine::selector::SelectorError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Object is missing a name")]
    MissingObjectKey,

    #[error("Invalid cluster selector: {0}")]
    Selector(#[from] SelectorError),

    /// Status write rejected because the object changed since it was read
    #[error("Status update conflict on HealthPolicy {0}")]
    Conflict(String),

    #[error("Status update on HealthPolicy {policy} abandoned after {attempts} conflicting writes")]
    ConflictRetriesExhausted { policy: String, attempts: u32 },

    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Finalizer error: {0}")]
    Finalizer(String),

    #[error("Failed to signal own process: {0}")]
    Signal(std::io::Error),

    #[error("Notification delivery failed: {0}")]
    Notify(#[from] notify::ChannelError),
}

impl Error {
    /// Whether the error is an optimistic-concurrency conflict worth retrying
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::KubeError(kube::Error::Api(response)) => response.code == 409,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
