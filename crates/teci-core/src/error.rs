//! Error taxonomy for teci.

/// teci domain errors.
///
/// Variants up to `NoNodes` are fatal configuration errors: the run is
/// aborted with the message, never retried.
#[derive(Debug, thiserror::Error)]
pub enum TeciError {
    #[error("no repository URL for component {component}: set the {param} parameter or {var}")]
    MissingUrl {
        component: String,
        param: String,
        var: String,
    },

    #[error("invalid component identifier: {0:?}")]
    InvalidComponent(String),

    #[error("no nodes available with label {label}")]
    NoNodes { label: String },

    #[error("checkout of {component} failed: {reason}")]
    Checkout { component: String, reason: String },

    #[error("artifact {path} not found for job {job}")]
    ArtifactNotFound { job: String, path: String },

    #[error("artifact store error: {0}")]
    Artifact(String),

    #[error("mail delivery failed: {0}")]
    Mail(String),

    #[error("failed to trigger {job}: {reason}")]
    Trigger { job: String, reason: String },

    #[error("lock {name} could not be acquired: {reason}")]
    Lock { name: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for teci operations.
pub type Result<T> = std::result::Result<T, TeciError>;
