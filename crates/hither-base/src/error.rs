//! The error kinds the core distinguishes. See the error handling table: errors inside user
//! code are always captured as a [`JobStatus::Error`][crate::JobStatus::Error] rather than
//! propagated through the manager loop; errors inside manager/handler plumbing are logged and
//! converted to a job error whenever a job identity is available, otherwise returned here to
//! the caller of `wait`/`queue_job`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HitherError {
    #[error("value is not serializable: {0}")]
    NotSerializable(String),

    #[error("dependency error: {0}")]
    DependencyError(String),

    #[error("container preparation failed for {image}: {message}")]
    ContainerPreparation { image: String, message: String },

    #[error("{0}")]
    ExecutionError(String),

    #[error("job cancelled")]
    JobCancelled,

    #[error("job timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("worker process died without reporting a result")]
    WorkerDied,

    #[error("timed out waiting for compute resource to acknowledge job handler registration")]
    RegistrationTimeout,

    #[error("file unavailable: {0}")]
    FileUnavailable(String),

    #[error("function {name} is already registered with a different definition")]
    DuplicateFunction { name: String },

    #[error("failed to deserialize job on remote side: {0}")]
    DeserializationException(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HitherError>;
