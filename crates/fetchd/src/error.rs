use thiserror::Error;

use crate::job::JobStatus;

/// Errors surfaced to callers of the job service
#[derive(Debug, Error)]
pub enum JobError {
    /// Bad locator, format or quality; no job was created
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown job id, or the artifact has already been reclaimed
    #[error("not found: {0}")]
    NotFound(String),

    /// The job exists but its artifact is not available
    #[error("job not ready (status: {status}, progress: {progress}%)")]
    NotReady { status: JobStatus, progress: u8 },

    /// The external extraction tool failed
    #[error("extraction failed: {0}")]
    ExtractionFailure(String),

    /// Reading or writing a job snapshot failed
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

pub type JobResult<T> = std::result::Result<T, JobError>;
