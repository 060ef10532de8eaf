use thiserror::Error;

use crate::job::JobStatus;
use crate::provider::ProviderError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid job request: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {id} is {status} and can no longer change")]
    Frozen { id: String, status: JobStatus },

    #[error("Illegal transition for job {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Illegal progress for job {id}: {from} -> {to} of {total}")]
    IllegalProgress {
        id: String,
        from: usize,
        to: usize,
        total: usize,
    },

    #[error("Cannot {action} job {id} while it is {status}")]
    InvalidState {
        id: String,
        status: JobStatus,
        action: &'static str,
    },

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
