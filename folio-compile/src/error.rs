use std::time::Duration;
use thiserror::Error;

use folio_core::StoreError;

use crate::job::{JobId, JobStatus};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("job {0} not found or expired")]
    JobNotFound(JobId),

    #[error("job {id} is {status:?}; artifact not ready")]
    NotReady { id: JobId, status: JobStatus },

    #[error("no log available yet for job {0}")]
    LogUnavailable(JobId),

    #[error("not a compilable source file: {0}")]
    UnsupportedSource(String),

    #[error("compilation produced no output")]
    NoArtifact,

    #[error("compilation timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("compile task aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
