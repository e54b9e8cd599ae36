use crate::accounting::AccountingError;
use crate::job::JobState;
use crate::sandbox::SandboxError;
use sandrun_common::types::{DecodeError, Encoding};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("file path \"{name}\" tries to escape parent directory")]
    PathTraversal { name: String },
    #[error("file path \"{name}\" does not name a file")]
    InvalidPath { name: String },
    #[error("file \"{name}\" is not valid {encoding}: {source}")]
    Decode {
        name: String,
        encoding: Encoding,
        #[source]
        source: DecodeError,
    },
    #[error("failed to provision sandbox box #{box_id}: {source}")]
    Provision {
        box_id: u32,
        #[source]
        source: SandboxError,
    },
    #[error("failed to stage submission: {0}")]
    Staging(#[from] std::io::Error),
    #[error("failed to spawn sandboxed process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(
        "error reading metadata file: {}\nError: {reason}\nsandbox stdout: {stdout}\nsandbox stderr: {stderr}",
        .path.display()
    )]
    Accounting {
        path: PathBuf,
        reason: AccountingReadError,
        stdout: String,
        stderr: String,
    },
    #[error("job must be in {expected} state, current state: {actual}")]
    State { expected: JobState, actual: JobState },
    #[error("admission controller went away before granting a slot")]
    SlotUnavailable,
    #[error("no free sandbox box ids")]
    BoxIdsExhausted,
}

impl JobError {
    /// Errors caused by the submission itself rather than the worker.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            JobError::PathTraversal { .. } | JobError::InvalidPath { .. } | JobError::Decode { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccountingReadError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Parse(#[from] AccountingError),
}
