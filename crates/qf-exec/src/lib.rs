//! qf-exec: execution backends for Quantics jobs.
//!
//! Contains:
//! - backend (the `ExecutionBackend` capability and job status)
//! - local (subprocess backend with a supervising task)
//! - remote (workflow-service backend, job descriptors, status mapping)
//! - bridge (a `RemoteService` driven through an external command)
//! - log_buffer (replayable capped log of a local job)
//! - staging (input staging and output discovery in a working directory)

pub mod backend;
pub mod bridge;
pub mod local;
pub mod log_buffer;
pub mod remote;
pub mod staging;

use std::time::Duration;

pub use backend::{ExecutionBackend, FailureDetail, JobStatus};
pub use bridge::CommandRemoteService;
pub use local::{LocalBackend, LocalConfig};
pub use log_buffer::{LogBuffer, LogCursor, LogLine, LogStream};
pub use remote::{JobDescriptor, RemoteBackend, RemoteConfig, RemoteService, RemoteStatus, Resources};

pub type ExecResult<T> = Result<T, ExecError>;

#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    #[error("Submission failed: {0}")]
    Submission(String),

    #[error("Poll timed out after {0:?}")]
    PollTimeout(Duration),

    #[error("Cancel failed: {0}")]
    Cancel(String),

    #[error("Output of job {0} is not ready")]
    NotReady(String),

    #[error("Unknown job handle: {0}")]
    UnknownHandle(String),

    #[error("Remote service error: {0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExecError {
    /// Worth another attempt on the next monitoring cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecError::PollTimeout(_) | ExecError::Remote(_) | ExecError::Io(_))
    }
}
