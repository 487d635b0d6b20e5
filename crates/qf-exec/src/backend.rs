use std::time::Duration;

use async_trait::async_trait;
use qf_core::{BackendHandle, BackendKind, Calculation, OutputSummary};
use serde::{Deserialize, Serialize};

use crate::ExecResult;
use crate::log_buffer::LogBuffer;

/// Coarse job status reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Diagnostic for a job that ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetail {
    pub exit_code: Option<i32>,
    pub message: String,
}

/// A place to run a Quantics job.
///
/// Implementations never block the caller on job completion: `submit`
/// returns as soon as the job is launched or enqueued and `poll` returns the
/// current status without waiting.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Launch or enqueue the job for `calc`.
    async fn submit(&self, calc: &Calculation) -> ExecResult<BackendHandle>;

    async fn poll(&self, handle: &BackendHandle) -> ExecResult<JobStatus>;

    /// Best effort; fails with `Cancel` when the job already terminated.
    async fn cancel(&self, handle: &BackendHandle) -> ExecResult<()>;

    /// Output location and summary; `NotReady` until `poll` reports a terminal status.
    async fn fetch_output(&self, handle: &BackendHandle) -> ExecResult<OutputSummary>;

    /// Resolve once the job reaches a terminal status.
    async fn wait(&self, handle: &BackendHandle, interval: Duration) -> ExecResult<JobStatus> {
        loop {
            let status = self.poll(handle).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn failure_detail(&self, _handle: &BackendHandle) -> Option<FailureDetail> {
        None
    }

    /// Live log of the job, when the backend captures one.
    fn logs(&self, _handle: &BackendHandle) -> Option<LogBuffer> {
        None
    }

    /// Drop any bookkeeping kept for `handle`.
    fn release(&self, _handle: &BackendHandle) {}
}
