//! `RemoteService` backed by an external bridge executable.
//!
//! Protocol, one invocation per call, reply on stdout:
//! - `<bridge> submit <descriptor.json>` -> job id
//! - `<bridge> query <id>` -> state word, optionally followed by an exit status
//! - `<bridge> fetch <id>` -> local directory holding the retrieved files
//! - `<bridge> cancel <id>` -> ignored; exit 0 acknowledges

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::remote::{JobDescriptor, RemoteService, RemoteStatus};
use crate::{ExecError, ExecResult};

#[derive(Debug, Clone)]
pub struct CommandRemoteService {
    bridge: PathBuf,
    descriptor_dir: PathBuf,
}

impl CommandRemoteService {
    /// Descriptors are written to `descriptor_dir` before submission.
    pub fn new(bridge: PathBuf, descriptor_dir: PathBuf) -> Self {
        Self {
            bridge,
            descriptor_dir,
        }
    }

    async fn call(&self, args: &[&str]) -> ExecResult<String> {
        debug!(bridge = %self.bridge.display(), ?args, "bridge call");
        let output = Command::new(&self.bridge)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| ExecError::Remote(format!("cannot run {}: {err}", self.bridge.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecError::Remote(format!(
                "bridge {} failed ({}): {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl RemoteService for CommandRemoteService {
    async fn submit(&self, descriptor: &JobDescriptor) -> ExecResult<String> {
        tokio::fs::create_dir_all(&self.descriptor_dir).await?;
        let path = self
            .descriptor_dir
            .join(format!("{}.json", descriptor.submission_id));
        tokio::fs::write(&path, serde_json::to_vec_pretty(descriptor)?).await?;

        let path = path.to_string_lossy();
        let job_id = self
            .call(&["submit", path.as_ref()])
            .await
            .map_err(|err| ExecError::Submission(err.to_string()))?;
        if job_id.is_empty() {
            return Err(ExecError::Submission("bridge returned an empty job id".to_string()));
        }
        Ok(job_id)
    }

    async fn query(&self, job_id: &str) -> ExecResult<RemoteStatus> {
        Ok(RemoteStatus::parse(&self.call(&["query", job_id]).await?))
    }

    async fn fetch(&self, job_id: &str) -> ExecResult<PathBuf> {
        let dir = self.call(&["fetch", job_id]).await?;
        if dir.is_empty() {
            return Err(ExecError::Remote(format!("bridge returned no output location for {job_id}")));
        }
        Ok(PathBuf::from(dir))
    }

    async fn cancel(&self, job_id: &str) -> ExecResult<()> {
        self.call(&["cancel", job_id]).await.map(|_| ())
    }
}
