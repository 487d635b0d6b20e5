//! Remote backend: jobs are handed to an external workflow service and
//! tracked by polling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use qf_core::{BackendHandle, BackendKind, Calculation, OutputSummary, WorkflowType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{ExecutionBackend, FailureDetail, JobStatus};
use crate::staging;
use crate::{ExecError, ExecResult};

pub const REMOTE_STDOUT: &str = "quantics.out";
pub const REMOTE_STDERR: &str = "quantics.err";
pub const REMOTE_OUTPUT_DIR: &str = "output";

/// Submission and status interface of the workflow service.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Enqueue a job; returns the service's job id.
    async fn submit(&self, descriptor: &JobDescriptor) -> ExecResult<String>;

    async fn query(&self, job_id: &str) -> ExecResult<RemoteStatus>;

    /// Local directory holding the retrieved files.
    async fn fetch(&self, job_id: &str) -> ExecResult<PathBuf>;

    async fn cancel(&self, job_id: &str) -> ExecResult<()>;
}

/// Process state as reported by the workflow service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Created,
    Submitted,
    Queued,
    Waiting,
    Running,
    /// Finished with an optional exit status; nonzero means failure.
    Finished(Option<i32>),
    Failed,
    Excepted,
    Killed,
    Other(String),
}

impl RemoteStatus {
    /// Accepts the service's state word, optionally followed by an exit status
    /// (`"finished 0"`, `"FINISHED:200"`).
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let mut parts = raw.split(|c: char| c.is_whitespace() || c == ':').filter(|p| !p.is_empty());
        let word = parts.next().unwrap_or_default().to_ascii_lowercase();
        match word.as_str() {
            "created" => RemoteStatus::Created,
            "submitted" => RemoteStatus::Submitted,
            "queued" => RemoteStatus::Queued,
            "waiting" => RemoteStatus::Waiting,
            "running" => RemoteStatus::Running,
            "finished" => RemoteStatus::Finished(parts.next().and_then(|code| code.parse().ok())),
            "failed" => RemoteStatus::Failed,
            "excepted" => RemoteStatus::Excepted,
            "killed" => RemoteStatus::Killed,
            _ => RemoteStatus::Other(raw.to_string()),
        }
    }

    /// Values not explicitly enumerated map to `Pending`.
    pub fn job_status(&self) -> JobStatus {
        match self {
            RemoteStatus::Created
            | RemoteStatus::Submitted
            | RemoteStatus::Queued
            | RemoteStatus::Waiting
            | RemoteStatus::Other(_) => JobStatus::Pending,
            RemoteStatus::Running => JobStatus::Running,
            RemoteStatus::Finished(None | Some(0)) => JobStatus::Succeeded,
            RemoteStatus::Finished(Some(_))
            | RemoteStatus::Failed
            | RemoteStatus::Excepted
            | RemoteStatus::Killed => JobStatus::Failed,
        }
    }
}

/// Source file copied into the remote job folder under `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub source: PathBuf,
    pub target: String,
}

/// Scheduler resources. SGE takes a parallel environment and a total process
/// count; other schedulers take machines and processes per machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tot_num_mpiprocs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_machines: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_mpiprocs_per_machine: Option<u32>,
}

impl Resources {
    pub fn for_scheduler(scheduler: &str, num_machines: u32, mpiprocs: u32) -> Self {
        let scheduler = scheduler.to_ascii_lowercase();
        if scheduler == "sge" || scheduler == "core.sge" {
            Self {
                parallel_env: Some("smp".to_string()),
                tot_num_mpiprocs: Some(mpiprocs),
                num_machines: None,
                num_mpiprocs_per_machine: None,
            }
        } else {
            Self {
                parallel_env: None,
                tot_num_mpiprocs: None,
                num_machines: Some(num_machines),
                num_mpiprocs_per_machine: Some(mpiprocs),
            }
        }
    }
}

/// Everything the workflow service needs to run one calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub submission_id: Uuid,
    pub label: String,
    pub workflow_type: WorkflowType,
    /// Code registered with the service, `label@computer`.
    pub code: String,
    pub arguments: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub input_files: Vec<StagedFile>,
    pub retrieve: Vec<String>,
    pub resources: Resources,
    pub walltime_s: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

impl JobDescriptor {
    pub fn for_calculation(calc: &Calculation, config: &RemoteConfig) -> Self {
        let mut input_files = Vec::new();
        if let Some(inp) = &calc.artifacts.inp_file {
            input_files.push(StagedFile {
                source: inp.clone(),
                target: "input.inp".to_string(),
            });
        }
        if let Some(op) = &calc.artifacts.op_file {
            input_files.push(StagedFile {
                source: op.clone(),
                target: "input.op".to_string(),
            });
        }
        if let Some(db) = &calc.artifacts.db_folder {
            input_files.push(StagedFile {
                source: db.clone(),
                target: "database".to_string(),
            });
        }

        Self {
            submission_id: Uuid::new_v4(),
            label: calc.name.to_string(),
            workflow_type: calc.workflow_type,
            code: config.code_label.clone(),
            arguments: vec![staging::STAGED_INPUT.to_string()],
            stdout: REMOTE_STDOUT.to_string(),
            stderr: REMOTE_STDERR.to_string(),
            input_files,
            retrieve: vec![
                REMOTE_STDOUT.to_string(),
                REMOTE_STDERR.to_string(),
                format!("{REMOTE_OUTPUT_DIR}/*"),
            ],
            resources: Resources::for_scheduler(&config.scheduler, config.num_machines, config.mpiprocs),
            walltime_s: config.walltime_s,
            queue: config.queue.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub code_label: String,
    pub scheduler: String,
    pub num_machines: u32,
    pub mpiprocs: u32,
    pub walltime_s: u64,
    pub queue: Option<String>,
    /// Bound on a single status query or fetch.
    pub call_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            code_label: "quantics@localhost".to_string(),
            scheduler: "direct".to_string(),
            num_machines: 1,
            mpiprocs: 1,
            walltime_s: 3600,
            queue: None,
            call_timeout: Duration::from_secs(2),
        }
    }
}

pub struct RemoteBackend {
    service: Arc<dyn RemoteService>,
    config: RemoteConfig,
    /// Terminal statuses are cached so repeated polls never reach the service.
    terminal: Mutex<HashMap<String, RemoteStatus>>,
}

impl RemoteBackend {
    pub fn new(service: Arc<dyn RemoteService>, config: RemoteConfig) -> Self {
        Self {
            service,
            config,
            terminal: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, job_id: &str) -> Option<RemoteStatus> {
        self.terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }

    async fn query(&self, job_id: &str) -> ExecResult<RemoteStatus> {
        if let Some(status) = self.cached(job_id) {
            return Ok(status);
        }
        let status = tokio::time::timeout(self.config.call_timeout, self.service.query(job_id))
            .await
            .map_err(|_| ExecError::PollTimeout(self.config.call_timeout))??;
        debug!(job = job_id, status = ?status, "remote status");
        if status.job_status().is_terminal() {
            self.terminal
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(job_id.to_string(), status.clone());
        }
        Ok(status)
    }
}

fn remote_output(dir: &Path) -> std::io::Result<OutputSummary> {
    let output = dir.join(REMOTE_OUTPUT_DIR);
    let output = if output.is_dir() { output } else { dir.to_path_buf() };
    staging::discover_output(&output, &dir.join(REMOTE_STDOUT))
}

#[async_trait]
impl ExecutionBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn submit(&self, calc: &Calculation) -> ExecResult<BackendHandle> {
        let descriptor = JobDescriptor::for_calculation(calc, &self.config);
        let job_id = self.service.submit(&descriptor).await.map_err(|err| match err {
            ExecError::Submission(msg) => ExecError::Submission(msg),
            other => ExecError::Submission(other.to_string()),
        })?;
        info!(calc = %calc.name, job = %job_id, code = %descriptor.code, "remote job submitted");
        Ok(BackendHandle::new(BackendKind::Remote, job_id))
    }

    async fn poll(&self, handle: &BackendHandle) -> ExecResult<JobStatus> {
        Ok(self.query(&handle.token).await?.job_status())
    }

    async fn cancel(&self, handle: &BackendHandle) -> ExecResult<()> {
        if let Some(status) = self.cached(&handle.token) {
            return Err(ExecError::Cancel(format!(
                "remote job {} already ended ({status:?})",
                handle.token
            )));
        }
        self.service
            .cancel(&handle.token)
            .await
            .map_err(|err| ExecError::Cancel(err.to_string()))
    }

    async fn fetch_output(&self, handle: &BackendHandle) -> ExecResult<OutputSummary> {
        if !self.poll(handle).await?.is_terminal() {
            return Err(ExecError::NotReady(handle.token.clone()));
        }
        let dir = tokio::time::timeout(self.config.call_timeout, self.service.fetch(&handle.token))
            .await
            .map_err(|_| ExecError::PollTimeout(self.config.call_timeout))??;
        let summary = tokio::task::spawn_blocking(move || remote_output(&dir))
            .await
            .map_err(|err| ExecError::Io(std::io::Error::other(err)))??;
        Ok(summary)
    }

    async fn failure_detail(&self, handle: &BackendHandle) -> Option<FailureDetail> {
        let status = self.cached(&handle.token)?;
        let exit_code = match status {
            RemoteStatus::Finished(code) => code,
            _ => None,
        };
        Some(FailureDetail {
            exit_code,
            message: format!("remote job {} ended as {status:?}", handle.token),
        })
    }

    fn release(&self, handle: &BackendHandle) {
        self.terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_words_map_to_job_status() {
        assert_eq!(RemoteStatus::parse("RUNNING").job_status(), JobStatus::Running);
        assert_eq!(RemoteStatus::parse("queued").job_status(), JobStatus::Pending);
        assert_eq!(RemoteStatus::parse("finished").job_status(), JobStatus::Succeeded);
        assert_eq!(RemoteStatus::parse("finished 0").job_status(), JobStatus::Succeeded);
        assert_eq!(RemoteStatus::parse("FINISHED:200").job_status(), JobStatus::Failed);
        assert_eq!(RemoteStatus::parse("excepted").job_status(), JobStatus::Failed);
        assert_eq!(RemoteStatus::parse("killed").job_status(), JobStatus::Failed);
    }

    #[test]
    fn unknown_status_is_pending() {
        let status = RemoteStatus::parse("hibernating");
        assert_eq!(status, RemoteStatus::Other("hibernating".to_string()));
        assert_eq!(status.job_status(), JobStatus::Pending);
        assert_eq!(RemoteStatus::parse("").job_status(), JobStatus::Pending);
    }

    #[test]
    fn sge_resources_use_parallel_env() {
        let sge = Resources::for_scheduler("core.sge", 2, 8);
        assert_eq!(sge.parallel_env.as_deref(), Some("smp"));
        assert_eq!(sge.tot_num_mpiprocs, Some(8));
        assert_eq!(sge.num_machines, None);

        let slurm = Resources::for_scheduler("slurm", 2, 8);
        assert_eq!(slurm.num_machines, Some(2));
        assert_eq!(slurm.num_mpiprocs_per_machine, Some(8));
        assert_eq!(slurm.parallel_env, None);
    }

    #[test]
    fn descriptor_stages_inputs_under_fixed_names() {
        use qf_core::{Artifacts, CalcName};

        let calc = Calculation::new(
            CalcName::parse("dd").unwrap(),
            WorkflowType::DdVmcg,
            Artifacts::new("/in/a.inp", "/in/a.op").with_database("/in/db"),
            PathBuf::from("/runs/dd"),
            BackendKind::Remote,
        );
        let descriptor = JobDescriptor::for_calculation(&calc, &RemoteConfig::default());

        let targets: Vec<_> = descriptor.input_files.iter().map(|f| f.target.as_str()).collect();
        assert_eq!(targets, vec!["input.inp", "input.op", "database"]);
        assert_eq!(descriptor.retrieve, vec!["quantics.out", "quantics.err", "output/*"]);
        assert_eq!(descriptor.walltime_s, 3600);
        assert_eq!(descriptor.label, "dd");
    }
}
