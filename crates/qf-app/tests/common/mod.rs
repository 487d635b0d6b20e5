#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use qf_app::{LifecycleManager, ManagerBuilder, ManagerConfig};
use qf_core::{Artifacts, BackendHandle, BackendKind, Calculation, Catalog, OutputSummary};
use qf_exec::{ExecError, ExecResult, ExecutionBackend, FailureDetail, JobStatus};

pub const INPUT: &str = "RUN-SECTION\n  name = ho_out\nend-run-section\nOPERATOR-SECTION\n  opname = ho\nend-operator-section\n";

/// What the stub answers to one poll.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Status(JobStatus),
    Error,
    Hang,
}

/// Backend answering polls from a script; the last step repeats.
pub struct StubBackend {
    kind: BackendKind,
    steps: Mutex<VecDeque<Step>>,
    pub polls: AtomicUsize,
    pub cancels: AtomicUsize,
    pub fail_cancel: bool,
    output: PathBuf,
}

impl StubBackend {
    pub fn new(kind: BackendKind, steps: &[Step], output: PathBuf) -> Self {
        Self {
            kind,
            steps: Mutex::new(steps.iter().copied().collect()),
            polls: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            fail_cancel: false,
            output,
        }
    }

    fn next_step(&self) -> Step {
        let mut steps = self.steps.lock().unwrap();
        if steps.len() > 1 {
            steps.pop_front().unwrap()
        } else {
            steps.front().copied().unwrap_or(Step::Status(JobStatus::Pending))
        }
    }
}

#[async_trait]
impl ExecutionBackend for StubBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn submit(&self, calc: &Calculation) -> ExecResult<BackendHandle> {
        Ok(BackendHandle::new(self.kind, format!("job-{}", calc.name)))
    }

    async fn poll(&self, _handle: &BackendHandle) -> ExecResult<JobStatus> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        match self.next_step() {
            Step::Status(status) => Ok(status),
            Step::Error => Err(ExecError::Remote("connection refused".to_string())),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(JobStatus::Pending)
            }
        }
    }

    async fn cancel(&self, _handle: &BackendHandle) -> ExecResult<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.fail_cancel {
            return Err(ExecError::Cancel("scheduler rejected kill".to_string()));
        }
        Ok(())
    }

    async fn fetch_output(&self, _handle: &BackendHandle) -> ExecResult<OutputSummary> {
        Ok(OutputSummary {
            directory: self.output.clone(),
            files: vec!["output".to_string()],
            ..OutputSummary::default()
        })
    }

    async fn failure_detail(&self, _handle: &BackendHandle) -> Option<FailureDetail> {
        Some(FailureDetail {
            exit_code: Some(3),
            message: "job exited with status 3".to_string(),
        })
    }
}

/// Temporary run root holding one MCTDH input pair and a database folder.
pub struct Fixture {
    _dir: tempfile::TempDir,
    pub root: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        fs::write(root.join("ho.inp"), INPUT).unwrap();
        fs::write(root.join("ho.op"), "OPERATOR\n").unwrap();
        fs::create_dir_all(root.join("db")).unwrap();
        fs::write(root.join("db").join("geo.dat"), "0.0\n").unwrap();
        Self { _dir: dir, root }
    }

    pub fn artifacts(&self) -> Artifacts {
        Artifacts::new(self.root.join("ho.inp"), self.root.join("ho.op"))
    }

    pub fn config(&self) -> ManagerConfig {
        let mut config = ManagerConfig::new(self.root.join("runs"));
        config.poll_interval = Duration::from_millis(20);
        config.poll_timeout = Duration::from_millis(200);
        config.max_poll_failures = 3;
        config
    }

    /// Builder with the real local backend unless `backends` replaces it.
    pub fn builder_with(&self, config: ManagerConfig, backends: Vec<Arc<StubBackend>>) -> ManagerBuilder {
        let mut builder = LifecycleManager::builder(config, Arc::new(Catalog::standard()));
        for backend in backends {
            builder = builder.backend(backend);
        }
        builder
    }

    pub fn manager_with(&self, config: ManagerConfig, backends: Vec<Arc<StubBackend>>) -> LifecycleManager {
        self.builder_with(config, backends).build().unwrap()
    }
}

/// Poll `check` every 10 ms until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Reaped, or a zombie waiting for its reaper.
#[cfg(target_os = "linux")]
pub fn process_gone(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat.rsplit(')').next().and_then(|rest| rest.split_whitespace().next()) == Some("Z"),
        Err(_) => true,
    }
}

#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}
