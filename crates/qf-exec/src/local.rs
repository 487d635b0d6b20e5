//! Local subprocess backend.
//!
//! Each submitted job gets:
//! - one reader task per output stream, feeding a bounded channel
//! - a collector task draining that channel into the job's `LogBuffer` and
//!   mirroring every line into `quantics.log`
//! - a supervising task that waits for the process (or a kill request) and
//!   publishes the exit status
//!
//! Jobs are keyed by a generated id rather than the pid, which the OS reuses.
//! On unix the solver leads its own process group so a kill also reaches
//! wrapper scripts and anything they started.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use qf_core::{BackendHandle, BackendKind, Calculation, OutputSummary};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{ExecutionBackend, FailureDetail, JobStatus};
use crate::log_buffer::{LogBuffer, LogStream};
use crate::staging;
use crate::{ExecError, ExecResult};

const LINE_CHANNEL_CAPACITY: usize = 256;
const STDERR_TAIL_LINES: usize = 20;
/// Upper bound on draining output after the process exits; grandchildren
/// may keep the pipes open.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// After a kill the whole group is gone, so the pipes close almost at once.
const KILLED_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const CANCEL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub solver: String,
    pub extra_args: Vec<String>,
    pub log_capacity: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            solver: "quantics".to_string(),
            extra_args: Vec::new(),
            log_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExitInfo {
    code: Option<i32>,
    killed: bool,
    wait_error: Option<String>,
}

impl ExitInfo {
    fn status(&self) -> JobStatus {
        if self.code == Some(0) && !self.killed && self.wait_error.is_none() {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        }
    }
}

struct LocalJob {
    name: String,
    working_directory: PathBuf,
    logs: LogBuffer,
    exit: watch::Receiver<Option<ExitInfo>>,
    /// Carries the channel acknowledged once the exit is published.
    kill: Mutex<Option<oneshot::Sender<oneshot::Sender<()>>>>,
}

impl LocalJob {
    fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.borrow().clone()
    }
}

pub struct LocalBackend {
    config: LocalConfig,
    jobs: Mutex<HashMap<String, Arc<LocalJob>>>,
}

impl LocalBackend {
    pub fn new(config: LocalConfig) -> Self {
        Self {
            config,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn job(&self, handle: &BackendHandle) -> ExecResult<Arc<LocalJob>> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.get(&handle.token)
            .cloned()
            .ok_or_else(|| ExecError::UnknownHandle(handle.token.clone()))
    }

    fn command(&self, calc: &Calculation) -> Command {
        let mut cmd = Command::new(&self.config.solver);
        cmd.arg("-mnd")
            .args(&self.config.extra_args)
            .arg(staging::STAGED_INPUT)
            .current_dir(&calc.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
fn signal_process_group(pid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid).map_err(std::io::Error::other)?;
    // SAFETY: killpg only sends a signal; it touches no memory of ours.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn signal_process_group(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process groups are not available on this platform",
    ))
}

fn kill_job(child: &mut Child, name: &str) {
    if let Some(pid) = child.id() {
        match signal_process_group(pid) {
            Ok(()) => return,
            Err(err) => debug!(calc = %name, pid, "group kill unavailable, killing the solver only: {err}"),
        }
    }
    if let Err(err) = child.start_kill() {
        warn!(calc = %name, "kill failed: {err}");
    }
}

fn spawn_reader<R>(reader: R, stream: LogStream, tx: mpsc::Sender<(LogStream, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((stream, line)).await.is_err() {
                break;
            }
        }
    });
}

async fn collect_lines(
    mut rx: mpsc::Receiver<(LogStream, String)>,
    logs: LogBuffer,
    log_path: PathBuf,
) {
    let mut file = match tokio::fs::File::create(&log_path).await {
        Ok(file) => Some(file),
        Err(err) => {
            warn!(path = %log_path.display(), "cannot create solver log: {err}");
            None
        }
    };

    while let Some((stream, line)) = rx.recv().await {
        if let Some(f) = file.as_mut() {
            let written = async {
                f.write_all(line.as_bytes()).await?;
                f.write_all(b"\n").await
            }
            .await;
            if let Err(err) = written {
                warn!(path = %log_path.display(), "solver log write failed: {err}");
                file = None;
            }
        }
        logs.push(stream, line);
    }

    if let Some(mut f) = file {
        let _ = f.flush().await;
    }
}

async fn supervise(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<oneshot::Sender<()>>,
    collector: tokio::task::JoinHandle<()>,
    logs: LogBuffer,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    name: String,
) {
    let (exit, ack, drain) = tokio::select! {
        status = child.wait() => {
            let exit = match status {
                Ok(status) => ExitInfo { code: status.code(), killed: false, wait_error: None },
                Err(err) => ExitInfo { code: None, killed: false, wait_error: Some(err.to_string()) },
            };
            (exit, None, LOG_DRAIN_TIMEOUT)
        }
        Ok(ack) = &mut kill_rx => {
            kill_job(&mut child, &name);
            let exit = match child.wait().await {
                Ok(status) => ExitInfo { code: status.code(), killed: true, wait_error: None },
                Err(err) => ExitInfo { code: None, killed: true, wait_error: Some(err.to_string()) },
            };
            (exit, Some(ack), KILLED_DRAIN_TIMEOUT)
        }
    };

    if tokio::time::timeout(drain, collector).await.is_err() {
        warn!(calc = %name, "output streams still open after exit; log may be incomplete");
    }
    logs.close();

    info!(calc = %name, code = ?exit.code, killed = exit.killed, "solver exited");
    let _ = exit_tx.send(Some(exit));
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn submit(&self, calc: &Calculation) -> ExecResult<BackendHandle> {
        let workdir = calc.working_directory.clone();
        let artifacts = calc.artifacts.clone();
        let staged = tokio::task::spawn_blocking(move || staging::stage_local_inputs(&artifacts, &workdir))
            .await
            .map_err(|err| ExecError::Submission(format!("staging task failed: {err}")))?
            .map_err(|err| ExecError::Submission(format!("staging inputs failed: {err}")))?;
        debug!(calc = %calc.name, input = %staged.input.display(), "inputs staged");

        let mut child = self.command(calc).spawn().map_err(|err| {
            ExecError::Submission(format!("cannot start '{}': {err}", self.config.solver))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| ExecError::Submission("process exited before it was tracked".to_string()))?;

        let logs = LogBuffer::new(self.config.log_capacity);
        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, LogStream::Stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, LogStream::Stderr, line_tx.clone());
        }
        drop(line_tx);

        let collector = tokio::spawn(collect_lines(
            line_rx,
            logs.clone(),
            calc.working_directory.join(staging::SOLVER_LOG),
        ));

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise(
            child,
            kill_rx,
            collector,
            logs.clone(),
            exit_tx,
            calc.name.to_string(),
        ));

        let token = Uuid::new_v4().to_string();
        let job = Arc::new(LocalJob {
            name: calc.name.to_string(),
            working_directory: calc.working_directory.clone(),
            logs,
            exit: exit_rx,
            kill: Mutex::new(Some(kill_tx)),
        });
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone(), job);

        info!(calc = %calc.name, pid, job = %token, solver = %self.config.solver, "local job started");
        Ok(BackendHandle::new(BackendKind::Local, token).with_pid(pid))
    }

    async fn poll(&self, handle: &BackendHandle) -> ExecResult<JobStatus> {
        let job = self.job(handle)?;
        Ok(match job.exit_info() {
            Some(exit) => exit.status(),
            None => JobStatus::Running,
        })
    }

    /// Kill the job's process group and return once its exit is published.
    ///
    /// A handle from another process is cancelled through its recorded pid.
    async fn cancel(&self, handle: &BackendHandle) -> ExecResult<()> {
        let job = match self.job(handle) {
            Ok(job) => job,
            Err(err) => return cancel_foreign(handle, err),
        };
        if job.exit_info().is_some() {
            return Err(ExecError::Cancel(format!("job {} already terminated", handle.token)));
        }
        let kill = job
            .kill
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ExecError::Cancel(format!("job {} is already being cancelled", handle.token)))?;
        let (ack_tx, ack_rx) = oneshot::channel();
        if kill.send(ack_tx).is_err() {
            return Err(ExecError::Cancel(format!("job {} already terminated", handle.token)));
        }

        if tokio::time::timeout(CANCEL_WAIT, ack_rx).await.is_err() {
            warn!(calc = %job.name, "process did not exit within {:?} of kill", CANCEL_WAIT);
        }
        Ok(())
    }

    async fn fetch_output(&self, handle: &BackendHandle) -> ExecResult<OutputSummary> {
        let job = self.job(handle)?;
        if job.exit_info().is_none() {
            return Err(ExecError::NotReady(handle.token.clone()));
        }
        let workdir = job.working_directory.clone();
        let name = job.name.clone();
        let summary = tokio::task::spawn_blocking(move || {
            let dir = staging::output_directory(&workdir, &name);
            staging::discover_output(&dir, &workdir.join(staging::SOLVER_LOG))
        })
        .await
        .map_err(|err| ExecError::Io(std::io::Error::other(err)))??;
        Ok(summary)
    }

    async fn wait(&self, handle: &BackendHandle, _interval: Duration) -> ExecResult<JobStatus> {
        let job = self.job(handle)?;
        let mut exit = job.exit.clone();
        if exit.wait_for(Option::is_some).await.is_err() {
            // Supervisor gone without publishing an exit.
            return Ok(JobStatus::Failed);
        }
        Ok(job.exit_info().map(|e| e.status()).unwrap_or(JobStatus::Failed))
    }

    async fn failure_detail(&self, handle: &BackendHandle) -> Option<FailureDetail> {
        let job = self.job(handle).ok()?;
        let exit = job.exit_info()?;
        let stderr = job.logs.tail(LogStream::Stderr, STDERR_TAIL_LINES).join("\n");

        let mut message = match (&exit.wait_error, exit.killed, exit.code) {
            (Some(err), _, _) => format!("waiting for the solver failed: {err}"),
            (None, true, _) => "solver was killed".to_string(),
            (None, false, Some(code)) => format!("solver exited with code {code}"),
            (None, false, None) => "solver terminated by a signal".to_string(),
        };
        if !stderr.is_empty() {
            message.push_str(":\n");
            message.push_str(&stderr);
        }
        Some(FailureDetail {
            exit_code: exit.code,
            message,
        })
    }

    fn logs(&self, handle: &BackendHandle) -> Option<LogBuffer> {
        self.job(handle).ok().map(|job| job.logs.clone())
    }

    fn release(&self, handle: &BackendHandle) {
        let released = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.token);
        if let Some(job) = released {
            debug!(calc = %job.name, job = %handle.token, "local job released");
        }
    }
}

fn cancel_foreign(handle: &BackendHandle, unknown: ExecError) -> ExecResult<()> {
    let Some(pid) = handle.pid else {
        return Err(unknown);
    };
    match signal_process_group(pid) {
        Ok(()) => {
            info!(pid, job = %handle.token, "killed solver supervised by another process");
            Ok(())
        }
        Err(err) if is_no_such_process(&err) => {
            Err(ExecError::Cancel(format!("job {} already terminated", handle.token)))
        }
        Err(err) => Err(ExecError::Cancel(format!(
            "cannot signal process group {pid} of job {}: {err}",
            handle.token
        ))),
    }
}

#[cfg(unix)]
fn is_no_such_process(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn is_no_such_process(_err: &std::io::Error) -> bool {
    false
}
