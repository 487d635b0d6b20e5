//! Calculation lifecycle manager.
//!
//! Owns every state transition. Backends report through the manager: local
//! jobs via a supervising task spawned at `run`, remote jobs via
//! `poll_remote_once`, which the monitor drives on a schedule.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use qf_analysis::{AnalysisPipeline, record_outcomes};
use qf_core::{
    AnalysisOutcome, AnalysisRequest, Artifacts, BackendHandle, BackendKind, CalcName, CalcState,
    Calculation, Catalog, CoreError, ErrorKind, ErrorRecord, StateChange, WorkflowType,
};
use qf_exec::{ExecError, ExecutionBackend, JobStatus, LocalBackend, LogBuffer};
use qf_store::{CalculationStore, Registry, compute_input_digest};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::error::{AppError, AppResult};
use crate::events::CalcEvent;
use crate::owner::{self, Session};

type Backends = HashMap<BackendKind, Arc<dyn ExecutionBackend>>;

const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome counts of one monitoring cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub polled: usize,
    pub transitions: usize,
    pub timeouts: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollResult {
    Unchanged,
    Advanced,
    TimedOut,
    Errored,
}

struct Inner {
    config: ManagerConfig,
    catalog: Arc<Catalog>,
    registry: Registry,
    backends: Backends,
    pipeline: AnalysisPipeline,
    events: broadcast::Sender<CalcEvent>,
    /// Names with a submission, cancellation or analysis in flight.
    claims: Mutex<HashSet<String>>,
    poll_failures: Mutex<HashMap<String, u32>>,
    poll_wakeup: Notify,
    session: Session,
}

/// Releases a name claim when dropped.
struct Claim<'a> {
    inner: &'a Inner,
    name: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.inner
            .claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

pub struct ManagerBuilder {
    config: ManagerConfig,
    catalog: Arc<Catalog>,
    backends: Backends,
    recover: bool,
}

impl ManagerBuilder {
    /// Register (or replace) the backend for its kind.
    pub fn backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    /// Whether `build` fails local calculations whose supervising manager is
    /// gone. On by default; read-only callers turn it off.
    pub fn recover_orphans(mut self, enabled: bool) -> Self {
        self.recover = enabled;
        self
    }

    /// Open the registry and, unless disabled, reconcile calculations left
    /// active by a manager that no longer exists.
    pub fn build(self) -> AppResult<LifecycleManager> {
        let registry = match &self.config.records_root {
            Some(dir) => Registry::open(CalculationStore::new(dir.clone())?)?,
            None => Registry::new(),
        };
        let pipeline =
            AnalysisPipeline::new(Arc::clone(&self.catalog)).with_tool_dir(self.config.tool_dir.clone());
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));

        let manager = LifecycleManager {
            inner: Arc::new(Inner {
                config: self.config,
                catalog: self.catalog,
                registry,
                backends: self.backends,
                pipeline,
                events,
                claims: Mutex::new(HashSet::new()),
                poll_failures: Mutex::new(HashMap::new()),
                poll_wakeup: Notify::new(),
                session: Session::start(),
            }),
        };
        if self.recover {
            manager.recover()?;
        }
        Ok(manager)
    }
}

#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    /// Builder with a `LocalBackend` from `config.local` pre-registered.
    pub fn builder(config: ManagerConfig, catalog: Arc<Catalog>) -> ManagerBuilder {
        let local: Arc<dyn ExecutionBackend> = Arc::new(LocalBackend::new(config.local.clone()));
        let mut backends = Backends::new();
        backends.insert(BackendKind::Local, local);
        ManagerBuilder {
            config,
            catalog,
            backends,
            recover: true,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.inner.catalog
    }

    pub fn has_backend(&self, kind: BackendKind) -> bool {
        self.inner.backends.contains_key(&kind)
    }

    fn backend(&self, kind: BackendKind) -> AppResult<Arc<dyn ExecutionBackend>> {
        self.inner
            .backends
            .get(&kind)
            .cloned()
            .ok_or(AppError::BackendUnavailable(kind))
    }

    fn emit(&self, event: CalcEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }

    fn claim(&self, name: &str) -> AppResult<Claim<'_>> {
        let mut claims = self.inner.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if !claims.insert(name.to_string()) {
            let state = self.inner.registry.get(name)?.state;
            return Err(CoreError::InvalidState {
                name: name.to_string(),
                actual: state,
                expected: "no other operation in progress",
            }
            .into());
        }
        Ok(Claim {
            inner: &self.inner,
            name: name.to_string(),
        })
    }

    fn is_claimed(&self, name: &str) -> bool {
        self.inner
            .claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// Apply `to` unless the calculation already reached a terminal state.
    ///
    /// `also` runs in the same registry update, after the transition.
    /// Transitions another process persisted first are announced before it.
    fn transition(
        &self,
        name: &str,
        to: CalcState,
        also: impl FnOnce(&mut Calculation),
    ) -> AppResult<Option<StateChange>> {
        let (change, adopted) = self.inner.registry.update_tracked(name, |calc| {
            if calc.state.is_terminal() {
                return Ok(None);
            }
            let change = calc.apply_transition(to)?;
            also(calc);
            Ok(Some(change))
        })?;

        for change in adopted {
            info!(calc = name, from = %change.from, to = %change.to, "state changed by another process");
            self.emit(CalcEvent::StateChanged {
                name: name.to_string(),
                change,
            });
        }
        if let Some(change) = change {
            info!(calc = name, from = %change.from, to = %change.to, "state changed");
            self.emit(CalcEvent::StateChanged {
                name: name.to_string(),
                change,
            });
        }
        Ok(change)
    }

    fn fail(&self, name: &str, record: ErrorRecord) -> AppResult<Option<StateChange>> {
        warn!(calc = name, kind = ?record.kind, "{}", record.message);
        self.transition(name, CalcState::Failed, move |calc| calc.error = Some(record))
    }

    /// Validate and register a new calculation in `Created`.
    pub fn create(
        &self,
        name: &str,
        workflow_type: WorkflowType,
        artifacts: Artifacts,
        backend: BackendKind,
    ) -> AppResult<Calculation> {
        let name = CalcName::parse(name)?;
        if self.inner.registry.contains(name.as_str()) {
            return Err(CoreError::DuplicateName(name.to_string()).into());
        }
        self.inner.catalog.validate_artifacts(workflow_type, &artifacts)?;
        if !self.has_backend(backend) {
            return Err(AppError::BackendUnavailable(backend));
        }

        let working_directory = name.working_directory(&self.inner.config.runs_root);
        let mut calc = Calculation::new(name, workflow_type, artifacts, working_directory, backend);
        match compute_input_digest(&calc.artifacts) {
            Ok(digest) => calc.input_digest = Some(digest),
            Err(err) => warn!(calc = %calc.name, "cannot digest inputs: {err}"),
        }

        self.inner.registry.insert(calc.clone())?;
        info!(calc = %calc.name, workflow = %workflow_type, %backend, "calculation created");
        self.emit(CalcEvent::Created {
            name: calc.name.to_string(),
            workflow: workflow_type,
            backend,
        });
        Ok(calc)
    }

    /// Submit a `Created` calculation to its backend.
    ///
    /// A submission failure moves the calculation to `Failed` and is returned.
    pub async fn run(&self, name: &str) -> AppResult<BackendHandle> {
        let _claim = self.claim(name)?;
        let calc = self.inner.registry.get(name)?;
        calc.require_state(CalcState::Created)?;
        let backend = self.backend(calc.backend)?;

        let handle = match backend.submit(&calc).await {
            Ok(handle) => handle,
            Err(err) => {
                self.fail(name, ErrorRecord::new(ErrorKind::Submission, err.to_string()))?;
                return Err(err.into());
            }
        };

        let stored = handle.clone();
        let run_owner = (calc.backend == BackendKind::Local).then(|| self.inner.session.owner());
        let submitted = self.transition(name, CalcState::Submitted, move |calc| {
            calc.handle = Some(stored);
            calc.owner = run_owner;
        });
        if let Err(err) = submitted {
            error!(calc = name, "cannot record submission, cancelling job: {err}");
            if let Err(cancel_err) = backend.cancel(&handle).await {
                warn!(calc = name, "cancel after failed bookkeeping: {cancel_err}");
            }
            return Err(err);
        }

        match calc.backend {
            BackendKind::Local => {
                let forwarder = backend
                    .logs(&handle)
                    .map(|logs| tokio::spawn(self.clone().forward_logs(name.to_string(), logs)));
                tokio::spawn(self.clone().supervise_local(name.to_string(), handle.clone(), backend, forwarder));
            }
            BackendKind::Remote => self.inner.poll_wakeup.notify_one(),
        }
        Ok(handle)
    }

    async fn forward_logs(self, name: String, logs: LogBuffer) {
        let mut cursor = logs.cursor();
        while let Some(line) = cursor.next().await {
            self.emit(CalcEvent::Log {
                name: name.clone(),
                line,
            });
        }
    }

    async fn supervise_local(
        self,
        name: String,
        handle: BackendHandle,
        backend: Arc<dyn ExecutionBackend>,
        forwarder: Option<JoinHandle<()>>,
    ) {
        if let Err(err) = self.drive_local(&name, &handle, backend.as_ref(), forwarder).await {
            error!(calc = %name, "local supervisor failed: {err}");
        }
    }

    async fn drive_local(
        &self,
        name: &str,
        handle: &BackendHandle,
        backend: &dyn ExecutionBackend,
        forwarder: Option<JoinHandle<()>>,
    ) -> AppResult<()> {
        self.transition(name, CalcState::Running, |_| {})?;
        let status = backend.wait(handle, self.inner.config.poll_interval).await;

        // Subscribers see every log line before the terminal state change.
        if let Some(forwarder) = forwarder
            && tokio::time::timeout(LOG_DRAIN_TIMEOUT, forwarder).await.is_err()
        {
            warn!(calc = name, "log forwarding did not finish in time");
        }

        let result = match status {
            Ok(JobStatus::Succeeded) => self.complete(name, handle, backend).await,
            Ok(_) => self.record_job_failure(name, handle, backend).await,
            Err(err) => self
                .fail(name, ErrorRecord::new(ErrorKind::Supervisor, err.to_string()))
                .map(|_| ()),
        };
        // The terminal state is recorded; nothing reads the job again.
        backend.release(handle);
        result
    }

    async fn complete(&self, name: &str, handle: &BackendHandle, backend: &dyn ExecutionBackend) -> AppResult<()> {
        match backend.fetch_output(handle).await {
            Ok(summary) => {
                debug!(calc = name, dir = %summary.directory.display(), files = ?summary.files, "output found");
                self.transition(name, CalcState::Finished, move |calc| calc.output = Some(summary))?;
            }
            Err(err) => {
                self.fail(name, ErrorRecord::new(ErrorKind::Output, err.to_string()))?;
            }
        }
        Ok(())
    }

    async fn record_job_failure(&self, name: &str, handle: &BackendHandle, backend: &dyn ExecutionBackend) -> AppResult<()> {
        let record = match backend.failure_detail(handle).await {
            Some(detail) => ErrorRecord::new(ErrorKind::Execution, detail.message).with_exit_code(detail.exit_code),
            None => ErrorRecord::new(ErrorKind::Execution, "job failed"),
        };
        self.fail(name, record).map(|_| ())
    }

    /// Stop a submitted or running calculation.
    ///
    /// The calculation is `Stopped` before the backend is asked to cancel, so
    /// a job that dies from the cancellation is never reported as failed. A
    /// backend error is kept as `cancel_error`.
    pub async fn cancel(&self, name: &str) -> AppResult<Calculation> {
        let _claim = self.claim(name)?;
        let calc = self.inner.registry.get(name)?;
        if !calc.state.is_active() {
            return Err(CoreError::InvalidState {
                name: name.to_string(),
                actual: calc.state,
                expected: "SUBMITTED or RUNNING",
            }
            .into());
        }

        if self.transition(name, CalcState::Stopped, |_| {})?.is_none() {
            // Reached a terminal state on its own in the meantime.
            return Ok(self.inner.registry.get(name)?);
        }

        if let Some(handle) = &calc.handle {
            let result = match self.backend(calc.backend) {
                Ok(backend) => backend.cancel(handle).await.map_err(AppError::from),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                warn!(calc = name, "cancel did not reach the job: {err}");
                let record = ErrorRecord::new(ErrorKind::Cancel, err.to_string());
                self.inner.registry.update(name, move |calc| {
                    calc.cancel_error = Some(record);
                    Ok(())
                })?;
            }
        }

        Ok(self.inner.registry.get(name)?)
    }

    /// Snapshot of one calculation.
    pub fn status(&self, name: &str) -> AppResult<Calculation> {
        Ok(self.inner.registry.get(name)?)
    }

    pub fn list(&self) -> Vec<Calculation> {
        self.inner.registry.list()
    }

    pub fn active_remote(&self) -> Vec<Calculation> {
        self.inner
            .registry
            .filter(|calc| calc.backend == BackendKind::Remote && calc.state.is_active())
    }

    /// Remove a calculation that is not active; `purge` also deletes its working directory.
    pub async fn delete(&self, name: &str, purge: bool) -> AppResult<Calculation> {
        if self.is_claimed(name) {
            let state = self.inner.registry.get(name)?.state;
            return Err(CoreError::InvalidState {
                name: name.to_string(),
                actual: state,
                expected: "no other operation in progress",
            }
            .into());
        }
        let calc = self.inner.registry.remove_if(name, |calc| {
            if calc.state.is_active() {
                Err(CoreError::InvalidState {
                    name: calc.name.to_string(),
                    actual: calc.state,
                    expected: "not SUBMITTED or RUNNING",
                })
            } else {
                Ok(())
            }
        })?;

        if let Some(handle) = &calc.handle
            && let Ok(backend) = self.backend(calc.backend)
        {
            backend.release(handle);
        }
        self.inner
            .poll_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);

        if purge {
            remove_dir_if_present(&calc.working_directory).await?;
        }
        info!(calc = name, purge, "calculation deleted");
        self.emit(CalcEvent::Deleted {
            name: name.to_string(),
        });
        Ok(calc)
    }

    /// Run analysis tools on a `Finished` calculation and append the outcomes.
    ///
    /// An empty request list runs the workflow's default analysis set.
    pub async fn run_analysis(&self, name: &str, requests: Vec<AnalysisRequest>) -> AppResult<Vec<AnalysisOutcome>> {
        let _claim = self.claim(name)?;
        let calc = self.inner.registry.get(name)?;
        let requests = if requests.is_empty() {
            self.inner.catalog.default_analysis(calc.workflow_type)?.to_vec()
        } else {
            requests
        };

        let outcomes = self.inner.pipeline.run(&calc, &requests).await?;
        let recorded = outcomes.clone();
        self.inner.registry.update(name, move |calc| {
            record_outcomes(calc, &requests, recorded);
            Ok(())
        })?;

        let succeeded = outcomes.iter().filter(|o| o.success).count();
        self.emit(CalcEvent::AnalysisCompleted {
            name: name.to_string(),
            succeeded,
            failed: outcomes.len() - succeeded,
        });
        Ok(outcomes)
    }

    /// Receive state changes, log lines and analysis completions.
    pub fn subscribe(&self) -> broadcast::Receiver<CalcEvent> {
        self.inner.events.subscribe()
    }

    /// Live log of a local calculation this manager is still supervising.
    pub fn logs(&self, name: &str) -> AppResult<Option<LogBuffer>> {
        let calc = self.inner.registry.get(name)?;
        let Some(handle) = calc.handle else {
            return Ok(None);
        };
        Ok(self.backend(calc.backend).ok().and_then(|b| b.logs(&handle)))
    }

    /// Resolve once the calculation is terminal.
    pub async fn wait_for_terminal(&self, name: &str) -> AppResult<Calculation> {
        let mut events = self.subscribe();
        loop {
            let calc = self.status(name)?;
            if calc.state.is_terminal() {
                return Ok(calc);
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return self.status(name),
            }
        }
    }

    pub(crate) fn poll_wakeup(&self) -> &Notify {
        &self.inner.poll_wakeup
    }

    /// One monitoring cycle over every active remote calculation.
    ///
    /// Errors are recorded on the calculations, never returned.
    pub async fn poll_remote_once(&self) -> PollReport {
        let active = self.active_remote();
        let mut report = PollReport::default();
        if active.is_empty() {
            return report;
        }
        let backend = match self.backend(BackendKind::Remote) {
            Ok(backend) => backend,
            Err(err) => {
                warn!(count = active.len(), "cannot poll remote calculations: {err}");
                return report;
            }
        };

        let results = join_all(active.iter().map(|calc| self.poll_one(backend.as_ref(), calc))).await;
        report.polled = results.len();
        for result in results {
            match result {
                PollResult::Unchanged => {}
                PollResult::Advanced => report.transitions += 1,
                PollResult::TimedOut => report.timeouts += 1,
                PollResult::Errored => report.errors += 1,
            }
        }
        debug!(?report, "poll cycle complete");
        report
    }

    async fn poll_one(&self, backend: &dyn ExecutionBackend, calc: &Calculation) -> PollResult {
        match self.try_poll_one(backend, calc).await {
            Ok(result) => result,
            Err(err) => {
                error!(calc = %calc.name, "poll bookkeeping failed: {err}");
                PollResult::Errored
            }
        }
    }

    async fn try_poll_one(&self, backend: &dyn ExecutionBackend, calc: &Calculation) -> AppResult<PollResult> {
        let name = calc.name.as_str();
        let Some(handle) = &calc.handle else {
            self.fail(name, ErrorRecord::new(ErrorKind::Supervisor, "active calculation has no job handle"))?;
            return Ok(PollResult::Advanced);
        };

        let timeout = self.inner.config.poll_timeout;
        let status = match tokio::time::timeout(timeout, backend.poll(handle)).await {
            Ok(Ok(status)) => status,
            Ok(Err(ExecError::PollTimeout(_))) | Err(_) => {
                warn!(calc = name, ?timeout, "poll timed out; treating as pending");
                return Ok(PollResult::TimedOut);
            }
            Ok(Err(err)) => return self.poll_error(name, err),
        };
        self.reset_failures(name);

        let mut advanced = false;
        match status {
            JobStatus::Pending => {}
            JobStatus::Running => {
                advanced |= self.step_to_running(calc)?;
            }
            JobStatus::Succeeded => {
                advanced |= self.step_to_running(calc)?;
                match tokio::time::timeout(timeout, backend.fetch_output(handle)).await {
                    Ok(Ok(summary)) => {
                        self.transition(name, CalcState::Finished, move |c| c.output = Some(summary))?;
                        advanced = true;
                    }
                    Ok(Err(err)) if !err.is_transient() => {
                        self.fail(name, ErrorRecord::new(ErrorKind::Output, err.to_string()))?;
                        advanced = true;
                    }
                    Ok(Err(err)) => return self.poll_error(name, err),
                    Err(_) => return Ok(PollResult::TimedOut),
                }
            }
            JobStatus::Failed => {
                self.record_job_failure(name, handle, backend).await?;
                advanced = true;
            }
        }
        Ok(if advanced { PollResult::Advanced } else { PollResult::Unchanged })
    }

    /// Submitted -> Running; never skips the intermediate state.
    fn step_to_running(&self, calc: &Calculation) -> AppResult<bool> {
        if calc.state == CalcState::Submitted {
            return Ok(self.transition(calc.name.as_str(), CalcState::Running, |_| {})?.is_some());
        }
        Ok(false)
    }

    fn reset_failures(&self, name: &str) {
        self.inner
            .poll_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    fn poll_error(&self, name: &str, err: ExecError) -> AppResult<PollResult> {
        let failures = {
            let mut map = self.inner.poll_failures.lock().unwrap_or_else(PoisonError::into_inner);
            let count = map.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if failures >= self.inner.config.max_poll_failures || !err.is_transient() {
            self.reset_failures(name);
            self.fail(
                name,
                ErrorRecord::new(
                    ErrorKind::Supervisor,
                    format!("monitoring gave up after {failures} failed polls: {err}"),
                ),
            )?;
            return Ok(PollResult::Advanced);
        }

        warn!(calc = name, failures, "poll failed, retrying next cycle: {err}");
        Ok(PollResult::Errored)
    }

    /// Fail local calculations whose supervising manager is gone; a live
    /// owner, in this process or another, keeps its run. Remote jobs resume
    /// under the monitor.
    fn recover(&self) -> AppResult<()> {
        let orphaned = self.inner.registry.filter(|calc| {
            calc.backend == BackendKind::Local
                && calc.state.is_active()
                && !calc.owner.as_ref().is_some_and(owner::is_alive)
        });
        for calc in orphaned {
            self.fail(
                calc.name.as_str(),
                ErrorRecord::new(
                    ErrorKind::Supervisor,
                    "supervising process ended before the local job finished",
                ),
            )?;
        }

        let resumed = self.active_remote().len();
        if resumed > 0 {
            info!(count = resumed, "resuming monitoring of remote calculations");
        }
        Ok(())
    }
}

async fn remove_dir_if_present(dir: &Path) -> AppResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
