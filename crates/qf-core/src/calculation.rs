//! The Calculation entity and the records it carries.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::ids::CalcName;
use crate::state::CalcState;
use crate::workflow::{ArtifactKind, BackendKind, ToolName, WorkflowType};

/// Input artifact paths supplied at creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inp_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_folder: Option<PathBuf>,
}

impl Artifacts {
    pub fn new(inp_file: impl Into<PathBuf>, op_file: impl Into<PathBuf>) -> Self {
        Self {
            inp_file: Some(inp_file.into()),
            op_file: Some(op_file.into()),
            db_folder: None,
        }
    }

    pub fn with_database(mut self, db_folder: impl Into<PathBuf>) -> Self {
        self.db_folder = Some(db_folder.into());
        self
    }

    pub fn get(&self, kind: ArtifactKind) -> Option<&Path> {
        match kind {
            ArtifactKind::InputFile => self.inp_file.as_deref(),
            ArtifactKind::OperatorFile => self.op_file.as_deref(),
            ArtifactKind::Database => self.db_folder.as_deref(),
        }
    }

    pub fn take(&mut self, kind: ArtifactKind) -> Option<PathBuf> {
        match kind {
            ArtifactKind::InputFile => self.inp_file.take(),
            ArtifactKind::OperatorFile => self.op_file.take(),
            ArtifactKind::Database => self.db_folder.take(),
        }
    }

    /// Present artifacts in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = (ArtifactKind, &Path)> {
        [
            ArtifactKind::InputFile,
            ArtifactKind::OperatorFile,
            ArtifactKind::Database,
        ]
        .into_iter()
        .filter_map(move |kind| self.get(kind).map(|path| (kind, path)))
    }
}

/// Opaque token identifying a submitted job to the backend that created it.
///
/// The token is a per-job id for local jobs and a remote job id otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendHandle {
    pub kind: BackendKind,
    pub token: String,
    /// Process (and process group) id of a local solver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl BackendHandle {
    pub fn new(kind: BackendKind, token: impl Into<String>) -> Self {
        Self {
            kind,
            token: token.into(),
            pid: None,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

/// The process supervising a submitted calculation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOwner {
    pub pid: u32,
    /// Distinguishes managers living in the same process.
    pub session: String,
    pub since: DateTime<Utc>,
}

/// One requested invocation of an analysis tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub tool: ToolName,
    #[serde(default)]
    pub params: Vec<String>,
}

impl AnalysisRequest {
    pub fn new(tool: impl Into<ToolName>, params: &[&str]) -> Self {
        Self {
            tool: tool.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Parse a whitespace-separated command string such as `"rdcheck natpop 0 0"`.
    pub fn parse(command: &str) -> CoreResult<Self> {
        let mut parts = command.split_whitespace();
        let tool = parts.next().ok_or(CoreError::EmptyRequest)?;
        Ok(Self {
            tool: ToolName::new(tool),
            params: parts.map(str::to_string).collect(),
        })
    }

    /// File-system friendly label, e.g. `rdcheck_natpop_0_0`.
    pub fn label(&self) -> String {
        let mut label = self.tool.as_str().to_string();
        for param in &self.params {
            label.push('_');
            label.extend(
                param
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '-' }),
            );
        }
        label
    }

    pub fn command_line(&self) -> String {
        let mut line = self.tool.as_str().to_string();
        for param in &self.params {
            line.push(' ');
            line.push_str(param);
        }
        line
    }
}

/// Result of a single analysis tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub tool: ToolName,
    pub params: Vec<String>,
    pub success: bool,
    /// Captured standard output (the outcome payload).
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Files written for this outcome.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Spawn or connection failure while submitting.
    Submission,
    /// Nonzero exit code or remote-reported failure.
    Execution,
    /// Output could not be retrieved after a successful run.
    Output,
    /// The supervising task or monitoring loop lost track of the job.
    Supervisor,
    /// Best-effort cancellation did not reach the job.
    Cancel,
}

/// Diagnostic record attached to a failed calculation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
            at: Utc::now(),
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }
}

/// Output location and the headline values extracted from the solver log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSummary {
    pub directory: PathBuf,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_energy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converged: Option<bool>,
}

/// One applied state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: CalcState,
    pub to: CalcState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calculation {
    pub name: CalcName,
    pub workflow_type: WorkflowType,
    pub artifacts: Artifacts,
    pub working_directory: PathBuf,
    pub backend: BackendKind,
    pub created_at: DateTime<Utc>,
    pub state: CalcState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<BackendHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<RunOwner>,
    /// SHA-256 over the input artifacts at creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_digest: Option<String>,
    #[serde(default)]
    pub analysis_requests: Vec<AnalysisRequest>,
    #[serde(default)]
    pub analysis_results: Vec<AnalysisOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSummary>,
    /// Present only in `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// Non-fatal cancellation diagnostic; the calculation is still `Stopped`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_error: Option<ErrorRecord>,
    #[serde(default)]
    pub history: Vec<StateChange>,
}

impl Calculation {
    pub fn new(
        name: CalcName,
        workflow_type: WorkflowType,
        artifacts: Artifacts,
        working_directory: PathBuf,
        backend: BackendKind,
    ) -> Self {
        Self {
            name,
            workflow_type,
            artifacts,
            working_directory,
            backend,
            created_at: Utc::now(),
            state: CalcState::Created,
            started_at: None,
            finished_at: None,
            handle: None,
            owner: None,
            input_digest: None,
            analysis_requests: Vec::new(),
            analysis_results: Vec::new(),
            output: None,
            error: None,
            cancel_error: None,
            history: Vec::new(),
        }
    }

    /// Apply one state transition, refusing anything the state machine forbids.
    pub fn apply_transition(&mut self, to: CalcState) -> CoreResult<StateChange> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(CoreError::InvalidTransition { from, to });
        }

        let change = StateChange {
            from,
            to,
            at: Utc::now(),
        };
        self.state = to;
        if to == CalcState::Submitted {
            self.started_at = Some(change.at);
        }
        if to.is_terminal() {
            self.finished_at = Some(change.at);
        }
        self.history.push(change);
        Ok(change)
    }

    /// Transition to `Failed` and attach the error record.
    pub fn fail(&mut self, record: ErrorRecord) -> CoreResult<StateChange> {
        let change = self.apply_transition(CalcState::Failed)?;
        self.error = Some(record);
        Ok(change)
    }

    pub fn require_state(&self, expected: CalcState) -> CoreResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CoreError::InvalidState {
                name: self.name.to_string(),
                actual: self.state,
                expected: expected.as_str(),
            })
        }
    }

    /// States visited so far, starting with `Created`.
    pub fn visited_states(&self) -> Vec<CalcState> {
        let mut states = vec![CalcState::Created];
        states.extend(self.history.iter().map(|change| change.to));
        states
    }
}
