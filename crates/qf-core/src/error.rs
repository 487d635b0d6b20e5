use std::path::PathBuf;

use thiserror::Error;

use crate::state::CalcState;
use crate::workflow::{ArtifactKind, ToolName, WorkflowType};

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("Unknown backend kind: {0}")]
    UnknownBackend(String),

    #[error("Unknown calculation state: {0}")]
    UnknownState(String),

    #[error("Invalid calculation name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Calculation '{0}' already exists")]
    DuplicateName(String),

    #[error("Calculation '{0}' not found")]
    NotFound(String),

    #[error("Missing {kind} required by {workflow}")]
    MissingArtifact {
        kind: ArtifactKind,
        workflow: WorkflowType,
    },

    #[error("{kind} not found on disk: {path}")]
    ArtifactNotFound { kind: ArtifactKind, path: PathBuf },

    #[error("Calculation '{name}' is {actual}, expected {expected}")]
    InvalidState {
        name: String,
        actual: CalcState,
        expected: &'static str,
    },

    #[error("Illegal transition {from} -> {to}")]
    InvalidTransition { from: CalcState, to: CalcState },

    #[error("Analysis tool '{tool}' is not allowed for {workflow}")]
    UnsupportedTool {
        tool: ToolName,
        workflow: WorkflowType,
    },

    #[error("Analysis tool '{0}' is not in the catalog")]
    UnknownTool(ToolName),

    #[error("Empty analysis request")]
    EmptyRequest,
}
