//! qf-core: stable foundation for quanticsflow.
//!
//! Contains:
//! - ids (validated calculation names)
//! - workflow (workflow types, artifact kinds, tool names, backend kinds)
//! - state (calculation state machine)
//! - calculation (the Calculation entity and its records)
//! - catalog (workflow type -> required artifacts / allowed tools)
//! - error (shared error types)

pub mod calculation;
pub mod catalog;
pub mod error;
pub mod ids;
pub mod state;
pub mod workflow;

// Re-exports: nice ergonomics for downstream crates
pub use calculation::{
    AnalysisOutcome, AnalysisRequest, Artifacts, BackendHandle, Calculation, ErrorKind,
    ErrorRecord, OutputSummary, RunOwner, StateChange,
};
pub use catalog::{Catalog, ParamPassing, ToolSpec, WorkflowEntry};
pub use error::{CoreError, CoreResult};
pub use ids::CalcName;
pub use state::CalcState;
pub use workflow::{ArtifactKind, BackendKind, ToolName, WorkflowType};
