//! qf-analysis: post-processing tool runs against a finished calculation.

pub mod command;
pub mod pipeline;

pub use command::ToolCommand;
pub use pipeline::{AnalysisPipeline, record_outcomes};

pub type AnalysisResult<T> = Result<T, AnalysisError>;

#[derive(thiserror::Error, Debug)]
pub enum AnalysisError {
    /// Precondition failures: wrong state, unsupported or unknown tool.
    #[error(transparent)]
    Core(#[from] qf_core::CoreError),

    #[error("Calculation '{name}' has no output directory")]
    OutputUnavailable { name: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
