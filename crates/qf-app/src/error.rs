//! Error types for the qf-app service layer.

use qf_core::{BackendKind, CoreError};

/// Application error wrapping the backend crates' errors for the CLI.
///
/// Domain and execution errors stay typed so callers can tell a rejected
/// request from a failed job; storage and settings errors are flattened.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Exec(#[from] qf_exec::ExecError),

    #[error("Storage error: {0}")]
    Store(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("No {0} backend is configured")]
    BackendUnavailable(BackendKind),

    #[error("Monitor is not running")]
    MonitorStopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for qf-app operations.
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Rejected request (bad input or wrong state); nothing was changed.
    pub fn is_rejection(&self) -> bool {
        matches!(self, AppError::Core(_) | AppError::BackendUnavailable(_))
    }
}

impl From<qf_store::StoreError> for AppError {
    fn from(err: qf_store::StoreError) -> Self {
        match err {
            qf_store::StoreError::Core(core) => AppError::Core(core),
            other => AppError::Store(other.to_string()),
        }
    }
}

impl From<qf_analysis::AnalysisError> for AppError {
    fn from(err: qf_analysis::AnalysisError) -> Self {
        match err {
            qf_analysis::AnalysisError::Core(core) => AppError::Core(core),
            other => AppError::Analysis(other.to_string()),
        }
    }
}

impl From<qf_settings::SettingsError> for AppError {
    fn from(err: qf_settings::SettingsError) -> Self {
        AppError::Settings(err.to_string())
    }
}
