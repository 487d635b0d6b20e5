//! qf-store: calculation registry and record persistence.

pub mod hash;
pub mod registry;
pub mod store;

pub use hash::compute_input_digest;
pub use registry::Registry;
pub use store::CalculationStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record not found: {name}")]
    RecordNotFound { name: String },

    #[error(transparent)]
    Core(#[from] qf_core::CoreError),
}
