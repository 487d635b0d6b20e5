//! Calculation orchestration service layer for quanticsflow.
//!
//! The lifecycle manager owns calculation state: it validates and registers
//! calculations, submits them to an execution backend, supervises or polls
//! them to a terminal state and runs the analysis pipeline afterwards. The
//! CLI and any embedding frontend go through this crate only.

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod monitor;
mod owner;
pub mod query;

// Re-export key types for convenience
pub use config::ManagerConfig;
pub use error::{AppError, AppResult};
pub use events::CalcEvent;
pub use manager::{LifecycleManager, ManagerBuilder, PollReport};
pub use monitor::Monitor;
pub use query::{CalcSummary, summarize};
