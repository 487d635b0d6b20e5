use qf_core::{BackendKind, StateChange, WorkflowType};
use qf_exec::LogLine;

/// Notification published to `LifecycleManager::subscribe` receivers.
#[derive(Debug, Clone)]
pub enum CalcEvent {
    Created {
        name: String,
        workflow: WorkflowType,
        backend: BackendKind,
    },
    StateChanged {
        name: String,
        change: StateChange,
    },
    /// One captured line of a local job's output.
    Log {
        name: String,
        line: LogLine,
    },
    AnalysisCompleted {
        name: String,
        succeeded: usize,
        failed: usize,
    },
    Deleted {
        name: String,
    },
}

impl CalcEvent {
    pub fn name(&self) -> &str {
        match self {
            CalcEvent::Created { name, .. }
            | CalcEvent::StateChanged { name, .. }
            | CalcEvent::Log { name, .. }
            | CalcEvent::AnalysisCompleted { name, .. }
            | CalcEvent::Deleted { name } => name,
        }
    }
}
