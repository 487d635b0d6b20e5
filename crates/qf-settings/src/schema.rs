//! Settings file schema.

use std::path::PathBuf;

use qf_core::{BackendKind, WorkflowType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub calculation: CalculationDefaults,
    #[serde(default)]
    pub solver: SolverSettings,
    #[serde(default)]
    pub analysis: AnalysisSettings,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: crate::migrate::LATEST_VERSION,
            calculation: CalculationDefaults::default(),
            solver: SolverSettings::default(),
            analysis: AnalysisSettings::default(),
            remote: RemoteSettings::default(),
            orchestrator: OrchestratorSettings::default(),
        }
    }
}

/// Last-used values for a new calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalculationDefaults {
    pub name: String,
    pub workflow_type: WorkflowType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inp_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_folder: Option<PathBuf>,
    pub execution_mode: BackendKind,
}

impl Default for CalculationDefaults {
    fn default() -> Self {
        Self {
            name: "my_quantics_run".to_string(),
            workflow_type: WorkflowType::Mctdh,
            inp_file: None,
            op_file: None,
            db_folder: None,
            execution_mode: BackendKind::Local,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub executable: String,
    /// Extra arguments placed before the input file name.
    pub extra_args: Vec<String>,
    /// Directory holding the analysis tool executables; `PATH` lookup when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_dir: Option<PathBuf>,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            executable: "quantics".to_string(),
            extra_args: Vec::new(),
            tool_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// Selected analysis commands, e.g. `"rdcheck etot"`.
    pub tools: Vec<String>,
    pub rdgpop_nz: String,
    pub rdgpop_dof: String,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            rdgpop_nz: "2".to_string(),
            rdgpop_dof: "1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// Code registered with the workflow service, `label@computer`.
    pub code_label: String,
    /// Scheduler type of the target computer (`sge`, `slurm`, `direct`, ...).
    pub scheduler: String,
    pub num_machines: u32,
    pub mpiprocs: u32,
    pub walltime_s: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Bridge executable speaking to the workflow service; remote mode is
    /// unavailable when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge: Option<PathBuf>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            code_label: "quantics@localhost".to_string(),
            scheduler: "direct".to_string(),
            num_machines: 1,
            mpiprocs: 1,
            walltime_s: 3600,
            queue: None,
            bridge: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_directory: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub poll_timeout_ms: u64,
    /// Consecutive failed polls before a remote calculation is marked failed.
    pub max_poll_failures: u32,
    /// Lines retained per local job log buffer.
    pub log_capacity: usize,
    pub event_capacity: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            base_directory: None,
            poll_interval_ms: 5_000,
            poll_timeout_ms: 2_000,
            max_poll_failures: 5,
            log_capacity: 10_000,
            event_capacity: 256,
        }
    }
}
