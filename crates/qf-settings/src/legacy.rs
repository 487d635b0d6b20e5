//! Import of the flat JSON configuration written by the desktop GUI.

use std::path::PathBuf;

use qf_core::{BackendKind, WorkflowType};
use serde::Deserialize;

use crate::SettingsError;
use crate::schema::Settings;

/// Flat key layout of a `quantics_config_*.json` file. Unknown keys are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyConfig {
    pub calculation_name: String,
    #[serde(default)]
    pub workflow_type: Option<String>,
    #[serde(default)]
    pub quantics_executable: Option<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub inp_file: Option<PathBuf>,
    #[serde(default)]
    pub op_file: Option<PathBuf>,
    #[serde(default)]
    pub db_folder: Option<PathBuf>,
    #[serde(default)]
    pub analysis_tools: Vec<String>,
    #[serde(default)]
    pub rdgpop_nz: Option<String>,
    #[serde(default)]
    pub rdgpop_dof: Option<String>,
    #[serde(default)]
    pub execution_mode: Option<String>,
    #[serde(default)]
    pub aiida_resources: Option<u32>,
    #[serde(default)]
    pub aiida_walltime: Option<u64>,
    #[serde(default)]
    pub aiida_queue: Option<String>,
}

impl LegacyConfig {
    /// Detects the flat layout by its top-level `calculation_name` key.
    pub fn looks_like(value: &serde_json::Value) -> bool {
        value.get("calculation_name").is_some() && value.get("version").is_none()
    }

    /// Converts into a version-0 `Settings`, to be run through migration.
    pub fn into_settings(self) -> Result<Settings, SettingsError> {
        let mut settings = Settings {
            version: 0,
            ..Settings::default()
        };

        let calc = &mut settings.calculation;
        calc.name = self.calculation_name;
        if let Some(workflow) = self.workflow_type {
            calc.workflow_type = workflow.parse::<WorkflowType>()?;
        }
        if let Some(mode) = self.execution_mode {
            calc.execution_mode = mode.parse::<BackendKind>()?;
        }
        calc.inp_file = self.inp_file;
        calc.op_file = self.op_file;
        calc.db_folder = self.db_folder;

        if let Some(exe) = self.quantics_executable
            && !exe.trim().is_empty()
        {
            settings.solver.executable = exe;
        }

        settings.analysis.tools = self.analysis_tools;
        if let Some(nz) = self.rdgpop_nz {
            settings.analysis.rdgpop_nz = nz;
        }
        if let Some(dof) = self.rdgpop_dof {
            settings.analysis.rdgpop_dof = dof;
        }

        if let Some(procs) = self.aiida_resources {
            settings.remote.mpiprocs = procs;
        }
        if let Some(walltime) = self.aiida_walltime {
            settings.remote.walltime_s = walltime;
        }
        settings.remote.queue = self.aiida_queue.filter(|q| !q.is_empty());

        settings.orchestrator.base_directory = self.working_directory;
        Ok(settings)
    }
}
