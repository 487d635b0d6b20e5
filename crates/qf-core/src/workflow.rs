//! Workflow, artifact, tool and backend vocabularies.

use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Simulation method; decides mandatory inputs and legal analysis tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkflowType {
    #[serde(rename = "MCTDH")]
    Mctdh,
    #[serde(rename = "vMCG")]
    Vmcg,
    #[serde(rename = "DD-vMCG")]
    DdVmcg,
}

impl WorkflowType {
    pub const ALL: [WorkflowType; 3] = [WorkflowType::Mctdh, WorkflowType::Vmcg, WorkflowType::DdVmcg];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowType::Mctdh => "MCTDH",
            WorkflowType::Vmcg => "vMCG",
            WorkflowType::DdVmcg => "DD-vMCG",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_'))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "mctdh" => Ok(WorkflowType::Mctdh),
            "vmcg" => Ok(WorkflowType::Vmcg),
            "ddvmcg" => Ok(WorkflowType::DdVmcg),
            _ => Err(CoreError::UnknownWorkflowType(s.to_string())),
        }
    }
}

/// Kind of input artifact a workflow may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// `.inp` input file
    InputFile,
    /// `.op` operator file
    OperatorFile,
    /// Trajectory database directory (DD-vMCG)
    Database,
}

impl ArtifactKind {
    pub fn is_directory(self) -> bool {
        matches!(self, ArtifactKind::Database)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ArtifactKind::InputFile => "input file (.inp)",
            ArtifactKind::OperatorFile => "operator file (.op)",
            ArtifactKind::Database => "database directory",
        };
        f.write_str(label)
    }
}

/// Name of a post-processing analysis tool (`rdcheck`, `rdgpop`, ...).
///
/// Tool names are open-ended so custom catalogs can add tools; whether a
/// tool is usable is decided by the catalog, not by this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolName(String);

impl ToolName {
    pub const RDCHECK: &'static str = "rdcheck";
    pub const RDGPOP: &'static str = "rdgpop";
    pub const DDTRAJ: &'static str = "ddtraj";

    pub fn new(name: &str) -> Self {
        Self(name.trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ToolName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Execution strategy tag stored on each calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    // Older settings files name the remote mode after the workflow service.
    #[serde(alias = "aiida")]
    Remote,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Remote => "remote",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "remote" | "aiida" => Ok(BackendKind::Remote),
            _ => Err(CoreError::UnknownBackend(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_parsing_is_lenient() {
        assert_eq!("MCTDH".parse::<WorkflowType>().unwrap(), WorkflowType::Mctdh);
        assert_eq!("vmcg".parse::<WorkflowType>().unwrap(), WorkflowType::Vmcg);
        assert_eq!("DD-vMCG".parse::<WorkflowType>().unwrap(), WorkflowType::DdVmcg);
        assert_eq!("dd_vmcg".parse::<WorkflowType>().unwrap(), WorkflowType::DdVmcg);
    }

    #[test]
    fn unknown_workflow_is_rejected() {
        let err = "G-MCTDH2".parse::<WorkflowType>().unwrap_err();
        assert_eq!(err, CoreError::UnknownWorkflowType("G-MCTDH2".to_string()));
    }

    #[test]
    fn workflow_serializes_with_display_names() {
        let json = serde_json::to_string(&WorkflowType::DdVmcg).unwrap();
        assert_eq!(json, "\"DD-vMCG\"");
    }

    #[test]
    fn legacy_backend_alias() {
        let kind: BackendKind = serde_json::from_str("\"aiida\"").unwrap();
        assert_eq!(kind, BackendKind::Remote);
        assert!("cloud".parse::<BackendKind>().is_err());
    }

    #[test]
    fn tool_names_are_normalized() {
        assert_eq!(ToolName::new(" RDCheck ").as_str(), "rdcheck");
    }
}
