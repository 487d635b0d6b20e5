//! Configuration catalog: workflow type -> required artifacts and allowed tools.
//!
//! The catalog is immutable once built and shared as `Arc<Catalog>`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::calculation::{AnalysisRequest, Artifacts};
use crate::error::{CoreError, CoreResult};
use crate::workflow::{ArtifactKind, ToolName, WorkflowType};

/// How a tool receives its request parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamPassing {
    /// Appended to the command line.
    Arguments,
    /// Written to the tool's stdin, one per line.
    StdinLines,
}

/// How to invoke one analysis tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub executable: String,
    #[serde(default)]
    pub fixed_args: Vec<String>,
    pub params: ParamPassing,
    /// Used when a request carries no parameters.
    #[serde(default)]
    pub default_params: Vec<String>,
}

impl ToolSpec {
    fn arguments(executable: &str) -> Self {
        Self {
            executable: executable.to_string(),
            fixed_args: Vec::new(),
            params: ParamPassing::Arguments,
            default_params: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEntry {
    pub required_artifacts: BTreeSet<ArtifactKind>,
    pub allowed_tools: BTreeSet<ToolName>,
    #[serde(default)]
    pub default_analysis: Vec<AnalysisRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub workflows: BTreeMap<WorkflowType, WorkflowEntry>,
    pub tools: BTreeMap<ToolName, ToolSpec>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl Catalog {
    /// The Quantics workflows with their stock analysis tools.
    pub fn standard() -> Self {
        Self::with_rdgpop_defaults("2", "1")
    }

    /// Standard catalog with custom `rdgpop` defaults (grid points, DOF).
    pub fn with_rdgpop_defaults(nz: &str, dof: &str) -> Self {
        let rdcheck = ToolName::new(ToolName::RDCHECK);
        let rdgpop = ToolName::new(ToolName::RDGPOP);
        let ddtraj = ToolName::new(ToolName::DDTRAJ);

        let mut tools = BTreeMap::new();
        tools.insert(rdcheck.clone(), ToolSpec::arguments(ToolName::RDCHECK));
        tools.insert(
            rdgpop.clone(),
            ToolSpec {
                executable: ToolName::RDGPOP.to_string(),
                fixed_args: vec!["-w".to_string()],
                params: ParamPassing::StdinLines,
                default_params: vec![nz.to_string(), dof.to_string()],
            },
        );
        tools.insert(ddtraj.clone(), ToolSpec::arguments(ToolName::DDTRAJ));

        let files = BTreeSet::from([ArtifactKind::InputFile, ArtifactKind::OperatorFile]);
        let mut with_db = files.clone();
        with_db.insert(ArtifactKind::Database);

        let etot = AnalysisRequest::new(ToolName::RDCHECK, &["etot"]);
        let spop = AnalysisRequest::new(ToolName::RDCHECK, &["spop"]);

        let mut workflows = BTreeMap::new();
        workflows.insert(
            WorkflowType::Mctdh,
            WorkflowEntry {
                required_artifacts: files.clone(),
                allowed_tools: BTreeSet::from([rdcheck.clone(), rdgpop]),
                default_analysis: vec![
                    etot.clone(),
                    spop.clone(),
                    AnalysisRequest::new(ToolName::RDCHECK, &["natpop", "0", "0"]),
                    AnalysisRequest::new(ToolName::RDGPOP, &[]),
                ],
            },
        );
        workflows.insert(
            WorkflowType::Vmcg,
            WorkflowEntry {
                required_artifacts: files,
                allowed_tools: BTreeSet::from([rdcheck.clone()]),
                default_analysis: vec![etot.clone(), spop.clone()],
            },
        );
        workflows.insert(
            WorkflowType::DdVmcg,
            WorkflowEntry {
                required_artifacts: with_db,
                allowed_tools: BTreeSet::from([rdcheck, ddtraj]),
                default_analysis: vec![etot, spop, AnalysisRequest::new(ToolName::DDTRAJ, &[])],
            },
        );

        Self { workflows, tools }
    }

    fn entry(&self, workflow: WorkflowType) -> CoreResult<&WorkflowEntry> {
        self.workflows
            .get(&workflow)
            .ok_or_else(|| CoreError::UnknownWorkflowType(workflow.to_string()))
    }

    pub fn required_artifacts(&self, workflow: WorkflowType) -> CoreResult<&BTreeSet<ArtifactKind>> {
        Ok(&self.entry(workflow)?.required_artifacts)
    }

    pub fn allowed_tools(&self, workflow: WorkflowType) -> CoreResult<&BTreeSet<ToolName>> {
        Ok(&self.entry(workflow)?.allowed_tools)
    }

    pub fn default_analysis(&self, workflow: WorkflowType) -> CoreResult<&[AnalysisRequest]> {
        Ok(&self.entry(workflow)?.default_analysis)
    }

    pub fn tool_spec(&self, tool: &ToolName) -> CoreResult<&ToolSpec> {
        self.tools
            .get(tool)
            .ok_or_else(|| CoreError::UnknownTool(tool.clone()))
    }

    /// Check that every required artifact is supplied and present on disk.
    pub fn validate_artifacts(&self, workflow: WorkflowType, artifacts: &Artifacts) -> CoreResult<()> {
        for &kind in self.required_artifacts(workflow)? {
            let Some(path) = artifacts.get(kind) else {
                return Err(CoreError::MissingArtifact { kind, workflow });
            };
            let present = if kind.is_directory() {
                path.is_dir()
            } else {
                path.is_file()
            };
            if !present {
                return Err(CoreError::ArtifactNotFound {
                    kind,
                    path: path.to_path_buf(),
                });
            }
        }
        Ok(())
    }

    /// Every request must name a tool allowed for the workflow and known to the catalog.
    pub fn validate_requests(&self, workflow: WorkflowType, requests: &[AnalysisRequest]) -> CoreResult<()> {
        let allowed = self.allowed_tools(workflow)?;
        for request in requests {
            if !allowed.contains(&request.tool) {
                return Err(CoreError::UnsupportedTool {
                    tool: request.tool.clone(),
                    workflow,
                });
            }
            self.tool_spec(&request.tool)?;
        }
        Ok(())
    }
}
