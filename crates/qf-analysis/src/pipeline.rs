//! Sequential analysis runs with per-tool failure isolation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use qf_core::{AnalysisOutcome, AnalysisRequest, CalcState, Calculation, Catalog};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::command::ToolCommand;
use crate::{AnalysisError, AnalysisResult};

pub struct AnalysisPipeline {
    catalog: Arc<Catalog>,
    tool_dir: Option<PathBuf>,
}

impl AnalysisPipeline {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            tool_dir: None,
        }
    }

    pub fn with_tool_dir(mut self, tool_dir: Option<PathBuf>) -> Self {
        self.tool_dir = tool_dir;
        self
    }

    /// All preconditions, checked before any tool runs.
    pub fn validate(&self, calc: &Calculation, requests: &[AnalysisRequest]) -> AnalysisResult<()> {
        calc.require_state(CalcState::Finished)?;
        self.catalog.validate_requests(calc.workflow_type, requests)?;
        Ok(())
    }

    pub fn output_directory(calc: &Calculation) -> AnalysisResult<&Path> {
        calc.output
            .as_ref()
            .map(|output| output.directory.as_path())
            .ok_or_else(|| AnalysisError::OutputUnavailable {
                name: calc.name.to_string(),
            })
    }

    /// Run `requests` in order in the calculation's output directory.
    ///
    /// A failing tool yields an unsuccessful outcome and the remaining tools
    /// still run.
    pub async fn run(
        &self,
        calc: &Calculation,
        requests: &[AnalysisRequest],
    ) -> AnalysisResult<Vec<AnalysisOutcome>> {
        self.validate(calc, requests)?;
        let output_dir = Self::output_directory(calc)?;
        if !output_dir.is_dir() {
            return Err(AnalysisError::OutputUnavailable {
                name: calc.name.to_string(),
            });
        }

        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let spec = self.catalog.tool_spec(&request.tool)?;
            let command = ToolCommand::build(spec, request, self.tool_dir.as_deref());
            info!(calc = %calc.name, tool = %command.display(), "running analysis tool");

            let outcome = run_tool(&command, request, output_dir).await;
            if !outcome.success {
                warn!(
                    calc = %calc.name,
                    tool = %request.tool,
                    error = outcome.error.as_deref().unwrap_or_default(),
                    "analysis tool failed"
                );
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

/// Append a completed batch to the calculation.
pub fn record_outcomes(
    calc: &mut Calculation,
    requests: &[AnalysisRequest],
    outcomes: Vec<AnalysisOutcome>,
) {
    calc.analysis_requests.extend_from_slice(requests);
    calc.analysis_results.extend(outcomes);
}

async fn run_tool(command: &ToolCommand, request: &AnalysisRequest, dir: &Path) -> AnalysisOutcome {
    let mut outcome = AnalysisOutcome {
        tool: request.tool.clone(),
        params: request.params.clone(),
        success: false,
        output: String::new(),
        error: None,
        exit_code: None,
        artifacts: Vec::new(),
        finished_at: Utc::now(),
    };

    match execute(command, dir).await {
        Ok(output) => {
            outcome.exit_code = output.status.code();
            outcome.output = String::from_utf8_lossy(&output.stdout).into_owned();
            if output.status.success() {
                let path = dir.join(format!("{}_output.txt", request.label()));
                match tokio::fs::write(&path, &output.stdout).await {
                    Ok(()) => {
                        outcome.artifacts.push(path);
                        outcome.success = true;
                    }
                    Err(err) => outcome.error = Some(format!("cannot save output: {err}")),
                }
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stderr = stderr.trim();
                outcome.error = Some(if stderr.is_empty() {
                    format!("{} exited with {}", request.tool, output.status)
                } else {
                    stderr.to_string()
                });
            }
        }
        Err(err) => outcome.error = Some(format!("cannot run {}: {err}", command.program.display())),
    }

    outcome.finished_at = Utc::now();
    outcome
}

async fn execute(command: &ToolCommand, dir: &Path) -> std::io::Result<std::process::Output> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .current_dir(dir)
        .stdin(if command.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let (Some(text), Some(mut stdin)) = (&command.stdin, child.stdin.take()) {
        // A tool may exit without reading its input.
        if let Err(err) = stdin.write_all(text.as_bytes()).await
            && err.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(err);
        }
    }

    child.wait_with_output().await
}
