#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use qf_analysis::{AnalysisError, AnalysisPipeline};
use qf_core::{
    AnalysisRequest, Artifacts, BackendKind, CalcName, CalcState, Calculation, Catalog, CoreError,
    OutputSummary, WorkflowType,
};

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
}

struct Fixture {
    _dir: tempfile::TempDir,
    tools: PathBuf,
    output: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let tools = dir.path().join("bin");
        let output = dir.path().join("run").join("ho");
        fs::create_dir_all(&tools).unwrap();
        fs::create_dir_all(&output).unwrap();

        write_script(
            &tools,
            "rdcheck",
            "touch \"$(dirname \"$0\")/rdcheck.ran\"\n\
             if [ \"$1\" = fail ]; then echo 'no check file' >&2; exit 2; fi\n\
             echo \"rdcheck $*\"",
        );
        write_script(&tools, "rdgpop", "read nz\nread dof\necho \"nz=$nz dof=$dof args=$*\"");

        Self {
            _dir: dir,
            tools,
            output,
        }
    }

    fn pipeline(&self) -> AnalysisPipeline {
        AnalysisPipeline::new(Arc::new(Catalog::standard())).with_tool_dir(Some(self.tools.clone()))
    }

    fn finished(&self, workflow: WorkflowType) -> Calculation {
        let mut calc = Calculation::new(
            CalcName::parse("ho").unwrap(),
            workflow,
            Artifacts::new("ho.inp", "ho.op"),
            self.output.parent().unwrap().to_path_buf(),
            BackendKind::Local,
        );
        for state in [CalcState::Submitted, CalcState::Running, CalcState::Finished] {
            calc.apply_transition(state).unwrap();
        }
        calc.output = Some(OutputSummary {
            directory: self.output.clone(),
            ..OutputSummary::default()
        });
        calc
    }
}

fn requests(commands: &[&str]) -> Vec<AnalysisRequest> {
    commands
        .iter()
        .map(|c| AnalysisRequest::parse(c).unwrap())
        .collect()
}

#[tokio::test]
async fn failure_does_not_abort_remaining_tools() {
    let fx = Fixture::new();
    let calc = fx.finished(WorkflowType::Mctdh);

    let outcomes = fx
        .pipeline()
        .run(&calc, &requests(&["rdcheck etot", "rdcheck fail", "rdgpop"]))
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 3);

    assert!(outcomes[0].success);
    assert_eq!(outcomes[0].output.trim(), "rdcheck etot");
    let saved = fx.output.join("rdcheck_etot_output.txt");
    assert_eq!(outcomes[0].artifacts, vec![saved.clone()]);
    assert_eq!(fs::read_to_string(saved).unwrap().trim(), "rdcheck etot");

    assert!(!outcomes[1].success);
    assert_eq!(outcomes[1].exit_code, Some(2));
    assert_eq!(outcomes[1].error.as_deref(), Some("no check file"));
    assert!(outcomes[1].artifacts.is_empty());

    assert!(outcomes[2].success);
    assert_eq!(outcomes[2].output.trim(), "nz=2 dof=1 args=-w");
    assert!(fx.output.join("rdgpop_output.txt").is_file());
}

#[tokio::test]
async fn unsupported_tool_rejects_whole_batch() {
    let fx = Fixture::new();
    let calc = fx.finished(WorkflowType::Mctdh);

    let err = fx
        .pipeline()
        .run(&calc, &requests(&["rdcheck etot", "ddtraj"]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AnalysisError::Core(CoreError::UnsupportedTool { .. })
    ));
    assert!(!fx.tools.join("rdcheck.ran").exists());
}

#[tokio::test]
async fn missing_executable_is_a_failed_outcome() {
    let fx = Fixture::new();
    let calc = fx.finished(WorkflowType::DdVmcg);

    let outcomes = fx
        .pipeline()
        .run(&calc, &requests(&["ddtraj", "rdcheck spop"]))
        .await
        .unwrap();

    assert!(!outcomes[0].success);
    assert!(outcomes[0].error.as_deref().unwrap().contains("cannot run"));
    assert!(outcomes[1].success);
}
