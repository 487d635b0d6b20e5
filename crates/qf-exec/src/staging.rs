//! Working-directory conventions of the Quantics solver.
//!
//! Inputs are staged as `input.inp`, `<opname>.op` and `db_data/`; the
//! solver writes its results into `<workdir>/<name>` where `name` comes from
//! the input file's run section.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use qf_core::{Artifacts, OutputSummary};

pub const STAGED_INPUT: &str = "input.inp";
pub const FALLBACK_OPERATOR: &str = "operator.op";
pub const DATABASE_DIR: &str = "db_data";
pub const SOLVER_LOG: &str = "quantics.log";
pub const OUTPUT_FILES: [&str; 4] = ["log", "output", "auto", "psi"];

/// Files placed in a working directory by `stage_local_inputs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedInputs {
    pub input: PathBuf,
    pub operator: Option<PathBuf>,
    pub database: Option<PathBuf>,
}

/// Value of `key = value` in a Quantics input, first token only, `#` comments stripped.
pub fn keyword_value(content: &str, key: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let line = line.split('#').next().unwrap_or_default().trim();
        let (lhs, rhs) = line.split_once('=')?;
        if !lhs.trim().eq_ignore_ascii_case(key) {
            return None;
        }
        rhs.split(|c: char| c.is_whitespace() || c == ',')
            .find(|token| !token.is_empty())
            .map(str::to_string)
    })
}

/// Keyword values are used as path components; reject anything else.
fn as_component(value: String) -> Option<String> {
    let safe = !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\']);
    safe.then_some(value)
}

pub fn read_keyword(inp: &Path, key: &str) -> io::Result<Option<String>> {
    let content = fs::read_to_string(inp)?;
    Ok(keyword_value(&content, key).and_then(as_component))
}

pub fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Copy the artifacts into `workdir` under the names the solver expects.
pub fn stage_local_inputs(artifacts: &Artifacts, workdir: &Path) -> io::Result<StagedInputs> {
    fs::create_dir_all(workdir)?;

    let inp = artifacts
        .inp_file
        .as_deref()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no input file supplied"))?;
    let input = workdir.join(STAGED_INPUT);
    fs::copy(inp, &input)?;

    let operator = match artifacts.op_file.as_deref() {
        Some(op) => {
            let file_name = match read_keyword(inp, "opname")? {
                Some(opname) => format!("{opname}.op"),
                None => FALLBACK_OPERATOR.to_string(),
            };
            let target = workdir.join(file_name);
            fs::copy(op, &target)?;
            Some(target)
        }
        None => None,
    };

    let database = match artifacts.db_folder.as_deref() {
        Some(db) => {
            let target = workdir.join(DATABASE_DIR);
            if target.exists() {
                fs::remove_dir_all(&target)?;
            }
            copy_dir_recursive(db, &target)?;
            Some(target)
        }
        None => None,
    };

    Ok(StagedInputs {
        input,
        operator,
        database,
    })
}

/// `<workdir>/<name>`; the name comes from the staged input, falling back to
/// the calculation name, and the directory itself when neither exists.
pub fn output_directory(workdir: &Path, calc_name: &str) -> PathBuf {
    let from_input = read_keyword(&workdir.join(STAGED_INPUT), "name")
        .ok()
        .flatten();
    for name in from_input.into_iter().chain([calc_name.to_string()]) {
        let candidate = workdir.join(name);
        if candidate.is_dir() {
            return candidate;
        }
    }
    workdir.to_path_buf()
}

/// Fill energy, time and convergence from solver output text. Later lines win.
pub fn parse_summary(text: &str, summary: &mut OutputSummary) {
    let last_number = |line: &str| line.split_whitespace().last()?.parse::<f64>().ok();
    for line in text.lines() {
        if line.contains("Total energy")
            && let Some(value) = last_number(line)
        {
            summary.total_energy = Some(value);
        }
        if line.contains("Final time")
            && let Some(value) = last_number(line)
        {
            summary.final_time = Some(value);
        }
        if line.contains("Convergence") {
            if line.contains("achieved") {
                summary.converged = Some(true);
            } else if line.contains("failed") {
                summary.converged = Some(false);
            }
        }
    }
}

/// Locate the output directory, list the known output files and parse `log_file`.
pub fn discover_output(dir: &Path, log_file: &Path) -> io::Result<OutputSummary> {
    let mut summary = OutputSummary {
        directory: dir.to_path_buf(),
        files: OUTPUT_FILES
            .iter()
            .filter(|name| dir.join(name).exists())
            .map(|name| name.to_string())
            .collect(),
        ..OutputSummary::default()
    };

    match fs::read_to_string(log_file) {
        Ok(text) => parse_summary(&text, &mut summary),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT: &str = "RUN-SECTION\n  name = ho_out  # output dir\n  propagation\nend-run-section\n\nOPERATOR-SECTION\n  opname = ho\nend-operator-section\n";

    #[test]
    fn keywords_are_read_from_input_text() {
        assert_eq!(keyword_value(INPUT, "name").as_deref(), Some("ho_out"));
        assert_eq!(keyword_value(INPUT, "opname").as_deref(), Some("ho"));
        assert_eq!(keyword_value(INPUT, "tfinal"), None);
    }

    #[test]
    fn unsafe_keyword_values_are_ignored() {
        assert_eq!(as_component("../etc".to_string()), None);
        assert_eq!(as_component("..".to_string()), None);
        assert_eq!(as_component("ok".to_string()).as_deref(), Some("ok"));
    }

    #[test]
    fn staging_uses_solver_names() {
        let src = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let inp = src.path().join("model.inp");
        let op = src.path().join("model.op");
        let db = src.path().join("dd");
        fs::write(&inp, INPUT).unwrap();
        fs::write(&op, "OPERATOR\n").unwrap();
        fs::create_dir_all(db.join("nested")).unwrap();
        fs::write(db.join("nested").join("geo"), "1").unwrap();

        let artifacts = Artifacts::new(&inp, &op).with_database(&db);
        let staged = stage_local_inputs(&artifacts, work.path()).unwrap();

        assert_eq!(staged.input, work.path().join("input.inp"));
        assert_eq!(staged.operator, Some(work.path().join("ho.op")));
        assert!(work.path().join("db_data/nested/geo").is_file());
    }

    #[test]
    fn operator_name_falls_back() {
        let src = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let inp = src.path().join("a.inp");
        let op = src.path().join("a.op");
        fs::write(&inp, "RUN-SECTION\nend-run-section\n").unwrap();
        fs::write(&op, "").unwrap();

        let staged = stage_local_inputs(&Artifacts::new(&inp, &op), work.path()).unwrap();
        assert_eq!(staged.operator, Some(work.path().join("operator.op")));
    }

    #[test]
    fn output_directory_resolution() {
        let work = tempfile::tempdir().unwrap();
        assert_eq!(output_directory(work.path(), "calc"), work.path());

        fs::create_dir_all(work.path().join("calc")).unwrap();
        assert_eq!(output_directory(work.path(), "calc"), work.path().join("calc"));

        fs::write(work.path().join(STAGED_INPUT), INPUT).unwrap();
        fs::create_dir_all(work.path().join("ho_out")).unwrap();
        assert_eq!(output_directory(work.path(), "calc"), work.path().join("ho_out"));
    }

    #[test]
    fn summary_parsing() {
        let mut summary = OutputSummary::default();
        parse_summary(
            "step 1\nTotal energy  0.5\nTotal energy = 0.75\nFinal time  100.0\nConvergence achieved\n",
            &mut summary,
        );
        assert_eq!(summary.total_energy, Some(0.75));
        assert_eq!(summary.final_time, Some(100.0));
        assert_eq!(summary.converged, Some(true));
    }

    #[test]
    fn discover_lists_known_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("output"), "").unwrap();
        fs::write(dir.path().join("psi"), "").unwrap();
        fs::write(dir.path().join("restart"), "").unwrap();

        let summary = discover_output(dir.path(), &dir.path().join("missing.log")).unwrap();
        assert_eq!(summary.files, vec!["output", "psi"]);
        assert_eq!(summary.total_energy, None);
    }
}
