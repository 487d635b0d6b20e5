//! Concrete command lines for analysis tools.

use std::path::{Path, PathBuf};

use qf_core::{AnalysisRequest, ParamPassing, ToolSpec};

/// One resolved tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Text piped to the tool's stdin, if any.
    pub stdin: Option<String>,
}

impl ToolCommand {
    /// Parameters are passed through untouched; catalog defaults apply only
    /// when the request has none.
    pub fn build(spec: &ToolSpec, request: &AnalysisRequest, tool_dir: Option<&Path>) -> Self {
        let program = match tool_dir {
            Some(dir) if !spec.executable.contains('/') => dir.join(&spec.executable),
            _ => PathBuf::from(&spec.executable),
        };

        let params = if request.params.is_empty() {
            &spec.default_params
        } else {
            &request.params
        };

        let mut args = spec.fixed_args.clone();
        let stdin = match spec.params {
            ParamPassing::Arguments => {
                args.extend(params.iter().cloned());
                None
            }
            ParamPassing::StdinLines => {
                let mut text = String::new();
                for param in params {
                    text.push_str(param);
                    text.push('\n');
                }
                Some(text)
            }
        };

        Self { program, args, stdin }
    }

    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qf_core::{Catalog, ToolName};

    #[test]
    fn rdcheck_takes_arguments() {
        let catalog = Catalog::standard();
        let spec = catalog.tool_spec(&ToolName::new("rdcheck")).unwrap();
        let request = AnalysisRequest::parse("rdcheck natpop 0 0").unwrap();

        let cmd = ToolCommand::build(spec, &request, None);
        assert_eq!(cmd.program, PathBuf::from("rdcheck"));
        assert_eq!(cmd.args, vec!["natpop", "0", "0"]);
        assert_eq!(cmd.stdin, None);
    }

    #[test]
    fn rdgpop_reads_defaults_from_stdin() {
        let catalog = Catalog::standard();
        let spec = catalog.tool_spec(&ToolName::new("rdgpop")).unwrap();

        let defaults = ToolCommand::build(spec, &AnalysisRequest::parse("rdgpop").unwrap(), None);
        assert_eq!(defaults.args, vec!["-w"]);
        assert_eq!(defaults.stdin.as_deref(), Some("2\n1\n"));

        let custom = ToolCommand::build(spec, &AnalysisRequest::parse("rdgpop 5 3").unwrap(), None);
        assert_eq!(custom.stdin.as_deref(), Some("5\n3\n"));
    }

    #[test]
    fn tool_dir_prefixes_bare_names() {
        let catalog = Catalog::standard();
        let spec = catalog.tool_spec(&ToolName::new("ddtraj")).unwrap();
        let cmd = ToolCommand::build(
            spec,
            &AnalysisRequest::parse("ddtraj").unwrap(),
            Some(Path::new("/opt/quantics/bin")),
        );
        assert_eq!(cmd.program, PathBuf::from("/opt/quantics/bin/ddtraj"));
        assert_eq!(cmd.display(), "/opt/quantics/bin/ddtraj");
    }
}
