//! Settings validation.

use qf_core::AnalysisRequest;

use crate::schema::Settings;

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("Invalid value: {field} = {value} ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Unsupported version: {version}")]
    UnsupportedVersion { version: u32 },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

pub fn validate_settings(settings: &Settings) -> Result<(), ValidationError> {
    if settings.version > crate::migrate::LATEST_VERSION {
        return Err(ValidationError::UnsupportedVersion {
            version: settings.version,
        });
    }

    if settings.solver.executable.trim().is_empty() {
        return Err(invalid("solver.executable", "", "must not be empty"));
    }

    for command in &settings.analysis.tools {
        if AnalysisRequest::parse(command).is_err() {
            return Err(invalid("analysis.tools", command, "empty command"));
        }
    }

    let remote = &settings.remote;
    if remote.num_machines == 0 {
        return Err(invalid("remote.num_machines", 0, "must be positive"));
    }
    if remote.mpiprocs == 0 {
        return Err(invalid("remote.mpiprocs", 0, "must be positive"));
    }
    if remote.walltime_s == 0 {
        return Err(invalid("remote.walltime_s", 0, "must be positive"));
    }
    if !remote.code_label.contains('@') {
        return Err(invalid(
            "remote.code_label",
            &remote.code_label,
            "expected label@computer",
        ));
    }

    let orch = &settings.orchestrator;
    if orch.poll_interval_ms == 0 {
        return Err(invalid("orchestrator.poll_interval_ms", 0, "must be positive"));
    }
    if orch.poll_timeout_ms == 0 || orch.poll_timeout_ms > orch.poll_interval_ms {
        return Err(invalid(
            "orchestrator.poll_timeout_ms",
            orch.poll_timeout_ms,
            "must be positive and not exceed the poll interval",
        ));
    }
    if orch.log_capacity == 0 {
        return Err(invalid("orchestrator.log_capacity", 0, "must be positive"));
    }
    if orch.event_capacity == 0 {
        return Err(invalid("orchestrator.event_capacity", 0, "must be positive"));
    }

    Ok(())
}
