//! Flat views of calculations for listings and status output.

use chrono::{DateTime, Utc};
use qf_core::{BackendKind, CalcState, Calculation, WorkflowType};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalcSummary {
    pub name: String,
    pub workflow: WorkflowType,
    pub backend: BackendKind,
    pub state: CalcState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Seconds between submission and reaching a terminal state.
    pub duration_s: Option<i64>,
    pub error: Option<String>,
    pub total_energy: Option<f64>,
    pub analysis_results: usize,
}

impl From<&Calculation> for CalcSummary {
    fn from(calc: &Calculation) -> Self {
        let duration_s = match (calc.started_at, calc.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        };
        Self {
            name: calc.name.to_string(),
            workflow: calc.workflow_type,
            backend: calc.backend,
            state: calc.state,
            created_at: calc.created_at,
            started_at: calc.started_at,
            finished_at: calc.finished_at,
            duration_s,
            error: calc.error.as_ref().map(|e| e.message.clone()),
            total_energy: calc.output.as_ref().and_then(|o| o.total_energy),
            analysis_results: calc.analysis_results.len(),
        }
    }
}

/// Summaries of `calcs`, optionally restricted to one state.
pub fn summarize(calcs: &[Calculation], state: Option<CalcState>) -> Vec<CalcSummary> {
    calcs
        .iter()
        .filter(|calc| state.is_none_or(|s| calc.state == s))
        .map(CalcSummary::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use qf_core::{Artifacts, CalcName, ErrorKind, ErrorRecord};

    fn calc(name: &str) -> Calculation {
        Calculation::new(
            CalcName::parse(name).unwrap(),
            WorkflowType::Vmcg,
            Artifacts::new("a.inp", "a.op"),
            format!("/runs/{name}").into(),
            BackendKind::Local,
        )
    }

    #[test]
    fn summary_of_failed_calculation() {
        let mut c = calc("h2o");
        c.apply_transition(CalcState::Submitted).unwrap();
        c.fail(ErrorRecord::new(ErrorKind::Execution, "exit status 1").with_exit_code(Some(1)))
            .unwrap();

        let s = CalcSummary::from(&c);
        assert_eq!(s.state, CalcState::Failed);
        assert_eq!(s.error.as_deref(), Some("exit status 1"));
        assert!(s.duration_s.is_some_and(|d| d >= 0));
        assert_eq!(s.analysis_results, 0);
    }

    #[test]
    fn filter_by_state() {
        let mut running = calc("b");
        running.apply_transition(CalcState::Submitted).unwrap();
        let calcs = vec![calc("a"), running];

        assert_eq!(summarize(&calcs, None).len(), 2);
        let submitted = summarize(&calcs, Some(CalcState::Submitted));
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].name, "b");
        assert!(summarize(&calcs, Some(CalcState::Finished)).is_empty());
    }
}
