//! Calculation state machine.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle state of a calculation.
///
/// `Created -> Submitted -> Running -> Finished | Failed`, with `Stopped`
/// reachable from `Submitted` or `Running` through cancellation and
/// `Created -> Failed` when submission itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalcState {
    Created,
    Submitted,
    Running,
    Finished,
    Failed,
    Stopped,
}

impl CalcState {
    pub const ALL: [CalcState; 6] = [
        CalcState::Created,
        CalcState::Submitted,
        CalcState::Running,
        CalcState::Finished,
        CalcState::Failed,
        CalcState::Stopped,
    ];

    /// No backend activity is permitted from a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CalcState::Finished | CalcState::Failed | CalcState::Stopped
        )
    }

    /// Submitted or running: the backend owns a live job.
    pub fn is_active(self) -> bool {
        matches!(self, CalcState::Submitted | CalcState::Running)
    }

    /// Position in the lifecycle; every legal transition strictly increases it.
    pub fn rank(self) -> u8 {
        match self {
            CalcState::Created => 0,
            CalcState::Submitted => 1,
            CalcState::Running => 2,
            CalcState::Finished | CalcState::Failed | CalcState::Stopped => 3,
        }
    }

    pub fn can_transition_to(self, next: CalcState) -> bool {
        use CalcState::*;
        matches!(
            (self, next),
            (Created, Submitted)
                | (Created, Failed)
                | (Submitted, Running)
                | (Submitted, Failed)
                | (Submitted, Stopped)
                | (Running, Finished)
                | (Running, Failed)
                | (Running, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CalcState::Created => "CREATED",
            CalcState::Submitted => "SUBMITTED",
            CalcState::Running => "RUNNING",
            CalcState::Finished => "FINISHED",
            CalcState::Failed => "FAILED",
            CalcState::Stopped => "STOPPED",
        }
    }
}

impl FromStr for CalcState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CalcState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CoreError::UnknownState(s.to_string()))
    }
}

impl fmt::Display for CalcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn any_state() -> impl Strategy<Value = CalcState> {
        prop::sample::select(CalcState::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn walks_never_revisit_or_leave_terminal(attempts in prop::collection::vec(any_state(), 0..32)) {
            let mut current = CalcState::Created;
            let mut visited = vec![current];

            for next in attempts {
                if current.can_transition_to(next) {
                    prop_assert!(!visited.contains(&next));
                    prop_assert!(!current.is_terminal());
                    current = next;
                    visited.push(current);
                }
            }

            prop_assert!(visited.len() <= 4);
        }
    }
}
