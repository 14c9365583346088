//! Task state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task state.
///
/// State transitions:
/// - Pending -> Processing -> Completed
/// - Pending -> Processing -> Failed -> Pending (retry)
/// - Processing -> Pending (re-dispatch of an orphaned task)
/// - Processing / Failed -> DeadLettered (give up)
/// - Pending -> DeadLettered (no consuming worker)
///
/// Completed and DeadLettered are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Written and waiting for its worker.
    Pending,

    /// Claimed by a worker.
    Processing,

    /// Finished successfully.
    Completed,

    /// Finished unsuccessfully; may be retried or dead-lettered.
    Failed,

    /// Given up on. Needs operator action.
    DeadLettered,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        TaskState::Pending,
        TaskState::Processing,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::DeadLettered,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::DeadLettered)
    }

    /// Has the task reached an outcome the coordinator can act on?
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::DeadLettered
        )
    }

    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, DeadLettered)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
                | (Processing, DeadLettered)
                | (Failed, Pending)
                | (Failed, DeadLettered)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Processing => "processing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown task state '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use TaskState::*;

    #[rstest]
    #[case(Pending, Processing)]
    #[case(Pending, DeadLettered)]
    #[case(Processing, Completed)]
    #[case(Processing, Failed)]
    #[case(Processing, Pending)]
    #[case(Processing, DeadLettered)]
    #[case(Failed, Pending)]
    #[case(Failed, DeadLettered)]
    fn allowed_transitions(#[case] from: TaskState, #[case] to: TaskState) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case(Completed, Pending)]
    #[case(Completed, Failed)]
    #[case(DeadLettered, Pending)]
    #[case(Pending, Completed)]
    #[case(Pending, Failed)]
    #[case(Failed, Processing)]
    #[case(Pending, Pending)]
    fn forbidden_transitions(#[case] from: TaskState, #[case] to: TaskState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn terminal_states_have_no_exit() {
        for from in TaskState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TaskState::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn parses_its_own_display() {
        for state in TaskState::ALL {
            assert_eq!(state.to_string().parse::<TaskState>().unwrap(), state);
        }
        assert!("running".parse::<TaskState>().is_err());
    }
}
