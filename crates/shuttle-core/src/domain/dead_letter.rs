//! Dead-letter entries: tasks the system gave up on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::task::Task;

/// Why a task was dead-lettered.
///
/// Stored as its display string so the record reads naturally at rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeadLetterReason {
    /// The owning worker stopped beating and `max_attempts` was exhausted.
    WorkerUnresponsive,
    /// Pending for too long on a queue no worker has ever beaten for.
    NoConsumingWorker,
    /// Explicit escalation by the coordinator or an operator.
    Escalated(String),
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &str {
        match self {
            DeadLetterReason::WorkerUnresponsive => "worker unresponsive",
            DeadLetterReason::NoConsumingWorker => "no consuming worker",
            DeadLetterReason::Escalated(reason) => reason,
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for DeadLetterReason {
    fn from(value: String) -> Self {
        match value.as_str() {
            "worker unresponsive" => DeadLetterReason::WorkerUnresponsive,
            "no consuming worker" => DeadLetterReason::NoConsumingWorker,
            _ => DeadLetterReason::Escalated(value),
        }
    }
}

impl From<DeadLetterReason> for String {
    fn from(value: DeadLetterReason) -> Self {
        value.as_str().to_string()
    }
}

/// Terminal record wrapping the dead-lettered task. Never reprocessed
/// automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task: Task,
    pub reason: DeadLetterReason,
    pub orphaned_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(task: Task, reason: DeadLetterReason, orphaned_at: DateTime<Utc>) -> Self {
        Self {
            task,
            reason,
            orphaned_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(DeadLetterReason::WorkerUnresponsive, "worker unresponsive")]
    #[case(DeadLetterReason::NoConsumingWorker, "no consuming worker")]
    #[case(DeadLetterReason::Escalated("bad payload".into()), "bad payload")]
    fn reason_is_stored_as_plain_text(#[case] reason: DeadLetterReason, #[case] text: &str) {
        let json = serde_json::to_string(&reason).unwrap();
        assert_eq!(json, format!("\"{text}\""));
        let back: DeadLetterReason = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reason);
    }
}
