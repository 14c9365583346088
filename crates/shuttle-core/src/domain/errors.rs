//! Errors - エラー型と分類

use thiserror::Error;

use super::ids::TaskId;
use super::state::TaskState;

/// ErrorKind は呼び出し側のリトライ判断のための分類
///
/// - Transient: 一時的（呼び出し側の判断でリトライ可）
/// - Permanent: 恒久的（リトライ無意味）
/// - Infrastructure: 永続化媒体などインフラの障害
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum ShuttleError {
    #[error("task store unavailable: {0}")]
    StoreUnavailable(String),

    /// CAS failure: someone else already moved this task.
    #[error("state conflict on {task_id}: expected {expected}, found {actual}")]
    StateConflict {
        task_id: TaskId,
        expected: TaskState,
        actual: TaskState,
    },

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("task {task_id} is {state}, only terminal tasks can be deleted")]
    NotTerminal { task_id: TaskId, state: TaskState },

    #[error("invalid worker name '{name}': {reason}")]
    InvalidWorkerName { name: String, reason: String },

    #[error("push transport degraded: {0}")]
    TransportDegraded(String),

    #[error("worker {worker} unresponsive")]
    WorkerUnresponsive { worker: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timed out waiting for {0}")]
    Timeout(TaskId),
}

impl ShuttleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShuttleError::StoreUnavailable(_) => ErrorKind::Infrastructure,
            ShuttleError::StateConflict { .. }
            | ShuttleError::TransportDegraded(_)
            | ShuttleError::WorkerUnresponsive { .. }
            | ShuttleError::Timeout(_) => ErrorKind::Transient,
            ShuttleError::NotFound(_)
            | ShuttleError::InvalidTransition { .. }
            | ShuttleError::NotTerminal { .. }
            | ShuttleError::InvalidWorkerName { .. }
            | ShuttleError::Serialization(_) => ErrorKind::Permanent,
        }
    }

    /// Normal control flow under races, not a failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ShuttleError::StateConflict { .. })
    }

    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        ShuttleError::StoreUnavailable(err.to_string())
    }
}

pub type ShuttleResult<T> = Result<T, ShuttleError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn conflicts_are_transient() {
        let err = ShuttleError::StateConflict {
            task_id: TaskId::from_ulid(Ulid::new()),
            expected: TaskState::Pending,
            actual: TaskState::Processing,
        };
        assert!(err.is_conflict());
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().contains("expected pending, found processing"));
    }

    #[test]
    fn store_failures_are_infrastructure() {
        let err = ShuttleError::store("disk gone");
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(!err.is_conflict());
    }

    #[test]
    fn unresponsive_workers_are_transient() {
        let err = ShuttleError::WorkerUnresponsive {
            worker: "w1".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(!err.is_conflict());
    }
}
