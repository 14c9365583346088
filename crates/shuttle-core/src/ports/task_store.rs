//! TaskStore port - タスクの正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - タスクの状態（TaskState）と履歴（attempt, timestamps）
//! - dead letter
//!
//! # 設計原則
//! - 書き込みは原子的（途中状態のレコードは決して観測されない）
//! - 状態遷移は `transition` の CAS のみ（直接のフィールド書き換えは不可）
//! - 成功した create / transition は DomainEvent を発行する

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{
    DeadLetterEntry, Payload, ShuttleError, ShuttleResult, Task, TaskId, TaskState, WorkerName,
};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Allocate an id and persist a `Pending` task.
    async fn create(&self, worker: &WorkerName, payload: Payload) -> ShuttleResult<Task>;

    /// Compare-and-swap `from -> to`. Returns the task as written.
    ///
    /// Fails with `StateConflict` when the current state is not `from`.
    async fn transition(&self, task_id: TaskId, from: TaskState, to: TaskState)
    -> ShuttleResult<Task>;

    /// Snapshot of tasks in `state`, oldest first. `None` lists every worker.
    async fn list(&self, worker: Option<&WorkerName>, state: TaskState) -> ShuttleResult<Vec<Task>>;

    async fn get(&self, task_id: TaskId) -> ShuttleResult<Task>;

    /// Remove a `Completed` or `DeadLettered` record (and its dead-letter entry).
    async fn delete(&self, task_id: TaskId) -> ShuttleResult<()>;

    async fn record_dead_letter(&self, entry: DeadLetterEntry) -> ShuttleResult<()>;

    async fn dead_letters(&self) -> ShuttleResult<Vec<DeadLetterEntry>>;

    async fn counts(&self) -> ShuttleResult<TaskCounts>;
}

/// Number of tasks per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl TaskCounts {
    pub fn add(&mut self, state: TaskState) {
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::Processing => self.processing += 1,
            TaskState::Completed => self.completed += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::DeadLettered => self.dead_lettered += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.dead_lettered
    }
}

/// Sort into per-worker FIFO order.
pub(crate) fn sort_fifo(tasks: &mut [Task]) {
    tasks.sort_by_key(Task::fifo_key);
}

/// Validate `from -> to` against the state machine, then the CAS precondition.
pub(crate) fn check_transition(task: &Task, from: TaskState, to: TaskState) -> ShuttleResult<()> {
    if !from.can_transition_to(to) {
        return Err(ShuttleError::InvalidTransition { from, to });
    }
    if task.state() != from {
        return Err(ShuttleError::StateConflict {
            task_id: task.id(),
            expected: from,
            actual: task.state(),
        });
    }
    Ok(())
}
