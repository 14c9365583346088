//! InMemoryTaskStore - 開発・テスト用の正本
//!
//! - HashMap<TaskId, Task> が唯一の状態（arena of records by id）
//! - std Mutex はロック区間内で await しない
//! - イベントはロック解放後に発行

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::domain::{
    DeadLetterEntry, DomainEvent, Payload, ShuttleError, ShuttleResult, Task, TaskId, TaskState,
    WorkerName,
};
use crate::ports::task_store::{check_transition, sort_fifo};
use crate::ports::{Clock, EventSink, IdGenerator, TaskCounts, TaskStore, UlidGenerator};

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<TaskId, Task>,
    dead_letters: HashMap<TaskId, DeadLetterEntry>,
}

pub struct InMemoryTaskStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>, events: Arc<dyn EventSink>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            ids: Box::new(UlidGenerator::new(clock.clone())),
            clock,
            events,
        }
    }

    fn lock(&self) -> ShuttleResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| ShuttleError::store("in-memory task store mutex poisoned"))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, worker: &WorkerName, payload: Payload) -> ShuttleResult<Task> {
        let now = self.clock.now();
        let task = Task::new(self.ids.generate_task_id(), worker.clone(), payload, now);
        self.lock()?.tasks.insert(task.id(), task.clone());

        self.events.emit(DomainEvent::TaskCreated {
            task_id: task.id(),
            worker: worker.clone(),
            at: now,
        });
        Ok(task)
    }

    async fn transition(
        &self,
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    ) -> ShuttleResult<Task> {
        let now = self.clock.now();
        let task = {
            let mut state = self.lock()?;
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or(ShuttleError::NotFound(task_id))?;
            check_transition(task, from, to)?;
            task.apply_transition(to, now);
            task.clone()
        };

        self.events.emit(DomainEvent::TaskTransitioned {
            task_id,
            worker: task.worker().clone(),
            from,
            to,
            at: now,
        });
        Ok(task)
    }

    async fn list(&self, worker: Option<&WorkerName>, state: TaskState) -> ShuttleResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .lock()?
            .tasks
            .values()
            .filter(|t| t.state() == state && worker.is_none_or(|w| t.worker() == w))
            .cloned()
            .collect();
        sort_fifo(&mut tasks);
        Ok(tasks)
    }

    async fn get(&self, task_id: TaskId) -> ShuttleResult<Task> {
        self.lock()?
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or(ShuttleError::NotFound(task_id))
    }

    async fn delete(&self, task_id: TaskId) -> ShuttleResult<()> {
        let mut state = self.lock()?;
        let task = state
            .tasks
            .get(&task_id)
            .ok_or(ShuttleError::NotFound(task_id))?;
        if !task.state().is_terminal() {
            return Err(ShuttleError::NotTerminal {
                task_id,
                state: task.state(),
            });
        }
        state.tasks.remove(&task_id);
        state.dead_letters.remove(&task_id);
        Ok(())
    }

    async fn record_dead_letter(&self, entry: DeadLetterEntry) -> ShuttleResult<()> {
        self.lock()?.dead_letters.insert(entry.task.id(), entry);
        Ok(())
    }

    async fn dead_letters(&self) -> ShuttleResult<Vec<DeadLetterEntry>> {
        let mut entries: Vec<DeadLetterEntry> =
            self.lock()?.dead_letters.values().cloned().collect();
        entries.sort_by_key(|e| (e.orphaned_at, e.task.id()));
        Ok(entries)
    }

    async fn counts(&self) -> ShuttleResult<TaskCounts> {
        let mut counts = TaskCounts::default();
        for task in self.lock()?.tasks.values() {
            counts.add(task.state());
        }
        Ok(counts)
    }
}
