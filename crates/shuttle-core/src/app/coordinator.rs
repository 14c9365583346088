//! Coordinator - create / await / crash recovery の薄いオーケストレーション

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::sweeper::{self, OrphanSweeper, SweepReport};
use crate::domain::{
    DeadLetterReason, DomainEvent, Payload, ShuttleError, ShuttleResult, Task, TaskId, TaskState,
    WorkerName,
};
use crate::impls::BroadcastEventSink;
use crate::ports::{ActivationChannel, Clock, TaskStore};

pub struct Coordinator {
    store: Arc<dyn TaskStore>,
    activation: Arc<dyn ActivationChannel>,
    sweeper: Arc<OrphanSweeper>,
    clock: Arc<dyn Clock>,
    events: Option<Arc<BroadcastEventSink>>,
    await_poll_interval: Duration,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        activation: Arc<dyn ActivationChannel>,
        sweeper: Arc<OrphanSweeper>,
        clock: Arc<dyn Clock>,
        await_poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            activation,
            sweeper,
            clock,
            events: None,
            await_poll_interval,
        }
    }

    /// Wake [`await_result`](Self::await_result) on transition events instead
    /// of waiting for the next poll.
    pub fn with_events(mut self, events: Arc<BroadcastEventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// `Pending` で永続化してから announce。announce の失敗で作成は失敗しない
    pub async fn create_task(&self, worker: &WorkerName, payload: Payload) -> ShuttleResult<Task> {
        let task = self.store.create(worker, payload).await?;
        info!(worker = %worker, task_id = %task.id(), bytes = task.payload().len(), "task created");
        self.activation.notify(worker, task.id());
        Ok(task)
    }

    /// Wait until the task is `Completed`, `Failed` or `DeadLettered`.
    pub async fn await_result(&self, task_id: TaskId, timeout: Duration) -> ShuttleResult<Task> {
        // subscribe before the first read so no transition slips between them
        let mut events = self.events.as_ref().map(|sink| sink.subscribe());
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let task = self.store.get(task_id).await?;
            if task.state().is_settled() {
                return Ok(task);
            }
            let woke = tokio::time::timeout_at(
                deadline,
                wait_for_transition(&mut events, task_id, self.await_poll_interval),
            )
            .await;
            if woke.is_err() {
                let task = self.store.get(task_id).await?;
                if task.state().is_settled() {
                    return Ok(task);
                }
                debug!(task_id = %task_id, state = %task.state(), "await_result timed out");
                return Err(ShuttleError::Timeout(task_id));
            }
        }
    }

    /// crash が分かっている worker の `Processing` task をすべて回収
    pub async fn handle_worker_crash(&self, worker: &WorkerName) -> ShuttleResult<SweepReport> {
        warn!(worker = %worker, "worker crash reported");
        self.sweeper.recover_worker(worker).await
    }

    /// `Failed -> Pending` and announce again.
    pub async fn retry(&self, task_id: TaskId) -> ShuttleResult<Task> {
        let task = self
            .store
            .transition(task_id, TaskState::Failed, TaskState::Pending)
            .await?;
        info!(worker = %task.worker(), task_id = %task_id, attempt = task.attempt(), "task retried");
        self.activation.notify(task.worker(), task_id);
        Ok(task)
    }

    /// 明示的に dead letter に送る
    pub async fn escalate(
        &self,
        task_id: TaskId,
        from: TaskState,
        reason: impl Into<String>,
    ) -> ShuttleResult<Task> {
        sweeper::dead_letter(
            self.store.as_ref(),
            task_id,
            from,
            DeadLetterReason::Escalated(reason.into()),
            self.clock.now(),
        )
        .await
    }

    /// Delete a terminal task record.
    pub async fn purge(&self, task_id: TaskId) -> ShuttleResult<()> {
        self.store.delete(task_id).await?;
        info!(task_id = %task_id, "task purged");
        Ok(())
    }
}

/// Returns after `poll` or as soon as an event about `task_id` arrives.
async fn wait_for_transition(
    events: &mut Option<broadcast::Receiver<DomainEvent>>,
    task_id: TaskId,
    poll: Duration,
) {
    let Some(rx) = events.as_mut() else {
        tokio::time::sleep(poll).await;
        return;
    };

    let sleep = tokio::time::sleep(poll);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return,
            event = rx.recv() => match event {
                Ok(event) if event.task_id() == Some(task_id) => return,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => return,
                Err(broadcast::error::RecvError::Closed) => {
                    sleep.as_mut().await;
                    *events = None;
                    return;
                }
            },
        }
    }
}
