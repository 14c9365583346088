//! PollChannel - TaskStore の定期 list による activation
//!
//! - 一定間隔で `list(worker, Pending)` し、未通知の task_id を流す
//! - idle 時も I/O が発生する代わりに、取りこぼしは最大 1 tick で解消
//! - HybridChannel の safety-net としても同じループを使う

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::domain::{ChannelHealth, ShuttleResult, Task, TaskId, TaskState, WorkerName};
use crate::ports::activation::SUBSCRIPTION_BUFFER;
use crate::ports::{ActivationChannel, Subscription, TaskStore};

/// Ids already handed to one subscriber.
///
/// Poll announcements are keyed by `(id, attempt)` so a re-dispatched task is
/// announced again. Ids that arrived by push are not repeated by the next poll,
/// and a push for an id the poll already announced is dropped.
#[derive(Debug, Default)]
pub(crate) struct Announced {
    polled: HashMap<TaskId, u32>,
    pushed: HashSet<TaskId>,
}

impl Announced {
    /// `false` when the id was already announced.
    pub(crate) fn on_push(&mut self, task_id: TaskId) -> bool {
        !self.polled.contains_key(&task_id) && self.pushed.insert(task_id)
    }

    /// Ids from `pending` the subscriber has not seen yet. Forgets ids that
    /// are no longer pending.
    pub(crate) fn on_poll(&mut self, pending: &[Task]) -> Vec<TaskId> {
        let current: HashMap<TaskId, u32> =
            pending.iter().map(|t| (t.id(), t.attempt())).collect();
        self.polled.retain(|id, _| current.contains_key(id));
        self.pushed.retain(|id| current.contains_key(id));

        let mut fresh = Vec::new();
        for task in pending {
            let id = task.id();
            if self.polled.get(&id) == Some(&task.attempt()) {
                continue;
            }
            self.polled.insert(id, task.attempt());
            if !self.pushed.remove(&id) {
                fresh.push(id);
            }
        }
        fresh
    }
}

/// Poll loop shared by PollChannel and HybridChannel. Ticks immediately, then
/// every `interval`; a change of `interval` triggers an immediate tick.
pub(crate) async fn run_poll_loop(
    store: Arc<dyn TaskStore>,
    worker: WorkerName,
    mut interval: watch::Receiver<Duration>,
    tx: mpsc::Sender<TaskId>,
    announced: Arc<Mutex<Announced>>,
) {
    loop {
        match store.list(Some(&worker), TaskState::Pending).await {
            Ok(pending) => {
                let fresh = announced
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .on_poll(&pending);
                trace!(worker = %worker, pending = pending.len(), fresh = fresh.len(), "poll tick");
                for id in fresh {
                    if tx.send(id).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(worker = %worker, error = %e, "poll failed to list pending tasks"),
        }

        let period = *interval.borrow_and_update();
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            changed = interval.changed() => {
                if changed.is_err() {
                    // interval の送信側がない: 最後の値で続行
                    tokio::time::sleep(period).await;
                } else {
                    debug!(worker = %worker, interval = ?*interval.borrow(), "poll interval changed");
                }
            }
            _ = tx.closed() => return,
        }
    }
}

pub struct PollChannel {
    store: Arc<dyn TaskStore>,
    interval: Duration,
}

impl PollChannel {
    pub fn new(store: Arc<dyn TaskStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl ActivationChannel for PollChannel {
    fn notify(&self, worker: &WorkerName, task_id: TaskId) {
        // 次の tick で拾われる
        trace!(worker = %worker, task_id = %task_id, "poll channel ignores notify");
    }

    async fn subscribe(&self, worker: &WorkerName) -> ShuttleResult<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (interval_tx, interval_rx) = watch::channel(self.interval);
        let store = self.store.clone();
        let worker = worker.clone();

        let driver = tokio::spawn(async move {
            let _interval_tx = interval_tx;
            run_poll_loop(store, worker, interval_rx, tx, Arc::default()).await;
        });
        Ok(Subscription::new(rx, driver))
    }

    fn health(&self, _worker: &WorkerName) -> ChannelHealth {
        ChannelHealth::Healthy
    }
}
