//! WorkerLoop - 参照用の worker 実装
//!
//! # フロー
//! 1. ActivationChannel を購読
//! 2. activation ごとに最古の Pending を `Pending -> Processing` の CAS で claim
//! 3. TaskHandler を実行
//! 4. `Completed` / `Failed` に遷移
//!
//! heartbeat は処理の有無に関係なく別タスクで一定間隔で送る。
//! 1 worker につき同時に 1 task（逐次実行）。shutdown は実行中の handler を
//! キャンセルせず、新しい claim を止めるだけ。

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::heartbeat::HeartbeatMonitor;
use crate::domain::{
    ErrorKind, ShuttleError, ShuttleResult, Task, TaskId, TaskState, WorkerName,
};
use crate::ports::{ActivationChannel, TaskStore};

/// Failure reported by a [`TaskHandler`]. The task ends up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Runs the content of a task. The payload is opaque to the dispatch core.
///
/// ```ignore
/// struct Echo;
///
/// #[async_trait]
/// impl TaskHandler for Echo {
///     async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
///         println!("{}", String::from_utf8_lossy(task.payload().as_bytes()));
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError>;
}

/// Adapter for closures, see [`handler_fn`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        (self.0)(task.clone()).await
    }
}

/// What the heartbeat task reports.
#[derive(Default)]
struct WorkerStatus {
    current: Mutex<Option<TaskId>>,
    queue_depth: AtomicU32,
}

impl WorkerStatus {
    fn set_current(&self, task: Option<TaskId>) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = task;
    }

    fn current(&self) -> Option<TaskId> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct WorkerLoop {
    worker: WorkerName,
    store: Arc<dyn TaskStore>,
    activation: Arc<dyn ActivationChannel>,
    monitor: Arc<HeartbeatMonitor>,
    handler: Arc<dyn TaskHandler>,
    heartbeat_interval: Duration,
    status: Arc<WorkerStatus>,
}

impl WorkerLoop {
    pub fn new(
        worker: WorkerName,
        store: Arc<dyn TaskStore>,
        activation: Arc<dyn ActivationChannel>,
        monitor: Arc<HeartbeatMonitor>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            worker,
            store,
            activation,
            monitor,
            handler,
            heartbeat_interval: Duration::from_secs(10),
            status: Arc::default(),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Spawn the loop and return a handle that stops it.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = self.worker.clone();
        let join = tokio::spawn(async move {
            let name = self.worker.clone();
            if let Err(e) = self.run(shutdown_rx).await {
                error!(worker = %name, error = %e, "worker loop stopped with error");
            }
        });
        WorkerHandle {
            worker,
            shutdown_tx,
            join,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ShuttleResult<()> {
        let mut activations = self.activation.subscribe(&self.worker).await?;
        let beat = tokio::spawn(beat_loop(
            self.monitor.clone(),
            self.worker.clone(),
            self.status.clone(),
            self.heartbeat_interval,
            shutdown.clone(),
        ));
        info!(worker = %self.worker, "worker started");

        self.drain(&shutdown).await;
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                next = activations.recv() => match next {
                    Some(task_id) => {
                        debug!(worker = %self.worker, task_id = %task_id, "activation received");
                        self.drain(&shutdown).await;
                    }
                    None => {
                        warn!(worker = %self.worker, "activation stream closed");
                        break;
                    }
                },
            }
        }

        beat.abort();
        info!(worker = %self.worker, "worker stopped");
        Ok(())
    }

    /// Pending を古い順に処理。無くなるか shutdown 要求で抜ける
    async fn drain(&self, shutdown: &watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            match self.claim_oldest().await {
                Ok(Some(task)) => self.process(task).await,
                Ok(None) => break,
                Err(e) => {
                    if e.kind() == ErrorKind::Infrastructure {
                        error!(worker = %self.worker, error = %e, "claim failed");
                    } else {
                        warn!(worker = %self.worker, error = %e, kind = ?e.kind(), "claim failed");
                    }
                    break;
                }
            }
        }
    }

    /// 最古の Pending を `Pending -> Processing` の CAS で claim。
    /// 間に他者が claim したものは飛ばす
    async fn claim_oldest(&self) -> ShuttleResult<Option<Task>> {
        let pending = self.store.list(Some(&self.worker), TaskState::Pending).await?;
        let depth = u32::try_from(pending.len()).unwrap_or(u32::MAX);
        self.status.queue_depth.store(depth, Ordering::Relaxed);

        for candidate in pending {
            match self
                .store
                .transition(candidate.id(), TaskState::Pending, TaskState::Processing)
                .await
            {
                Ok(task) => {
                    self.status
                        .queue_depth
                        .store(depth.saturating_sub(1), Ordering::Relaxed);
                    return Ok(Some(task));
                }
                Err(e @ (ShuttleError::StateConflict { .. } | ShuttleError::NotFound(_))) => {
                    debug!(worker = %self.worker, error = %e, "claim lost");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn process(&self, task: Task) {
        let task_id = task.id();
        self.status.set_current(Some(task_id));
        debug!(worker = %self.worker, task_id = %task_id, attempt = task.attempt(), "task claimed");

        let to = match self.handler.handle(&task).await {
            Ok(()) => TaskState::Completed,
            Err(e) => {
                warn!(worker = %self.worker, task_id = %task_id, error = %e, "task handler failed");
                TaskState::Failed
            }
        };
        self.status.set_current(None);

        match self.store.transition(task_id, TaskState::Processing, to).await {
            Ok(_) => info!(worker = %self.worker, task_id = %task_id, state = %to, "task finished"),
            Err(e) if e.is_conflict() => {
                // sweeper が先に回収した
                debug!(worker = %self.worker, task_id = %task_id, error = %e, "result discarded");
            }
            Err(e) => error!(worker = %self.worker, task_id = %task_id, error = %e, "could not record result"),
        }
    }
}

async fn beat_loop(
    monitor: Arc<HeartbeatMonitor>,
    worker: WorkerName,
    status: Arc<WorkerStatus>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                monitor.beat(&worker, status.current(), status.queue_depth.load(Ordering::Relaxed));
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Handle to a spawned [`WorkerLoop`].
/// - `request_shutdown` は新しい claim を止める（実行中の handler は止めない）
/// - `shutdown_and_join` で終了を待てる
pub struct WorkerHandle {
    worker: WorkerName,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn worker(&self) -> &WorkerName {
        &self.worker
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }

    /// Stop without waiting, as if the process died. Heartbeats stop too.
    pub fn abort(self) {
        self.join.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Payload;
    use crate::impls::{InMemoryTaskStore, PollChannel};
    use crate::ports::{NoopEventSink, SystemClock};

    struct Fixture {
        store: Arc<dyn TaskStore>,
        monitor: Arc<HeartbeatMonitor>,
        activation: Arc<dyn ActivationChannel>,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new(
            Arc::new(SystemClock),
            Arc::new(NoopEventSink),
        ));
        let monitor = Arc::new(HeartbeatMonitor::new(
            Arc::new(SystemClock),
            Arc::new(NoopEventSink),
        ));
        let activation: Arc<dyn ActivationChannel> =
            Arc::new(PollChannel::new(store.clone(), Duration::from_millis(10)));
        Fixture {
            store,
            monitor,
            activation,
        }
    }

    fn w() -> WorkerName {
        WorkerName::new("w1").unwrap()
    }

    fn worker(f: &Fixture, handler: impl TaskHandler + 'static) -> WorkerLoop {
        WorkerLoop::new(
            w(),
            f.store.clone(),
            f.activation.clone(),
            f.monitor.clone(),
            Arc::new(handler),
        )
        .with_heartbeat_interval(Duration::from_millis(10))
    }

    async fn wait_until_settled(store: &Arc<dyn TaskStore>, id: TaskId) -> Task {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let task = store.get(id).await.unwrap();
                if task.state().is_settled() {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn processes_tasks_and_records_outcome() {
        let f = fixture();
        let ok = f.store.create(&w(), Payload::from("ok")).await.unwrap();
        let bad = f.store.create(&w(), Payload::from("bad")).await.unwrap();

        let handle = worker(
            &f,
            handler_fn(|task: Task| async move {
                if task.payload().as_bytes() == b"bad" {
                    Err(HandlerError::new("rejected"))
                } else {
                    Ok(())
                }
            }),
        )
        .spawn();

        assert_eq!(wait_until_settled(&f.store, ok.id()).await.state(), TaskState::Completed);
        assert_eq!(wait_until_settled(&f.store, bad.id()).await.state(), TaskState::Failed);
        assert!(f.monitor.has_ever_beaten(&w()));
        handle.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn tasks_run_one_at_a_time_in_order() {
        let f = fixture();
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(f.store.create(&w(), Payload::from(format!("t{i}"))).await.unwrap().id());
        }

        let handle = worker(
            &f,
            handler_fn(|_task: Task| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(())
            }),
        )
        .spawn();

        let mut done = Vec::new();
        for id in &ids {
            done.push(wait_until_settled(&f.store, *id).await);
        }
        for pair in done.windows(2) {
            let prev_done = pair[0].completed_at().unwrap();
            let next_start = pair[1].started_at().unwrap();
            assert!(next_start >= prev_done);
        }
        handle.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn shutdown_stops_claiming() {
        let f = fixture();
        let handle = worker(&f, handler_fn(|_task: Task| async move { Ok(()) })).spawn();
        handle.shutdown_and_join().await;

        let task = f.store.create(&w(), Payload::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.store.get(task.id()).await.unwrap().state(), TaskState::Pending);
    }
}
