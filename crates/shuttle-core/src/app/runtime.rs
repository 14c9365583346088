//! Runtime - 組み立て済みの構成要素と背景ループ
//!
//! `start()` で OrphanSweeper と TransportSelector のループ、heartbeat snapshot
//! の書き出しループを起動し、`shutdown()` で止めて join する。worker は
//! `spawn_worker` で個別に起動し、返された WorkerHandle で止める。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::coordinator::Coordinator;
use super::heartbeat::HeartbeatMonitor;
use super::router::ActivationRouter;
use super::selector::TransportSelector;
use super::status::{StatusReport, TransportView};
use super::sweeper::{OrphanSweeper, SweepReport};
use super::worker_loop::{TaskHandler, WorkerHandle, WorkerLoop};
use crate::config::ShuttleConfig;
use crate::domain::{ShuttleResult, WorkerName};
use crate::impls::BroadcastEventSink;
use crate::ports::{ActivationChannel, Clock, PushTransport, TaskStore};

pub struct Runtime {
    pub(super) config: ShuttleConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) events: Arc<BroadcastEventSink>,
    pub(super) store: Arc<dyn TaskStore>,
    pub(super) monitor: Arc<HeartbeatMonitor>,
    pub(super) router: Arc<ActivationRouter>,
    pub(super) selector: Arc<TransportSelector>,
    pub(super) sweeper: Arc<OrphanSweeper>,
    pub(super) coordinator: Arc<Coordinator>,
    pub(super) push_transport: Arc<dyn PushTransport>,
    /// 起動時に読んだ heartbeat snapshot の書き出し時刻
    pub(super) snapshot_written_at: Option<DateTime<Utc>>,
    pub(super) shutdown_tx: watch::Sender<bool>,
    pub(super) loops: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// sweeper / selector / snapshot のループを起動。2 回目以降は no-op
    pub fn start(&mut self) {
        if !self.loops.is_empty() {
            return;
        }

        let sweeper = self.sweeper.clone();
        let shutdown = self.shutdown_tx.subscribe();
        self.loops
            .push(tokio::spawn(async move { sweeper.run(shutdown).await }));

        let selector = self.selector.clone();
        let events = self.events.subscribe();
        let shutdown = self.shutdown_tx.subscribe();
        self.loops
            .push(tokio::spawn(async move { selector.run(events, shutdown).await }));

        if let Some(path) = self.config.heartbeat_snapshot_path() {
            let monitor = self.monitor.clone();
            let interval = self.config.heartbeat.interval();
            let shutdown = self.shutdown_tx.subscribe();
            self.loops.push(tokio::spawn(async move {
                monitor.run_persist(path, interval, shutdown).await
            }));
        }

        info!("runtime started");
    }

    /// ループを止めて heartbeat snapshot を書き出す
    pub async fn shutdown(mut self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
        for handle in self.loops.drain(..) {
            let _ = handle.await;
        }
        if let Some(path) = self.config.heartbeat_snapshot_path() {
            if let Err(e) = self.monitor.persist(&path).await {
                warn!(path = %path.display(), error = %e, "heartbeat snapshot not persisted");
            }
        }
        info!("runtime stopped");
    }

    /// `worker` のキューを消費するリファレンス worker を起動
    pub fn spawn_worker(&self, worker: WorkerName, handler: Arc<dyn TaskHandler>) -> WorkerHandle {
        WorkerLoop::new(
            worker,
            self.store.clone(),
            self.router.clone(),
            self.monitor.clone(),
            handler,
        )
        .with_heartbeat_interval(self.config.heartbeat.interval())
        .spawn()
    }

    pub async fn status(&self) -> ShuttleResult<StatusReport> {
        StatusReport::collect(
            self.store.as_ref(),
            &self.monitor,
            Some(TransportView {
                router: &self.router,
                selector: &self.selector,
            }),
            self.clock.now(),
            self.config.sweeper.liveness_timeout(),
        )
        .await
    }

    /// heartbeat を持たないプロセスからの 1 回きりの sweep
    ///
    /// liveness は snapshot の書き出し時点で判定する（遅れの分だけ timeout を
    /// 広げる）。snapshot が無ければ誰が生きているか分からないので `None`。
    pub async fn sweep_from_snapshot(&self) -> ShuttleResult<Option<SweepReport>> {
        let Some(written_at) = self.snapshot_written_at else {
            return Ok(None);
        };
        let lag = (self.clock.now() - written_at).to_std().unwrap_or_default();
        let activation: Arc<dyn ActivationChannel> = self.router.clone();
        let sweeper = OrphanSweeper::new(
            self.store.clone(),
            self.monitor.clone(),
            activation,
            self.clock.clone(),
            self.config.sweeper.clone(),
        )
        .with_liveness_slack(lag);

        info!(lag = ?lag, "sweeping from heartbeat snapshot");
        sweeper.sweep_once().await.map(Some)
    }

    pub fn config(&self) -> &ShuttleConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    pub fn router(&self) -> &Arc<ActivationRouter> {
        &self.router
    }

    pub fn selector(&self) -> &Arc<TransportSelector> {
        &self.selector
    }

    pub fn sweeper(&self) -> &Arc<OrphanSweeper> {
        &self.sweeper
    }

    pub fn events(&self) -> &Arc<BroadcastEventSink> {
        &self.events
    }

    pub fn push_transport(&self) -> &Arc<dyn PushTransport> {
        &self.push_transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{RuntimeBuilder, handler_fn};
    use crate::domain::{Task, TaskState};
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use std::time::Duration;

    fn fast_config() -> ShuttleConfig {
        let mut config = ShuttleConfig::default();
        config.poll.interval_ms = 20;
        config.poll.allow_fast_poll = true;
        config.hybrid.safety_interval_ms = 200;
        config.heartbeat.interval_ms = 20;
        config.sweeper.interval_ms = 50;
        config.selector.evaluation_interval_ms = 50;
        config.coordinator.await_poll_interval_ms = 20;
        config
    }

    #[tokio::test]
    async fn end_to_end_create_and_await() {
        let mut runtime = RuntimeBuilder::new(fast_config()).build().await.unwrap();
        runtime.start();

        let worker = WorkerName::new("echo").unwrap();
        let handle = runtime.spawn_worker(
            worker.clone(),
            Arc::new(handler_fn(|_task: Task| async move { Ok(()) })),
        );

        let task = runtime
            .coordinator()
            .create_task(&worker, "hello".into())
            .await
            .unwrap();
        let done = runtime
            .coordinator()
            .await_result(task.id(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(done.state(), TaskState::Completed);

        let status = runtime.status().await.unwrap();
        assert_eq!(status.counts.completed, 1);
        assert!(status.workers.iter().any(|w| w.worker == worker && w.alive));

        handle.shutdown_and_join().await;
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_persists_heartbeats() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        config.store.root = Some(dir.path().to_path_buf());

        let mut runtime = RuntimeBuilder::new(config).build().await.unwrap();
        runtime.start();
        runtime
            .monitor()
            .beat(&WorkerName::new("w1").unwrap(), None, 0);
        runtime.shutdown().await;

        let snapshot = HeartbeatMonitor::load_snapshot(&dir.path().join("heartbeats.json"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.heartbeats.len(), 1);
    }

    fn durable(root: &std::path::Path) -> ShuttleConfig {
        let mut config = ShuttleConfig::default();
        config.store.root = Some(root.to_path_buf());
        config
    }

    async fn build_at(config: ShuttleConfig, clock: &FixedClock) -> Runtime {
        RuntimeBuilder::new(config)
            .with_clock(Arc::new(clock.clone()))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn lagging_snapshot_never_redispatches_a_beating_worker() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap());
        let worker = WorkerName::new("render").unwrap();

        // 実行中の runtime: 長い task を処理しつつ beat し続ける
        let server = build_at(durable(dir.path()), &clock).await;
        let task = server
            .coordinator()
            .create_task(&worker, "frame".into())
            .await
            .unwrap();
        server
            .store()
            .transition(task.id(), TaskState::Pending, TaskState::Processing)
            .await
            .unwrap();
        for _ in 0..66 {
            clock.advance(Duration::from_secs(10));
            server.monitor().beat(&worker, Some(task.id()), 0);
            server
                .monitor()
                .persist(&dir.path().join("heartbeats.json"))
                .await
                .unwrap();
        }
        // 最後の書き出しから 40 秒、beat は続いているが snapshot には載っていない
        for _ in 0..4 {
            clock.advance(Duration::from_secs(10));
            server.monitor().beat(&worker, Some(task.id()), 0);
        }
        assert!(server.monitor().is_alive(&worker, Duration::from_secs(30)));

        let cli = build_at(durable(dir.path()), &clock).await;
        let report = cli.sweep_from_snapshot().await.unwrap().unwrap();
        assert_eq!(report.redispatched, 0);
        assert_eq!(report.long_running, 1);
        let task = cli.store().get(task.id()).await.unwrap();
        assert_eq!(task.state(), TaskState::Processing);
        assert_eq!(task.attempt(), 0);
    }

    #[tokio::test]
    async fn snapshot_sweep_recovers_worker_dead_before_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap());
        let worker = WorkerName::new("render").unwrap();

        let server = build_at(durable(dir.path()), &clock).await;
        let task = server
            .coordinator()
            .create_task(&worker, "frame".into())
            .await
            .unwrap();
        server
            .store()
            .transition(task.id(), TaskState::Pending, TaskState::Processing)
            .await
            .unwrap();
        server.monitor().beat(&worker, Some(task.id()), 0);
        clock.advance(Duration::from_secs(11 * 60));
        server
            .monitor()
            .persist(&dir.path().join("heartbeats.json"))
            .await
            .unwrap();

        let cli = build_at(durable(dir.path()), &clock).await;
        let report = cli.sweep_from_snapshot().await.unwrap().unwrap();
        assert_eq!(report.redispatched, 1);
        let task = cli.store().get(task.id()).await.unwrap();
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.attempt(), 1);
    }

    #[tokio::test]
    async fn snapshot_sweep_needs_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RuntimeBuilder::new(durable(dir.path())).build().await.unwrap();
        assert!(runtime.sweep_from_snapshot().await.unwrap().is_none());
    }
}
