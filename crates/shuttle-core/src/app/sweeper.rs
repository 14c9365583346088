//! OrphanSweeper - 放置された task の回収
//!
//! 1. `Processing` の task で `started_at` から `stale_processing` を過ぎたもの
//!    - worker の heartbeat が生きていれば長時間実行とみなし触らない
//!    - 生きていなければ再配送（`attempt < max_attempts`）か dead letter
//! 2. `Pending` のまま `stale_queued` を過ぎ、worker の heartbeat が一度も
//!    無いものは dead letter（"no consuming worker"）
//!
//! すべての変更は TaskStore の CAS を通すので、直前に worker が完了させた
//! task とは競合しても StateConflict で no-op になる。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::heartbeat::HeartbeatMonitor;
use crate::config::SweeperConfig;
use crate::domain::{
    DeadLetterEntry, DeadLetterReason, ErrorKind, ShuttleError, ShuttleResult, Task, TaskId,
    TaskState, WorkerName,
};
use crate::ports::{ActivationChannel, Clock, TaskStore};

/// 1 回の sweep の結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub redispatched: usize,
    pub dead_lettered: usize,
    /// 先に他者が動かした（CAS 負け）か削除された task
    pub skipped_conflicts: usize,
    /// worker が生きているので触らなかった stale な `Processing` task
    pub long_running: usize,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        self.redispatched == 0 && self.dead_lettered == 0 && self.skipped_conflicts == 0
    }

    fn merge(&mut self, other: SweepReport) {
        self.redispatched += other.redispatched;
        self.dead_lettered += other.dead_lettered;
        self.skipped_conflicts += other.skipped_conflicts;
        self.long_running += other.long_running;
    }
}

pub struct OrphanSweeper {
    store: Arc<dyn TaskStore>,
    monitor: Arc<HeartbeatMonitor>,
    activation: Arc<dyn ActivationChannel>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
    liveness_slack: Duration,
}

impl OrphanSweeper {
    pub fn new(
        store: Arc<dyn TaskStore>,
        monitor: Arc<HeartbeatMonitor>,
        activation: Arc<dyn ActivationChannel>,
        clock: Arc<dyn Clock>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            store,
            monitor,
            activation,
            clock,
            config,
            liveness_slack: Duration::ZERO,
        }
    }

    /// liveness_timeout に `slack` を足して判定する
    ///
    /// heartbeat を snapshot 経由でしか知らないプロセス用。snapshot の遅れ分だけ
    /// 広げれば、書き出し時点で生きていた worker を死んだとはみなさない。
    pub fn with_liveness_slack(mut self, slack: Duration) -> Self {
        self.liveness_slack = slack;
        self
    }

    fn liveness_window(&self) -> Duration {
        self.config.liveness_timeout().saturating_add(self.liveness_slack)
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    pub async fn sweep_once(&self) -> ShuttleResult<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let stale_processing = to_chrono(self.config.stale_processing());
        for task in self.store.list(None, TaskState::Processing).await? {
            let started = task.started_at().unwrap_or_else(|| task.created_at());
            if now.signed_duration_since(started) <= stale_processing {
                continue;
            }
            if let Err(cause) = self.monitor.ensure_alive(task.worker(), self.liveness_window()) {
                debug!(task_id = %task.id(), cause = %cause, "recovering stale task");
                report.merge(self.recover(&task, now).await?);
            } else {
                debug!(worker = %task.worker(), task_id = %task.id(), "stale task but worker alive; leaving it");
                report.long_running += 1;
            }
        }

        let stale_queued = to_chrono(self.config.stale_queued());
        for task in self.store.list(None, TaskState::Pending).await? {
            if now.signed_duration_since(task.created_at()) <= stale_queued
                || self.monitor.has_ever_beaten(task.worker())
            {
                continue;
            }
            let result = dead_letter(
                self.store.as_ref(),
                task.id(),
                TaskState::Pending,
                DeadLetterReason::NoConsumingWorker,
                now,
            )
            .await;
            match absorb(result)? {
                Some(_) => report.dead_lettered += 1,
                None => report.skipped_conflicts += 1,
            }
        }

        if !report.is_quiet() {
            info!(
                redispatched = report.redispatched,
                dead_lettered = report.dead_lettered,
                skipped_conflicts = report.skipped_conflicts,
                long_running = report.long_running,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// `worker` の `Processing` task をすべて即座に回収（staleness も heartbeat も見ない）
    pub async fn recover_worker(&self, worker: &WorkerName) -> ShuttleResult<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();
        for task in self.store.list(Some(worker), TaskState::Processing).await? {
            report.merge(self.recover(&task, now).await?);
        }
        Ok(report)
    }

    /// 放置とみなした task を再配送、`max_attempts` を使い切っていれば dead letter
    async fn recover(&self, task: &Task, now: DateTime<Utc>) -> ShuttleResult<SweepReport> {
        let mut report = SweepReport::default();

        if task.attempt() < self.config.max_attempts {
            let result = self
                .store
                .transition(task.id(), TaskState::Processing, TaskState::Pending)
                .await;
            match absorb(result)? {
                Some(moved) => {
                    info!(
                        worker = %moved.worker(),
                        task_id = %moved.id(),
                        attempt = moved.attempt(),
                        "re-dispatched orphaned task"
                    );
                    self.activation.notify(moved.worker(), moved.id());
                    report.redispatched += 1;
                }
                None => report.skipped_conflicts += 1,
            }
        } else {
            let result = dead_letter(
                self.store.as_ref(),
                task.id(),
                TaskState::Processing,
                DeadLetterReason::WorkerUnresponsive,
                now,
            )
            .await;
            match absorb(result)? {
                Some(_) => report.dead_lettered += 1,
                None => report.skipped_conflicts += 1,
            }
        }
        Ok(report)
    }

    /// `interval` ごとに sweep。`shutdown` が `true` になったら終了
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.config.interval(), "orphan sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.sweep_once().await {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Infrastructure => {
                    error!(error = %e, "sweep failed");
                }
                Err(e) => warn!(error = %e, kind = ?e.kind(), "sweep aborted"),
            }
        }
        info!("orphan sweeper stopped");
    }
}

/// `from` から `DeadLettered` に遷移させてから entry を記録
pub(crate) async fn dead_letter(
    store: &dyn TaskStore,
    task_id: TaskId,
    from: TaskState,
    reason: DeadLetterReason,
    now: DateTime<Utc>,
) -> ShuttleResult<Task> {
    let task = store
        .transition(task_id, from, TaskState::DeadLettered)
        .await?;
    warn!(worker = %task.worker(), task_id = %task_id, reason = %reason, "task dead-lettered");
    store
        .record_dead_letter(DeadLetterEntry::new(task.clone(), reason, now))
        .await?;
    Ok(task)
}

/// 競合負けは `None`、それ以外はそのまま返す
fn absorb(result: ShuttleResult<Task>) -> ShuttleResult<Option<Task>> {
    match result {
        Ok(task) => Ok(Some(task)),
        Err(e @ (ShuttleError::StateConflict { .. } | ShuttleError::NotFound(_))) => {
            debug!(error = %e, "sweep skipped task");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
