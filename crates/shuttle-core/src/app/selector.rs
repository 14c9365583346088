//! TransportSelector - worker ごとに Poll / Push を選ぶ
//!
//! DomainEvent から rolling window の TransportMetrics を作り、
//! 定期的に `decide` して ActivationRouter に反映する。
//! 手動 override は自動切り替えより常に優先。

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::router::ActivationRouter;
use crate::config::SelectorConfig;
use crate::domain::{DomainEvent, TaskId, TaskState, TransportMetrics, TransportMode, WorkerName};
use crate::ports::{Clock, TaskStore};

/// A mode switch applied by [`TransportSelector::evaluate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeChange {
    pub worker: WorkerName,
    pub from: TransportMode,
    pub to: TransportMode,
    pub metrics: TransportMetrics,
    pub overridden: bool,
}

#[derive(Debug, Default)]
struct WorkerWindow {
    /// (claimed at, ms from pending to claim)
    latencies: VecDeque<(DateTime<Utc>, f64)>,
    creations: VecDeque<DateTime<Utc>>,
    reported_depth: u32,
    stored_depth: u32,
}

impl WorkerWindow {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self.latencies.front().is_some_and(|(at, _)| *at < cutoff) {
            self.latencies.pop_front();
        }
        while self.creations.front().is_some_and(|at| *at < cutoff) {
            self.creations.pop_front();
        }
    }

    fn metrics(&self, window_minutes: f64) -> TransportMetrics {
        let mean_activation_latency_ms = if self.latencies.is_empty() {
            0.0
        } else {
            self.latencies.iter().map(|(_, ms)| ms).sum::<f64>() / self.latencies.len() as f64
        };
        TransportMetrics {
            mean_activation_latency_ms,
            tasks_per_minute: self.creations.len() as f64 / window_minutes,
            current_queue_depth: self.reported_depth.max(self.stored_depth),
        }
    }
}

#[derive(Debug, Default)]
struct SelectorState {
    windows: HashMap<WorkerName, WorkerWindow>,
    /// When each task last became `Pending`.
    pending_since: HashMap<TaskId, DateTime<Utc>>,
    overrides: HashMap<WorkerName, TransportMode>,
}

pub struct TransportSelector {
    router: Arc<ActivationRouter>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    config: SelectorConfig,
    state: Mutex<SelectorState>,
}

impl TransportSelector {
    pub fn new(
        router: Arc<ActivationRouter>,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            router,
            store,
            clock,
            config,
            state: Mutex::new(SelectorState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SelectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn window_minutes(&self) -> f64 {
        (self.config.window().as_secs_f64() / 60.0).max(f64::EPSILON)
    }

    fn cutoff(&self) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.config.window()).unwrap_or(chrono::Duration::MAX);
        self.clock
            .now()
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn observe(&self, event: &DomainEvent) {
        let mut state = self.lock();
        match event {
            DomainEvent::TaskCreated { task_id, worker, at } => {
                state.pending_since.insert(*task_id, *at);
                state
                    .windows
                    .entry(worker.clone())
                    .or_default()
                    .creations
                    .push_back(*at);
            }
            DomainEvent::TaskTransitioned {
                task_id,
                worker,
                to,
                at,
                ..
            } => match to {
                TaskState::Pending => {
                    state.pending_since.insert(*task_id, *at);
                }
                TaskState::Processing => {
                    if let Some(since) = state.pending_since.remove(task_id) {
                        let ms = at.signed_duration_since(since).num_milliseconds().max(0) as f64;
                        state
                            .windows
                            .entry(worker.clone())
                            .or_default()
                            .latencies
                            .push_back((*at, ms));
                    }
                }
                _ => {
                    state.pending_since.remove(task_id);
                }
            },
            DomainEvent::QueueDepthReported { worker, depth } => {
                state.windows.entry(worker.clone()).or_default().reported_depth = *depth;
            }
            DomainEvent::ChannelDegraded { worker, reason } => {
                if self.router.mode(worker) == TransportMode::Push {
                    // safety-net poll が回収するのでモードは変えない
                    info!(worker = %worker, reason = %reason, "push degraded; safety-net poll covers it");
                }
            }
            DomainEvent::ChannelRecovered { worker } => {
                debug!(worker = %worker, "push recovered");
            }
        }
    }

    /// `worker` の rolling window 上の metrics
    pub fn metrics(&self, worker: &WorkerName) -> TransportMetrics {
        let cutoff = self.cutoff();
        let minutes = self.window_minutes();
        let mut state = self.lock();
        match state.windows.get_mut(worker) {
            Some(window) => {
                window.prune(cutoff);
                window.metrics(minutes)
            }
            None => TransportMetrics::default(),
        }
    }

    /// 閾値ルール: latency / rate / depth のどれかが閾値を超えたら `Push`、
    /// それ以外は `Poll`
    pub fn decide(&self, metrics: &TransportMetrics) -> TransportMode {
        if metrics.mean_activation_latency_ms > self.config.latency_threshold_ms
            || metrics.tasks_per_minute > self.config.rate_threshold_per_min
            || metrics.current_queue_depth > self.config.depth_threshold
        {
            TransportMode::Push
        } else {
            TransportMode::Poll
        }
    }

    /// [`clear_override`](Self::clear_override) まで `worker` を `mode` に固定
    pub fn set_override(&self, worker: &WorkerName, mode: TransportMode) {
        self.lock().overrides.insert(worker.clone(), mode);
        let previous = self.router.set_mode(worker, mode);
        info!(worker = %worker, mode = %mode, previous = ?previous, "transport override set");
    }

    /// Returns the override that was removed, if any.
    pub fn clear_override(&self, worker: &WorkerName) -> Option<TransportMode> {
        let removed = self.lock().overrides.remove(worker);
        if removed.is_some() {
            info!(worker = %worker, "transport override cleared");
        }
        removed
    }

    pub fn override_for(&self, worker: &WorkerName) -> Option<TransportMode> {
        self.lock().overrides.get(worker).copied()
    }

    /// 既知の全 worker のモードを決めて router に反映
    pub async fn evaluate(&self) -> Vec<ModeChange> {
        match self.store.list(None, TaskState::Pending).await {
            Ok(pending) => {
                let mut depths: HashMap<WorkerName, u32> = HashMap::new();
                for task in &pending {
                    *depths.entry(task.worker().clone()).or_default() += 1;
                }
                let mut state = self.lock();
                for (worker, window) in state.windows.iter_mut() {
                    window.stored_depth = depths.remove(worker).unwrap_or(0);
                }
                for (worker, depth) in depths {
                    state.windows.entry(worker).or_default().stored_depth = depth;
                }
            }
            Err(e) => error!(error = %e, "selector could not read pending tasks"),
        }

        let workers: BTreeSet<WorkerName> = {
            let state = self.lock();
            state
                .windows
                .keys()
                .chain(state.overrides.keys())
                .cloned()
                .chain(self.router.modes().into_keys())
                .collect()
        };

        let mut changes = Vec::new();
        for worker in workers {
            let metrics = self.metrics(&worker);
            let pinned = self.override_for(&worker);
            let mode = pinned.unwrap_or_else(|| self.decide(&metrics));
            if let Some(from) = self.router.set_mode(&worker, mode) {
                info!(
                    worker = %worker,
                    from = %from,
                    to = %mode,
                    latency_ms = metrics.mean_activation_latency_ms,
                    tasks_per_minute = metrics.tasks_per_minute,
                    queue_depth = metrics.current_queue_depth,
                    "transport mode changed"
                );
                changes.push(ModeChange {
                    worker,
                    from,
                    to: mode,
                    metrics,
                    overridden: pinned.is_some(),
                });
            }
        }
        changes
    }

    /// `events` を消費しつつ `evaluation_interval` ごとに評価。
    /// `shutdown` が `true` になったら終了
    pub async fn run(
        &self,
        events: broadcast::Receiver<DomainEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut events = Some(events);
        let mut ticker = tokio::time::interval(self.config.evaluation_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.config.evaluation_interval(), "transport selector started");

        loop {
            tokio::select! {
                event = recv_event(&mut events) => match event {
                    Ok(event) => self.observe(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "selector lagged behind the event stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("event stream closed; selector keeps evaluating");
                        events = None;
                    }
                },
                _ = ticker.tick() => {
                    self.evaluate().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("transport selector stopped");
    }
}

async fn recv_event(
    events: &mut Option<broadcast::Receiver<DomainEvent>>,
) -> Result<DomainEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Payload;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{ActivationChannel, FixedClock, NoopEventSink, Subscription};
    use chrono::TimeZone;
    use rstest::rstest;
    use std::time::Duration;
    use ulid::Ulid;

    struct Silent;

    #[async_trait::async_trait]
    impl ActivationChannel for Silent {
        fn notify(&self, _worker: &WorkerName, _task_id: TaskId) {}

        async fn subscribe(&self, _worker: &WorkerName) -> crate::domain::ShuttleResult<Subscription> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(Subscription::from_receiver(rx))
        }

        fn health(&self, _worker: &WorkerName) -> crate::domain::ChannelHealth {
            crate::domain::ChannelHealth::Healthy
        }
    }

    fn w() -> WorkerName {
        WorkerName::new("w1").unwrap()
    }

    fn fixture() -> (TransportSelector, Arc<dyn TaskStore>, FixedClock) {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap());
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new(
            Arc::new(clock.clone()),
            Arc::new(NoopEventSink),
        ));
        let router = Arc::new(ActivationRouter::new(Arc::new(Silent), Arc::new(Silent)));
        let selector = TransportSelector::new(
            router,
            store.clone(),
            Arc::new(clock.clone()),
            SelectorConfig::default(),
        );
        (selector, store, clock)
    }

    fn metrics(latency: f64, rate: f64, depth: u32) -> TransportMetrics {
        TransportMetrics {
            mean_activation_latency_ms: latency,
            tasks_per_minute: rate,
            current_queue_depth: depth,
        }
    }

    #[rstest]
    #[case::idle(metrics(0.0, 0.0, 0), TransportMode::Poll)]
    #[case::at_thresholds(metrics(500.0, 10.0, 5), TransportMode::Poll)]
    #[case::slow(metrics(501.0, 0.0, 0), TransportMode::Push)]
    #[case::busy(metrics(10.0, 10.5, 0), TransportMode::Push)]
    #[case::backlog(metrics(10.0, 1.0, 6), TransportMode::Push)]
    fn decision_matrix(#[case] m: TransportMetrics, #[case] expected: TransportMode) {
        let (selector, _, _) = fixture();
        assert_eq!(selector.decide(&m), expected);
    }

    #[test]
    fn latency_is_measured_from_pending_to_claim() {
        let (selector, _, clock) = fixture();
        let id = TaskId::from_ulid(Ulid::new());
        let t0 = clock.now();

        selector.observe(&DomainEvent::TaskCreated {
            task_id: id,
            worker: w(),
            at: t0,
        });
        selector.observe(&DomainEvent::TaskTransitioned {
            task_id: id,
            worker: w(),
            from: TaskState::Pending,
            to: TaskState::Processing,
            at: t0 + chrono::Duration::milliseconds(800),
        });

        let m = selector.metrics(&w());
        assert_eq!(m.mean_activation_latency_ms, 800.0);
        assert_eq!(m.tasks_per_minute, 1.0 / 5.0);
    }

    #[test]
    fn old_samples_leave_the_window() {
        let (selector, _, clock) = fixture();
        for _ in 0..20 {
            selector.observe(&DomainEvent::TaskCreated {
                task_id: TaskId::from_ulid(Ulid::new()),
                worker: w(),
                at: clock.now(),
            });
        }
        assert_eq!(selector.metrics(&w()).tasks_per_minute, 4.0);

        clock.advance(Duration::from_secs(6 * 60));
        assert_eq!(selector.metrics(&w()).tasks_per_minute, 0.0);
    }

    #[tokio::test]
    async fn backlog_switches_to_push_and_back() {
        let (selector, store, _) = fixture();
        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(store.create(&w(), Payload::from(format!("{i}"))).await.unwrap().id());
        }

        let changes = selector.evaluate().await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, TransportMode::Push);
        assert_eq!(changes[0].metrics.current_queue_depth, 6);

        for id in ids {
            store
                .transition(id, TaskState::Pending, TaskState::Processing)
                .await
                .unwrap();
        }
        let changes = selector.evaluate().await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, TransportMode::Poll);
    }

    #[tokio::test]
    async fn override_freezes_automatic_switching() {
        let (selector, store, _) = fixture();
        selector.set_override(&w(), TransportMode::Hybrid);
        for _ in 0..6 {
            store.create(&w(), Payload::default()).await.unwrap();
        }

        assert!(selector.evaluate().await.is_empty());
        assert_eq!(selector.router.mode(&w()), TransportMode::Hybrid);

        assert_eq!(selector.clear_override(&w()), Some(TransportMode::Hybrid));
        let changes = selector.evaluate().await;
        assert_eq!(changes[0].to, TransportMode::Push);
        assert!(!changes[0].overridden);
    }

    #[test]
    fn reported_depth_counts() {
        let (selector, _, _) = fixture();
        selector.observe(&DomainEvent::QueueDepthReported {
            worker: w(),
            depth: 9,
        });
        assert_eq!(selector.metrics(&w()).current_queue_depth, 9);
    }
}
