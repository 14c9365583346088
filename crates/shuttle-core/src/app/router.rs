//! ActivationRouter - worker ごとの TransportMode に応じて channel を振り分ける
//!
//! - `Poll` → PollChannel
//! - `Push` / `Hybrid` → HybridChannel（push は必ず safety-net 付き）
//!
//! 購読はモード変更に追従し、consumer 側の stream を切らずに
//! 内部で新しい channel に張り替える。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::domain::{ChannelHealth, ShuttleResult, TaskId, TransportMode, WorkerName};
use crate::ports::activation::SUBSCRIPTION_BUFFER;
use crate::ports::{ActivationChannel, Subscription};

const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(100);

pub struct ActivationRouter {
    poll: Arc<dyn ActivationChannel>,
    hybrid: Arc<dyn ActivationChannel>,
    default_mode: TransportMode,
    modes: Mutex<HashMap<WorkerName, watch::Sender<TransportMode>>>,
}

fn uses_push(mode: TransportMode) -> bool {
    !matches!(mode, TransportMode::Poll)
}

impl ActivationRouter {
    /// Workers start in `Poll` until a mode is set for them.
    pub fn new(poll: Arc<dyn ActivationChannel>, hybrid: Arc<dyn ActivationChannel>) -> Self {
        Self {
            poll,
            hybrid,
            default_mode: TransportMode::Poll,
            modes: Mutex::new(HashMap::new()),
        }
    }

    fn mode_sender(&self, worker: &WorkerName) -> watch::Sender<TransportMode> {
        self.modes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(worker.clone())
            .or_insert_with(|| watch::channel(self.default_mode).0)
            .clone()
    }

    pub fn mode(&self, worker: &WorkerName) -> TransportMode {
        self.modes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker)
            .map(|tx| *tx.borrow())
            .unwrap_or(self.default_mode)
    }

    /// `worker` を `mode` に切り替え。変わったときだけ以前のモードを返す
    pub fn set_mode(&self, worker: &WorkerName, mode: TransportMode) -> Option<TransportMode> {
        let tx = self.mode_sender(worker);
        let mut previous = None;
        tx.send_if_modified(|current| {
            if *current == mode {
                return false;
            }
            previous = Some(*current);
            *current = mode;
            true
        });
        previous
    }

    /// router が知っている全 worker の現在のモード
    pub fn modes(&self) -> BTreeMap<WorkerName, TransportMode> {
        self.modes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(worker, tx)| (worker.clone(), *tx.borrow()))
            .collect()
    }

    fn channel_for(&self, mode: TransportMode) -> &Arc<dyn ActivationChannel> {
        if uses_push(mode) { &self.hybrid } else { &self.poll }
    }
}

#[async_trait]
impl ActivationChannel for ActivationRouter {
    fn notify(&self, worker: &WorkerName, task_id: TaskId) {
        if uses_push(self.mode(worker)) {
            self.hybrid.notify(worker, task_id);
        }
    }

    async fn subscribe(&self, worker: &WorkerName) -> ShuttleResult<Subscription> {
        let mut mode_rx = self.mode_sender(worker).subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let poll = self.poll.clone();
        let hybrid = self.hybrid.clone();
        let worker = worker.clone();

        let driver = tokio::spawn(async move {
            loop {
                let mode = *mode_rx.borrow_and_update();
                let channel = if uses_push(mode) { &hybrid } else { &poll };
                let mut inner = match channel.subscribe(&worker).await {
                    Ok(inner) => inner,
                    Err(e) => {
                        warn!(worker = %worker, mode = %mode, error = %e, "activation subscribe failed");
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        continue;
                    }
                };
                debug!(worker = %worker, mode = %mode, "activation subscription routed");

                loop {
                    tokio::select! {
                        next = inner.recv() => match next {
                            Some(id) => {
                                if tx.send(id).await.is_err() {
                                    return;
                                }
                            }
                            None => {
                                warn!(worker = %worker, mode = %mode, "activation stream ended; resubscribing");
                                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                                break;
                            }
                        },
                        changed = mode_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            let next = *mode_rx.borrow();
                            if uses_push(next) != uses_push(mode) {
                                info!(worker = %worker, from = %mode, to = %next, "switching activation channel");
                                break;
                            }
                        }
                        _ = tx.closed() => return,
                    }
                }
            }
        });
        Ok(Subscription::new(rx, driver))
    }

    fn health(&self, worker: &WorkerName) -> ChannelHealth {
        self.channel_for(self.mode(worker)).health(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ulid::Ulid;

    /// Channel that announces a fixed id on every subscribe and counts notifies.
    struct Scripted {
        announce: TaskId,
        notified: AtomicUsize,
        subscribed: AtomicUsize,
    }

    impl Scripted {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                announce: TaskId::from_ulid(Ulid::new()),
                notified: AtomicUsize::new(0),
                subscribed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ActivationChannel for Scripted {
        fn notify(&self, _worker: &WorkerName, _task_id: TaskId) {
            self.notified.fetch_add(1, Ordering::SeqCst);
        }

        async fn subscribe(&self, _worker: &WorkerName) -> ShuttleResult<Subscription> {
            self.subscribed.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(4);
            let announce = self.announce;
            let driver = tokio::spawn(async move {
                let _ = tx.send(announce).await;
                tx.closed().await;
            });
            Ok(Subscription::new(rx, driver))
        }

        fn health(&self, _worker: &WorkerName) -> ChannelHealth {
            ChannelHealth::Healthy
        }
    }

    fn w() -> WorkerName {
        WorkerName::new("w1").unwrap()
    }

    #[test]
    fn set_mode_reports_previous_only_on_change() {
        let router = ActivationRouter::new(Scripted::new(), Scripted::new());
        assert_eq!(router.mode(&w()), TransportMode::Poll);
        assert_eq!(router.set_mode(&w(), TransportMode::Push), Some(TransportMode::Poll));
        assert_eq!(router.set_mode(&w(), TransportMode::Push), None);
        assert_eq!(router.modes().get(&w()), Some(&TransportMode::Push));
    }

    #[tokio::test]
    async fn notify_is_skipped_in_poll_mode() {
        let poll = Scripted::new();
        let hybrid = Scripted::new();
        let router = ActivationRouter::new(poll.clone(), hybrid.clone());
        let id = TaskId::from_ulid(Ulid::new());

        router.notify(&w(), id);
        assert_eq!(hybrid.notified.load(Ordering::SeqCst), 0);

        router.set_mode(&w(), TransportMode::Hybrid);
        router.notify(&w(), id);
        assert_eq!(hybrid.notified.load(Ordering::SeqCst), 1);
        assert_eq!(poll.notified.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn subscription_follows_mode_changes() {
        let poll = Scripted::new();
        let hybrid = Scripted::new();
        let router = ActivationRouter::new(poll.clone(), hybrid.clone());

        let mut sub = router.subscribe(&w()).await.unwrap();
        assert_eq!(sub.recv().await, Some(poll.announce));

        router.set_mode(&w(), TransportMode::Push);
        let got = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(hybrid.announce));

        // Push -> Hybrid は同じ channel なので張り替えない
        router.set_mode(&w(), TransportMode::Hybrid);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hybrid.subscribed.load(Ordering::SeqCst), 1);
    }
}
