//! HybridChannel - push + safety-net poll
//!
//! push が正常なら poll は `safety_interval`（長め）で回るだけ。
//! push が Degraded になった時点で poll を `poll_interval` に縮め、
//! 復旧したら元に戻す。どちらの経路で届いた id も 1 回だけ流す。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::info;

use super::poll_channel::{Announced, run_poll_loop};
use super::push_channel::PushChannel;
use crate::domain::{ChannelHealth, ShuttleResult, TaskId, WorkerName};
use crate::ports::activation::SUBSCRIPTION_BUFFER;
use crate::ports::{ActivationChannel, Subscription, TaskStore};

pub struct HybridChannel {
    push: Arc<PushChannel>,
    store: Arc<dyn TaskStore>,
    poll_interval: Duration,
    safety_interval: Duration,
}

impl HybridChannel {
    pub fn new(
        push: Arc<PushChannel>,
        store: Arc<dyn TaskStore>,
        poll_interval: Duration,
        safety_interval: Duration,
    ) -> Self {
        Self {
            push,
            store,
            poll_interval,
            safety_interval,
        }
    }

    /// Safety-net period for the given push health.
    pub fn interval_for(&self, health: ChannelHealth) -> Duration {
        match health {
            ChannelHealth::Healthy => self.safety_interval,
            ChannelHealth::Degraded => self.poll_interval,
        }
    }
}

#[async_trait]
impl ActivationChannel for HybridChannel {
    fn notify(&self, worker: &WorkerName, task_id: TaskId) {
        self.push.notify(worker, task_id);
    }

    async fn subscribe(&self, worker: &WorkerName) -> ShuttleResult<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let announced: Arc<Mutex<Announced>> = Arc::default();

        let mut health = self.push.health_watch(worker);
        let (interval_tx, interval_rx) =
            watch::channel(self.interval_for(*health.borrow_and_update()));

        let push_side = self
            .push
            .spawn_listener(worker.clone(), tx.clone(), Some(announced.clone()));
        let poll_side = run_poll_loop(
            self.store.clone(),
            worker.clone(),
            interval_rx,
            tx.clone(),
            announced,
        );

        let (poll_interval, safety_interval) = (self.poll_interval, self.safety_interval);
        let follower_worker = worker.clone();
        let follow_health = async move {
            loop {
                tokio::select! {
                    changed = health.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let interval = match *health.borrow_and_update() {
                            ChannelHealth::Healthy => safety_interval,
                            ChannelHealth::Degraded => poll_interval,
                        };
                        info!(worker = %follower_worker, interval = ?interval, "safety-net poll interval adjusted");
                        interval_tx.send_replace(interval);
                    }
                    _ = tx.closed() => return,
                }
            }
        };

        let driver = tokio::spawn(async move {
            tokio::select! {
                _ = push_side => {}
                _ = poll_side => {}
                _ = follow_health => {}
            }
        });
        Ok(Subscription::new(rx, driver))
    }

    fn health(&self, worker: &WorkerName) -> ChannelHealth {
        self.push.health(worker)
    }
}
