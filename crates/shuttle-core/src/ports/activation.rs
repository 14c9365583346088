//! ActivationChannel port - 「タスクがある」ことを worker に知らせる
//!
//! 実装は 3 種類（impls）:
//! - PollChannel: TaskStore を定期的に list
//! - PushChannel: PushTransport 経由の通知
//! - HybridChannel: Push + 長周期の safety-net poll
//!
//! push はレイテンシ最適化であり、正しさの前提ではありません。

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::{ChannelHealth, ShuttleResult, TaskId, WorkerName};

#[async_trait]
pub trait ActivationChannel: Send + Sync {
    /// Best-effort and non-blocking; failures are logged, never returned.
    fn notify(&self, worker: &WorkerName, task_id: TaskId);

    async fn subscribe(&self, worker: &WorkerName) -> ShuttleResult<Subscription>;

    fn health(&self, worker: &WorkerName) -> ChannelHealth;
}

/// Stream of task ids announced for one worker.
///
/// Dropping the subscription stops the background task feeding it.
pub struct Subscription {
    rx: mpsc::Receiver<TaskId>,
    driver: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<TaskId>, driver: JoinHandle<()>) -> Self {
        Self {
            rx,
            driver: Some(driver),
        }
    }

    /// Subscription without a background driver (the sender side is owned
    /// elsewhere).
    pub fn from_receiver(rx: mpsc::Receiver<TaskId>) -> Self {
        Self { rx, driver: None }
    }

    /// Next announced id, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<TaskId> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Capacity of the per-subscription buffer.
pub(crate) const SUBSCRIPTION_BUFFER: usize = 256;
