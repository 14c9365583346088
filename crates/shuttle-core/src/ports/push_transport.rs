//! PushTransport port - 外部の publish/subscribe 機構
//!
//! broker でも filesystem watcher でもよい（どれを使うかは範囲外）。
//! 配送は best-effort で、取りこぼしは poll 側が補います。

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::{ShuttleError, TaskId, WorkerName};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport disconnected: {0}")]
    Disconnected(String),

    #[error("publish timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// 購読側で transport を失ったときの内部シグナル
impl From<TransportError> for ShuttleError {
    fn from(err: TransportError) -> Self {
        ShuttleError::TransportDegraded(err.to_string())
    }
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn publish(&self, worker: &WorkerName, task_id: TaskId) -> Result<(), TransportError>;

    /// The receiver ends when the connection is lost.
    async fn subscribe(&self, worker: &WorkerName) -> Result<mpsc::Receiver<TaskId>, TransportError>;
}
