//! InMemoryPushTransport - プロセス内の pub/sub
//!
//! 本番では broker や filesystem watcher に置き換える想定。
//! `set_available(false)` で接続断を再現できます（購読中の receiver は閉じる）。

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{TaskId, WorkerName};
use crate::ports::activation::SUBSCRIPTION_BUFFER;
use crate::ports::{PushTransport, TransportError};

pub struct InMemoryPushTransport {
    available: AtomicBool,
    subscribers: Mutex<HashMap<WorkerName, Vec<mpsc::Sender<TaskId>>>>,
    delivered: AtomicU64,
}

impl InMemoryPushTransport {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            subscribers: Mutex::new(HashMap::new()),
            delivered: AtomicU64::new(0),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            // Dropping the senders ends every open subscription.
            self.subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of notifications handed to at least one subscriber.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(TransportError::Disconnected("in-memory transport offline".into()))
        }
    }
}

impl Default for InMemoryPushTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushTransport for InMemoryPushTransport {
    async fn publish(&self, worker: &WorkerName, task_id: TaskId) -> Result<(), TransportError> {
        self.check_available()?;

        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(senders) = subscribers.get_mut(worker) else {
            return Ok(());
        };
        senders.retain(|tx| !tx.is_closed());

        let mut delivered = false;
        for tx in senders.iter() {
            // A full subscriber loses this notification; its safety-net poll
            // picks the task up.
            delivered |= tx.try_send(task_id).is_ok();
        }
        if delivered {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn subscribe(&self, worker: &WorkerName) -> Result<mpsc::Receiver<TaskId>, TransportError> {
        self.check_available()?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(worker.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn w() -> WorkerName {
        WorkerName::new("w1").unwrap()
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_of_that_worker_only() {
        let transport = InMemoryPushTransport::new();
        let mut mine = transport.subscribe(&w()).await.unwrap();
        let mut other = transport
            .subscribe(&WorkerName::new("w2").unwrap())
            .await
            .unwrap();

        let id = TaskId::from_ulid(Ulid::new());
        transport.publish(&w(), id).await.unwrap();

        assert_eq!(mine.recv().await, Some(id));
        assert!(other.try_recv().is_err());
        assert_eq!(transport.delivered(), 1);
    }

    #[tokio::test]
    async fn outage_closes_subscriptions_and_rejects_calls() {
        let transport = InMemoryPushTransport::new();
        let mut rx = transport.subscribe(&w()).await.unwrap();

        transport.set_available(false);

        assert_eq!(rx.recv().await, None);
        assert!(transport.subscribe(&w()).await.is_err());
        assert!(transport
            .publish(&w(), TaskId::from_ulid(Ulid::new()))
            .await
            .is_err());

        transport.set_available(true);
        assert!(transport.subscribe(&w()).await.is_ok());
    }
}
