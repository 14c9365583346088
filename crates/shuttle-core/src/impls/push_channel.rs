//! PushChannel - PushTransport 経由の activation
//!
//! - `notify` は spawn + timeout で送るだけ（呼び出し側をブロックしない）
//! - 購読は切断されると capped exponential backoff で再接続
//! - 切断中は Degraded を報告（watch と DomainEvent の両方）
//!
//! 単体では取りこぼしを回収しないので、worker に渡すときは
//! HybridChannel 経由で safety-net poll と組み合わせる。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::poll_channel::Announced;
use crate::domain::{
    BackoffPolicy, ChannelHealth, DomainEvent, ShuttleError, ShuttleResult, TaskId, WorkerName,
};
use crate::ports::activation::SUBSCRIPTION_BUFFER;
use crate::ports::{ActivationChannel, EventSink, PushTransport, Subscription, TransportError};

pub struct PushChannel {
    transport: Arc<dyn PushTransport>,
    events: Arc<dyn EventSink>,
    publish_timeout: Duration,
    backoff: BackoffPolicy,
    health: Mutex<HashMap<WorkerName, watch::Sender<ChannelHealth>>>,
}

impl PushChannel {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        events: Arc<dyn EventSink>,
        publish_timeout: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            transport,
            events,
            publish_timeout,
            backoff,
            health: Mutex::new(HashMap::new()),
        }
    }

    fn health_sender(&self, worker: &WorkerName) -> watch::Sender<ChannelHealth> {
        self.health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(worker.clone())
            .or_insert_with(|| watch::channel(ChannelHealth::Healthy).0)
            .clone()
    }

    /// Health updates for one worker's push subscription.
    pub fn health_watch(&self, worker: &WorkerName) -> watch::Receiver<ChannelHealth> {
        self.health_sender(worker).subscribe()
    }

    pub(crate) fn spawn_listener(
        &self,
        worker: WorkerName,
        tx: mpsc::Sender<TaskId>,
        announced: Option<Arc<Mutex<Announced>>>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        run_push_loop(PushLoop {
            transport: self.transport.clone(),
            events: self.events.clone(),
            backoff: self.backoff.clone(),
            health: self.health_sender(&worker),
            worker,
            tx,
            announced,
        })
    }
}

struct PushLoop {
    transport: Arc<dyn PushTransport>,
    events: Arc<dyn EventSink>,
    backoff: BackoffPolicy,
    health: watch::Sender<ChannelHealth>,
    worker: WorkerName,
    tx: mpsc::Sender<TaskId>,
    announced: Option<Arc<Mutex<Announced>>>,
}

impl PushLoop {
    fn degrade(&self, cause: ShuttleError) {
        self.set_health(ChannelHealth::Degraded, &cause.to_string());
    }

    fn set_health(&self, health: ChannelHealth, reason: &str) {
        let changed = self.health.send_if_modified(|current| {
            let changed = *current != health;
            *current = health;
            changed
        });
        if !changed {
            return;
        }
        match health {
            ChannelHealth::Degraded => {
                warn!(worker = %self.worker, reason, "push subscription degraded");
                self.events.emit(DomainEvent::ChannelDegraded {
                    worker: self.worker.clone(),
                    reason: reason.to_string(),
                });
            }
            ChannelHealth::Healthy => {
                info!(worker = %self.worker, "push subscription recovered");
                self.events.emit(DomainEvent::ChannelRecovered {
                    worker: self.worker.clone(),
                });
            }
        }
    }
}

async fn run_push_loop(state: PushLoop) {
    let mut failures: u32 = 0;
    loop {
        match state.transport.subscribe(&state.worker).await {
            Ok(mut rx) => {
                failures = 0;
                state.set_health(ChannelHealth::Healthy, "subscribed");
                debug!(worker = %state.worker, "push subscription open");
                loop {
                    tokio::select! {
                        next = rx.recv() => match next {
                            Some(id) => {
                                let fresh = state.announced.as_ref().is_none_or(|announced| {
                                    announced.lock().unwrap_or_else(|e| e.into_inner()).on_push(id)
                                });
                                if fresh && state.tx.send(id).await.is_err() {
                                    return;
                                }
                            }
                            None => break,
                        },
                        _ = state.tx.closed() => return,
                    }
                }
                state.degrade(TransportError::Disconnected("push stream closed".into()).into());
            }
            Err(e) => state.degrade(e.into()),
        }

        failures = failures.saturating_add(1);
        let delay = state.backoff.next_delay(failures);
        debug!(worker = %state.worker, failures, delay = ?delay, "push reconnect scheduled");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = state.tx.closed() => return,
        }
    }
}

async fn publish_within(
    transport: &dyn PushTransport,
    worker: &WorkerName,
    task_id: TaskId,
    timeout: Duration,
) -> Result<(), TransportError> {
    tokio::time::timeout(timeout, transport.publish(worker, task_id))
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
}

#[async_trait]
impl ActivationChannel for PushChannel {
    fn notify(&self, worker: &WorkerName, task_id: TaskId) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(worker = %worker, task_id = %task_id, "no runtime for push notify; dropped");
            return;
        };
        let transport = self.transport.clone();
        let worker = worker.clone();
        let timeout = self.publish_timeout;
        handle.spawn(async move {
            match publish_within(transport.as_ref(), &worker, task_id, timeout).await {
                Ok(()) => debug!(worker = %worker, task_id = %task_id, "push notify sent"),
                Err(e) => {
                    warn!(worker = %worker, task_id = %task_id, error = %e, "push notify failed")
                }
            }
        });
    }

    async fn subscribe(&self, worker: &WorkerName) -> ShuttleResult<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let driver = tokio::spawn(self.spawn_listener(worker.clone(), tx, None));
        Ok(Subscription::new(rx, driver))
    }

    fn health(&self, worker: &WorkerName) -> ChannelHealth {
        *self.health_sender(worker).borrow()
    }
}
