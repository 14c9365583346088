//! Status - operator 向けのスナップショット
//!
//! 実行中の runtime からも、ディスク上の store + heartbeat snapshot だけからも
//! 作れる（後者は transport 情報なし）。

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::heartbeat::HeartbeatMonitor;
use super::router::ActivationRouter;
use super::selector::TransportSelector;
use crate::domain::{
    ChannelHealth, DeadLetterEntry, ShuttleResult, TransportMetrics, TransportMode,
    WorkerHeartbeat, WorkerName,
};
use crate::ports::{ActivationChannel, TaskCounts, TaskStore};

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub counts: TaskCounts,
    pub workers: Vec<WorkerView>,
    pub heartbeats: Vec<WorkerHeartbeat>,
    pub dead_letters: Vec<DeadLetterEntry>,
}

/// One worker as seen by the heartbeat monitor and the transport layer.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub worker: WorkerName,
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<TransportMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned_mode: Option<TransportMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<ChannelHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TransportMetrics>,
}

/// Router and selector of a running runtime.
pub struct TransportView<'a> {
    pub router: &'a ActivationRouter,
    pub selector: &'a TransportSelector,
}

impl StatusReport {
    pub async fn collect(
        store: &dyn TaskStore,
        monitor: &HeartbeatMonitor,
        transport: Option<TransportView<'_>>,
        now: DateTime<Utc>,
        liveness_timeout: Duration,
    ) -> ShuttleResult<Self> {
        let counts = store.counts().await?;
        let dead_letters = store.dead_letters().await?;
        let heartbeats = monitor.snapshot();

        let mut workers: BTreeMap<WorkerName, WorkerView> = BTreeMap::new();
        for beat in &heartbeats {
            workers.insert(
                beat.worker.clone(),
                WorkerView {
                    worker: beat.worker.clone(),
                    alive: monitor.is_alive(&beat.worker, liveness_timeout),
                    last_seen_at: Some(beat.last_seen_at),
                    mode: None,
                    pinned_mode: None,
                    health: None,
                    metrics: None,
                },
            );
        }

        if let Some(view) = transport {
            for (worker, mode) in view.router.modes() {
                let entry = workers.entry(worker.clone()).or_insert_with(|| WorkerView {
                    worker: worker.clone(),
                    alive: false,
                    last_seen_at: None,
                    mode: None,
                    pinned_mode: None,
                    health: None,
                    metrics: None,
                });
                entry.mode = Some(mode);
                entry.pinned_mode = view.selector.override_for(&worker);
                entry.health = Some(view.router.health(&worker));
                entry.metrics = Some(view.selector.metrics(&worker));
            }
        }

        Ok(Self {
            generated_at: now,
            counts,
            workers: workers.into_values().collect(),
            heartbeats,
            dead_letters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Payload;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{NoopEventSink, SystemClock};
    use std::sync::Arc;

    #[tokio::test]
    async fn report_without_transport_lists_heartbeats() {
        let store = InMemoryTaskStore::new(Arc::new(SystemClock), Arc::new(NoopEventSink));
        let monitor = HeartbeatMonitor::new(Arc::new(SystemClock), Arc::new(NoopEventSink));
        let worker = WorkerName::new("w1").unwrap();
        store.create(&worker, Payload::from("x")).await.unwrap();
        monitor.beat(&worker, None, 1);

        let report = StatusReport::collect(
            &store,
            &monitor,
            None,
            chrono::Utc::now(),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        assert_eq!(report.counts.pending, 1);
        assert_eq!(report.workers.len(), 1);
        assert!(report.workers[0].alive);
        assert!(report.workers[0].mode.is_none());

        let json = serde_json::to_value(&report).unwrap();
        assert!(json["workers"][0].get("mode").is_none());
    }
}
