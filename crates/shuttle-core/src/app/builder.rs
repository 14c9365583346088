//! RuntimeBuilder - 設定からの組み立てとワイヤリング
//!
//! - 起動時に設定を検証（Fail-fast）
//! - `store.root` があれば FsTaskStore、無ければ InMemoryTaskStore
//! - heartbeat snapshot があれば読み込んで monitor を復元

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use super::coordinator::Coordinator;
use super::heartbeat::HeartbeatMonitor;
use super::router::ActivationRouter;
use super::runtime::Runtime;
use super::selector::TransportSelector;
use super::sweeper::OrphanSweeper;
use crate::config::{ConfigError, ShuttleConfig};
use crate::domain::{ShuttleError, WorkerName};
use crate::impls::{
    BroadcastEventSink, FsTaskStore, HybridChannel, InMemoryPushTransport, InMemoryTaskStore,
    PollChannel, PushChannel,
};
use crate::ports::{ActivationChannel, Clock, PushTransport, SystemClock, TaskStore};

const EVENT_BUFFER: usize = 1024;

/// Errors while assembling a [`Runtime`].
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open task store: {0}")]
    Store(#[from] ShuttleError),
}

/// ```ignore
/// let runtime = RuntimeBuilder::new(ShuttleConfig::load("shuttle.toml")?)
///     .build()
///     .await?;
/// ```
pub struct RuntimeBuilder {
    config: ShuttleConfig,
    clock: Option<Arc<dyn Clock>>,
    push_transport: Option<Arc<dyn PushTransport>>,
}

impl RuntimeBuilder {
    pub fn new(config: ShuttleConfig) -> Self {
        Self {
            config,
            clock: None,
            push_transport: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to an [`InMemoryPushTransport`].
    pub fn with_push_transport(mut self, transport: Arc<dyn PushTransport>) -> Self {
        self.push_transport = Some(transport);
        self
    }

    pub async fn build(self) -> Result<Runtime, BuildError> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = Arc::new(BroadcastEventSink::new(EVENT_BUFFER));

        let store: Arc<dyn TaskStore> = match &config.store.root {
            Some(root) => Arc::new(FsTaskStore::open(root, clock.clone(), events.clone()).await?),
            None => Arc::new(InMemoryTaskStore::new(clock.clone(), events.clone())),
        };

        let monitor = Arc::new(HeartbeatMonitor::new(clock.clone(), events.clone()));
        let mut snapshot_written_at = None;
        if let Some(path) = config.heartbeat_snapshot_path() {
            match HeartbeatMonitor::load_snapshot(&path).await {
                Ok(Some(snapshot)) => {
                    snapshot_written_at = Some(snapshot.written_at);
                    monitor.restore(snapshot.heartbeats);
                }
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "heartbeat snapshot ignored"),
            }
        }

        let push_transport = self
            .push_transport
            .unwrap_or_else(|| Arc::new(InMemoryPushTransport::new()));
        let push = Arc::new(PushChannel::new(
            push_transport.clone(),
            events.clone(),
            config.push.publish_timeout(),
            config.push.backoff(),
        ));
        let poll = Arc::new(PollChannel::new(store.clone(), config.poll.interval()));
        let hybrid = Arc::new(HybridChannel::new(
            push,
            store.clone(),
            config.poll.interval(),
            config.hybrid.safety_interval(),
        ));
        let router = Arc::new(ActivationRouter::new(poll, hybrid));

        let selector = Arc::new(TransportSelector::new(
            router.clone(),
            store.clone(),
            clock.clone(),
            config.selector.clone(),
        ));
        for (name, mode) in &config.selector.overrides {
            let worker = WorkerName::new(name.as_str()).map_err(|e| ConfigError::Invalid {
                field: "selector.overrides",
                reason: e.to_string(),
            })?;
            selector.set_override(&worker, *mode);
        }

        let activation: Arc<dyn ActivationChannel> = router.clone();
        let sweeper = Arc::new(OrphanSweeper::new(
            store.clone(),
            monitor.clone(),
            activation.clone(),
            clock.clone(),
            config.sweeper.clone(),
        ));

        let coordinator = Arc::new(
            Coordinator::new(
                store.clone(),
                activation,
                sweeper.clone(),
                clock.clone(),
                config.coordinator.await_poll_interval(),
            )
            .with_events(events.clone()),
        );

        info!(
            durable = config.store.root.is_some(),
            poll_interval = ?config.poll.interval(),
            "runtime assembled"
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Runtime {
            config,
            clock,
            events,
            store,
            monitor,
            router,
            selector,
            sweeper,
            coordinator,
            push_transport,
            snapshot_written_at,
            shutdown_tx,
            loops: Vec::new(),
        })
    }
}
