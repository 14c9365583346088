//! BroadcastEventSink - tokio broadcast でイベントを配る
//!
//! 購読者がいない・遅れている場合もイベント発行側はブロックしません
//! （遅れた購読者は `Lagged` を受け取る）。

use tokio::sync::broadcast;

use crate::domain::DomainEvent;
use crate::ports::EventSink;

#[derive(Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<DomainEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: DomainEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}
