//! EventSink port - ドメインイベントの発行
//!
//! - NoopEventSink: 何もしない
//! - BroadcastEventSink（impls）: tokio broadcast で購読者に配る

use crate::domain::DomainEvent;

/// Emitting must never block or fail the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: DomainEvent) {}
}
