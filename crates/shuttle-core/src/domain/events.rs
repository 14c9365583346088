//! Events - ドメインイベント
//!
//! TaskStore と ActivationChannel が発行し、TransportSelector と
//! Coordinator（完了待ち）が購読します。

use chrono::{DateTime, Utc};

use super::ids::TaskId;
use super::state::TaskState;
use super::worker::WorkerName;

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    TaskCreated {
        task_id: TaskId,
        worker: WorkerName,
        at: DateTime<Utc>,
    },
    TaskTransitioned {
        task_id: TaskId,
        worker: WorkerName,
        from: TaskState,
        to: TaskState,
        at: DateTime<Utc>,
    },
    QueueDepthReported {
        worker: WorkerName,
        depth: u32,
    },
    ChannelDegraded {
        worker: WorkerName,
        reason: String,
    },
    ChannelRecovered {
        worker: WorkerName,
    },
}

impl DomainEvent {
    pub fn worker(&self) -> &WorkerName {
        match self {
            DomainEvent::TaskCreated { worker, .. }
            | DomainEvent::TaskTransitioned { worker, .. }
            | DomainEvent::QueueDepthReported { worker, .. }
            | DomainEvent::ChannelDegraded { worker, .. }
            | DomainEvent::ChannelRecovered { worker } => worker,
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            DomainEvent::TaskCreated { task_id, .. }
            | DomainEvent::TaskTransitioned { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}
