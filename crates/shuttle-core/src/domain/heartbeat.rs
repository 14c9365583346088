//! Worker liveness record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::worker::WorkerName;

/// Last heartbeat received from a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker: WorkerName,
    pub last_seen_at: DateTime<Utc>,
    pub current_task: Option<TaskId>,
    /// Number of Pending tasks the worker saw in its queue.
    pub queue_depth: u32,
}

impl WorkerHeartbeat {
    /// `now - last_seen_at > timeout`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.last_seen_at) > timeout
    }
}

/// 永続化された heartbeat の一覧
///
/// `written_at` は書き出した側の時刻。別プロセスはこれより後の beat を知らない。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatSnapshot {
    pub written_at: DateTime<Utc>,
    pub heartbeats: Vec<WorkerHeartbeat>,
}

impl HeartbeatSnapshot {
    /// Time elapsed since the snapshot was written, zero if `now` is earlier.
    pub fn lag(&self, now: DateTime<Utc>) -> std::time::Duration {
        now.signed_duration_since(self.written_at)
            .to_std()
            .unwrap_or_default()
    }
}
