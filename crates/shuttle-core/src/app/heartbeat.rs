//! HeartbeatMonitor - worker の生存記録
//!
//! beat が無いことはエラーではなくデータ。OrphanSweeper はこれを
//! 「worker が落ちているかもしれない」と解釈する。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::domain::{
    DomainEvent, HeartbeatSnapshot, ShuttleError, ShuttleResult, TaskId, WorkerHeartbeat,
    WorkerName,
};
use crate::impls::atomic_file::{read_json, write_json_atomic};
use crate::ports::{Clock, EventSink};

pub struct HeartbeatMonitor {
    beats: Mutex<HashMap<WorkerName, WorkerHeartbeat>>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl HeartbeatMonitor {
    pub fn new(clock: Arc<dyn Clock>, events: Arc<dyn EventSink>) -> Self {
        Self {
            beats: Mutex::new(HashMap::new()),
            clock,
            events,
        }
    }

    /// worker の heartbeat を upsert（時刻は clock から）
    pub fn beat(&self, worker: &WorkerName, current_task: Option<TaskId>, queue_depth: u32) {
        let heartbeat = WorkerHeartbeat {
            worker: worker.clone(),
            last_seen_at: self.clock.now(),
            current_task,
            queue_depth,
        };
        let first = self
            .beats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(worker.clone(), heartbeat)
            .is_none();

        if first {
            info!(worker = %worker, "first heartbeat");
        }
        self.events.emit(DomainEvent::QueueDepthReported {
            worker: worker.clone(),
            depth: queue_depth,
        });
    }

    /// `now - last_seen_at <= timeout`。未知の worker は生きていない扱い
    pub fn is_alive(&self, worker: &WorkerName, timeout: Duration) -> bool {
        let now = self.clock.now();
        self.beats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(worker)
            .is_some_and(|beat| !beat.is_stale(now, timeout))
    }

    /// `is_alive` のエラー版。生きていなければ `WorkerUnresponsive`
    pub fn ensure_alive(&self, worker: &WorkerName, timeout: Duration) -> ShuttleResult<()> {
        if self.is_alive(worker, timeout) {
            Ok(())
        } else {
            Err(ShuttleError::WorkerUnresponsive {
                worker: worker.to_string(),
            })
        }
    }

    pub fn has_ever_beaten(&self, worker: &WorkerName) -> bool {
        self.beats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(worker)
    }

    /// 既知の heartbeat 全件（worker 名順）
    pub fn snapshot(&self) -> Vec<WorkerHeartbeat> {
        let mut beats: Vec<WorkerHeartbeat> = self
            .beats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        beats.sort_by(|a, b| a.worker.cmp(&b.worker));
        beats
    }

    /// `snapshot` のうち手元より新しい beat だけ取り込む
    pub fn restore(&self, snapshot: Vec<WorkerHeartbeat>) {
        let mut beats = self.beats.lock().unwrap_or_else(|e| e.into_inner());
        for beat in snapshot {
            match beats.get(&beat.worker) {
                Some(known) if known.last_seen_at >= beat.last_seen_at => {}
                _ => {
                    beats.insert(beat.worker.clone(), beat);
                }
            }
        }
    }

    /// snapshot を `written_at` 付きで書き出す（staging file + rename）
    pub async fn persist(&self, path: &Path) -> ShuttleResult<()> {
        let snapshot = HeartbeatSnapshot {
            written_at: self.clock.now(),
            heartbeats: self.snapshot(),
        };
        let target = path.to_path_buf();
        let staging = target
            .parent()
            .map(|dir| dir.join(".tmp"))
            .unwrap_or_else(|| Path::new(".tmp").to_path_buf());
        let count = snapshot.heartbeats.len();

        tokio::task::spawn_blocking(move || write_json_atomic(&staging, &target, &snapshot))
            .await
            .map_err(|e| ShuttleError::store(format!("heartbeat persist task failed: {e}")))??;
        debug!(path = %path.display(), workers = count, "heartbeat snapshot persisted");
        Ok(())
    }

    /// [`persist`](Self::persist) が書いた snapshot を読む。ファイルが無ければ `None`
    pub async fn load_snapshot(path: &Path) -> ShuttleResult<Option<HeartbeatSnapshot>> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || read_json::<HeartbeatSnapshot>(&path))
            .await
            .map_err(|e| ShuttleError::store(format!("heartbeat load task failed: {e}")))?
    }

    /// `interval` ごとに snapshot を書き出す。`shutdown` が `true` になったら終了
    pub async fn run_persist(
        &self,
        path: PathBuf,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(e) = self.persist(&path).await {
                warn!(path = %path.display(), error = %e, "heartbeat snapshot not persisted");
            }
        }
    }
}
