//! FsTaskStore - ディレクトリを永続化媒体とする TaskStore
//!
//! # レイアウト
//! ```text
//! <root>/tasks/<worker>/<task-id>.json   タスク 1 件 = 1 ファイル
//! <root>/dead_letters/<task-id>.json     dead letter 1 件 = 1 ファイル
//! <root>/.tmp/                           原子的書き込みのステージング
//! <root>/.locks/<task-id>.lock           task ごとのロックファイル
//! ```
//!
//! # 設計
//! - 書き込みは必ず `.tmp` に書いて fsync してから rename（途中状態は見えない）
//! - CAS は task_id ごとに read-modify-write を直列化
//!   - プロセス内: async Mutex（ロックファイルを待つ blocking スレッドを増やさない）
//!   - プロセス間: `.locks/<task-id>.lock` の排他 file lock（fs2）
//!   - グローバルロックなし、競合は同じ task_id の間だけ
//! - ファイル I/O は spawn_blocking で実行
//! - レコードはプロセス外からも読める pretty JSON

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::atomic_file::{FileLock, json_files, read_json, sweep_staging, write_json_atomic};
use crate::domain::{
    DeadLetterEntry, DomainEvent, Payload, ShuttleError, ShuttleResult, Task, TaskId, TaskState,
    WorkerName,
};
use crate::ports::task_store::{check_transition, sort_fifo};
use crate::ports::{Clock, EventSink, IdGenerator, TaskCounts, TaskStore, UlidGenerator};

const TASKS_DIR: &str = "tasks";
const DEAD_LETTERS_DIR: &str = "dead_letters";
const STAGING_DIR: &str = ".tmp";
const LOCKS_DIR: &str = ".locks";
const STALE_STAGING_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Layout {
    root: PathBuf,
}

impl Layout {
    fn tasks(&self) -> PathBuf {
        self.root.join(TASKS_DIR)
    }

    fn worker_dir(&self, worker: &WorkerName) -> PathBuf {
        self.tasks().join(worker.as_str())
    }

    fn task_path(&self, worker: &WorkerName, task_id: TaskId) -> PathBuf {
        self.worker_dir(worker).join(format!("{task_id}.json"))
    }

    fn dead_letter_path(&self, task_id: TaskId) -> PathBuf {
        self.root
            .join(DEAD_LETTERS_DIR)
            .join(format!("{task_id}.json"))
    }

    fn staging(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    fn lock_path(&self, task_id: TaskId) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{task_id}.lock"))
    }

    /// Worker directories present on disk.
    fn worker_dirs(&self) -> ShuttleResult<Vec<PathBuf>> {
        let tasks = self.tasks();
        let entries = match std::fs::read_dir(&tasks) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ShuttleError::store(e)),
        };
        Ok(entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect())
    }

    /// Full scan for a task file when the index does not know it.
    fn find_task(&self, task_id: TaskId) -> ShuttleResult<Option<(WorkerName, PathBuf)>> {
        let file_name = format!("{task_id}.json");
        for dir in self.worker_dirs()? {
            let path = dir.join(&file_name);
            if path.is_file() {
                let worker = dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| WorkerName::new(n).ok());
                if let Some(worker) = worker {
                    return Ok(Some((worker, path)));
                }
            }
        }
        Ok(None)
    }

    fn load_tasks(&self, dirs: Vec<PathBuf>) -> ShuttleResult<Vec<Task>> {
        let mut tasks = Vec::new();
        for dir in dirs {
            for path in json_files(&dir)? {
                match read_json::<Task>(&path) {
                    Ok(Some(task)) => tasks.push(task),
                    // 削除と競合した
                    Ok(None) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable task record"),
                }
            }
        }
        Ok(tasks)
    }
}

pub struct FsTaskStore {
    layout: Layout,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
    /// task_id -> worker, so `get` does not scan every queue.
    index: Mutex<HashMap<TaskId, WorkerName>>,
    /// プロセス内の task ごとのロック（file lock の手前）
    locks: Mutex<HashMap<TaskId, Arc<tokio::sync::Mutex<()>>>>,
}

impl FsTaskStore {
    /// `root` の store を開く（無ければ作る）
    pub async fn open(
        root: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> ShuttleResult<Self> {
        let layout = Layout { root: root.into() };

        let scan_layout = layout.clone();
        let index = blocking(move || {
            std::fs::create_dir_all(scan_layout.tasks()).map_err(ShuttleError::store)?;
            std::fs::create_dir_all(scan_layout.root.join(DEAD_LETTERS_DIR))
                .map_err(ShuttleError::store)?;
            std::fs::create_dir_all(scan_layout.staging()).map_err(ShuttleError::store)?;
            std::fs::create_dir_all(scan_layout.root.join(LOCKS_DIR))
                .map_err(ShuttleError::store)?;

            let removed = sweep_staging(&scan_layout.staging(), STALE_STAGING_AGE)?;
            if removed > 0 {
                info!(removed, "removed stale staging files");
            }
            build_index(&scan_layout)
        })
        .await?;

        info!(root = %layout.root.display(), tasks = index.len(), "opened task store");
        Ok(Self {
            layout,
            ids: Box::new(UlidGenerator::new(clock.clone())),
            clock,
            events,
            index: Mutex::new(index),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.layout.root
    }

    fn task_lock(&self, task_id: TaskId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(task_id).or_default().clone()
    }

    fn forget_lock(&self, task_id: TaskId) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
    }

    fn indexed_worker(&self, task_id: TaskId) -> Option<WorkerName> {
        self.index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task_id)
            .cloned()
    }

    fn remember(&self, task_id: TaskId, worker: WorkerName) {
        self.index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id, worker);
    }

    fn forget(&self, task_id: TaskId) {
        self.index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
    }

    /// task を読む。index に無ければ別プロセスが書いた可能性があるので走査する
    async fn read_task(&self, task_id: TaskId) -> ShuttleResult<(Task, PathBuf)> {
        if let Some(worker) = self.indexed_worker(task_id) {
            let path = self.layout.task_path(&worker, task_id);
            let read_path = path.clone();
            if let Some(task) = blocking(move || read_json::<Task>(&read_path)).await? {
                return Ok((task, path));
            }
            self.forget(task_id);
        }

        let layout = self.layout.clone();
        let found = blocking(move || match layout.find_task(task_id)? {
            Some((worker, path)) => Ok(read_json::<Task>(&path)?.map(|t| (worker, t, path))),
            None => Ok(None),
        })
        .await?;

        match found {
            Some((worker, task, path)) => {
                self.remember(task_id, worker);
                Ok((task, path))
            }
            None => Err(ShuttleError::NotFound(task_id)),
        }
    }

    async fn write_task(&self, path: PathBuf, task: Task) -> ShuttleResult<()> {
        let staging = self.layout.staging();
        blocking(move || write_json_atomic(&staging, &path, &task)).await
    }
}

fn build_index(layout: &Layout) -> ShuttleResult<HashMap<TaskId, WorkerName>> {
    let mut index = HashMap::new();
    for dir in layout.worker_dirs()? {
        let Some(worker) = dir
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| WorkerName::new(n).ok())
        else {
            warn!(path = %dir.display(), "ignoring directory with invalid worker name");
            continue;
        };
        for path in json_files(&dir)? {
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<TaskId>().ok());
            match id {
                Some(id) => {
                    index.insert(id, worker.clone());
                }
                None => warn!(path = %path.display(), "ignoring file without a task id name"),
            }
        }
    }
    Ok(index)
}

async fn blocking<T, F>(f: F) -> ShuttleResult<T>
where
    F: FnOnce() -> ShuttleResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ShuttleError::store(format!("blocking task failed: {e}")))?
}

#[async_trait]
impl TaskStore for FsTaskStore {
    async fn create(&self, worker: &WorkerName, payload: Payload) -> ShuttleResult<Task> {
        let now = self.clock.now();
        let task = Task::new(self.ids.generate_task_id(), worker.clone(), payload, now);
        let path = self.layout.task_path(worker, task.id());

        self.write_task(path, task.clone()).await?;
        self.remember(task.id(), worker.clone());
        debug!(task_id = %task.id(), worker = %worker, "task written");

        self.events.emit(DomainEvent::TaskCreated {
            task_id: task.id(),
            worker: worker.clone(),
            at: now,
        });
        Ok(task)
    }

    async fn transition(
        &self,
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    ) -> ShuttleResult<Task> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        // worker は変わらないのでパスは lock の外で引いてよい
        let (_, path) = self.read_task(task_id).await?;
        let lock_path = self.layout.lock_path(task_id);
        let staging = self.layout.staging();
        let now = self.clock.now();
        let task = blocking(move || {
            let _file_lock = FileLock::acquire(&lock_path)?;
            let mut task = read_json::<Task>(&path)?.ok_or(ShuttleError::NotFound(task_id))?;
            check_transition(&task, from, to)?;
            task.apply_transition(to, now);
            write_json_atomic(&staging, &path, &task)?;
            Ok(task)
        })
        .await?;

        if to.is_terminal() {
            self.forget_lock(task_id);
        }

        self.events.emit(DomainEvent::TaskTransitioned {
            task_id,
            worker: task.worker().clone(),
            from,
            to,
            at: now,
        });
        Ok(task)
    }

    async fn list(&self, worker: Option<&WorkerName>, state: TaskState) -> ShuttleResult<Vec<Task>> {
        let layout = self.layout.clone();
        let worker = worker.cloned();
        let mut tasks = blocking(move || {
            let dirs = match &worker {
                Some(worker) => vec![layout.worker_dir(worker)],
                None => layout.worker_dirs()?,
            };
            layout.load_tasks(dirs)
        })
        .await?;

        tasks.retain(|t| t.state() == state);
        sort_fifo(&mut tasks);
        Ok(tasks)
    }

    async fn get(&self, task_id: TaskId) -> ShuttleResult<Task> {
        Ok(self.read_task(task_id).await?.0)
    }

    async fn delete(&self, task_id: TaskId) -> ShuttleResult<()> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let (_, path) = self.read_task(task_id).await?;
        let lock_path = self.layout.lock_path(task_id);
        let dead_letter = self.layout.dead_letter_path(task_id);
        blocking(move || {
            let file_lock = FileLock::acquire(&lock_path)?;
            let task = read_json::<Task>(&path)?.ok_or(ShuttleError::NotFound(task_id))?;
            if !task.state().is_terminal() {
                return Err(ShuttleError::NotTerminal {
                    task_id,
                    state: task.state(),
                });
            }
            for p in [&path, &dead_letter] {
                match std::fs::remove_file(p) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(ShuttleError::store(e)),
                }
            }
            // レコードが消えた後なので、後から lock を取った側は NotFound になる
            let _ = std::fs::remove_file(&lock_path);
            drop(file_lock);
            Ok(())
        })
        .await?;

        self.forget(task_id);
        self.forget_lock(task_id);
        debug!(task_id = %task_id, "task deleted");
        Ok(())
    }

    async fn record_dead_letter(&self, entry: DeadLetterEntry) -> ShuttleResult<()> {
        let path = self.layout.dead_letter_path(entry.task.id());
        let staging = self.layout.staging();
        blocking(move || write_json_atomic(&staging, &path, &entry)).await
    }

    async fn dead_letters(&self) -> ShuttleResult<Vec<DeadLetterEntry>> {
        let dir = self.layout.root.join(DEAD_LETTERS_DIR);
        let mut entries = blocking(move || {
            let mut entries = Vec::new();
            for path in json_files(&dir)? {
                match read_json::<DeadLetterEntry>(&path) {
                    Ok(Some(entry)) => entries.push(entry),
                    Ok(None) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable dead letter"),
                }
            }
            Ok(entries)
        })
        .await?;
        entries.sort_by_key(|e| (e.orphaned_at, e.task.id()));
        Ok(entries)
    }

    async fn counts(&self) -> ShuttleResult<TaskCounts> {
        let layout = self.layout.clone();
        let tasks = blocking(move || {
            let dirs = layout.worker_dirs()?;
            layout.load_tasks(dirs)
        })
        .await?;

        let mut counts = TaskCounts::default();
        for task in &tasks {
            counts.add(task.state());
        }
        Ok(counts)
    }
}
