//! TaskStore behaviour shared by the in-memory and on-disk stores.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rstest::rstest;
use shuttle_core::domain::{ShuttleError, Task, TaskState, WorkerName};
use shuttle_core::impls::{FsTaskStore, InMemoryTaskStore};
use shuttle_core::ports::{NoopEventSink, SystemClock, TaskStore};
use tempfile::TempDir;

#[derive(Debug, Clone, Copy)]
enum Backend {
    Memory,
    Fs,
}

/// The TempDir must outlive the store.
async fn open(backend: Backend) -> (Arc<dyn TaskStore>, Option<TempDir>) {
    match backend {
        Backend::Memory => (
            Arc::new(InMemoryTaskStore::new(
                Arc::new(SystemClock),
                Arc::new(NoopEventSink),
            )),
            None,
        ),
        Backend::Fs => {
            let dir = tempfile::tempdir().unwrap();
            let store = FsTaskStore::open(dir.path(), Arc::new(SystemClock), Arc::new(NoopEventSink))
                .await
                .unwrap();
            (Arc::new(store), Some(dir))
        }
    }
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::fs(Backend::Fs)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_are_all_visible(#[case] backend: Backend) {
    let (store, _dir) = open(backend).await;
    let worker = WorkerName::new("ingest").unwrap();

    let mut joins = Vec::new();
    for i in 0..32 {
        let store = store.clone();
        let worker = worker.clone();
        joins.push(tokio::spawn(async move {
            store.create(&worker, format!("job-{i}").into()).await.unwrap()
        }));
    }
    let mut ids = HashSet::new();
    for join in joins {
        ids.insert(join.await.unwrap().id());
    }
    assert_eq!(ids.len(), 32);

    let pending = store.list(Some(&worker), TaskState::Pending).await.unwrap();
    assert_eq!(pending.len(), 32);
    assert!(pending.iter().all(|t| t.attempt() == 0));
    assert!(
        pending
            .windows(2)
            .all(|pair| pair[0].fifo_key() <= pair[1].fifo_key())
    );
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::fs(Backend::Fs)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_claim_wins(#[case] backend: Backend) {
    let (store, _dir) = open(backend).await;
    let worker = WorkerName::new("ingest").unwrap();
    let task = store.create(&worker, "x".into()).await.unwrap();

    let mut joins = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        let id = task.id();
        joins.push(tokio::spawn(async move {
            store
                .transition(id, TaskState::Pending, TaskState::Processing)
                .await
        }));
    }

    let mut won = 0;
    let mut conflicts = 0;
    for join in joins {
        match join.await.unwrap() {
            Ok(task) => {
                won += 1;
                assert_eq!(task.state(), TaskState::Processing);
                assert!(task.started_at().is_some());
            }
            Err(ShuttleError::StateConflict { actual, .. }) => {
                conflicts += 1;
                assert_eq!(actual, TaskState::Processing);
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(conflicts, 15);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::fs(Backend::Fs)]
#[tokio::test]
async fn illegal_transition_leaves_task_untouched(#[case] backend: Backend) {
    let (store, _dir) = open(backend).await;
    let worker = WorkerName::new("ingest").unwrap();
    let task = store.create(&worker, "x".into()).await.unwrap();

    let err = store
        .transition(task.id(), TaskState::Pending, TaskState::Completed)
        .await
        .unwrap_err();
    assert!(matches!(err, ShuttleError::InvalidTransition { .. }));
    assert_eq!(store.get(task.id()).await.unwrap(), task);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::fs(Backend::Fs)]
#[tokio::test]
async fn only_terminal_tasks_can_be_deleted(#[case] backend: Backend) {
    let (store, _dir) = open(backend).await;
    let worker = WorkerName::new("ingest").unwrap();
    let task = store.create(&worker, "x".into()).await.unwrap();

    let err = store.delete(task.id()).await.unwrap_err();
    assert!(matches!(err, ShuttleError::NotTerminal { .. }));

    store
        .transition(task.id(), TaskState::Pending, TaskState::Processing)
        .await
        .unwrap();
    store
        .transition(task.id(), TaskState::Processing, TaskState::Completed)
        .await
        .unwrap();
    store.delete(task.id()).await.unwrap();
    assert!(matches!(
        store.get(task.id()).await,
        Err(ShuttleError::NotFound(_))
    ));
}

#[tokio::test]
async fn fs_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let worker = WorkerName::new("ingest").unwrap();

    let created = {
        let store = FsTaskStore::open(dir.path(), Arc::new(SystemClock), Arc::new(NoopEventSink))
            .await
            .unwrap();
        let first = store.create(&worker, "a".into()).await.unwrap();
        let second = store.create(&worker, "b".into()).await.unwrap();
        store
            .transition(first.id(), TaskState::Pending, TaskState::Processing)
            .await
            .unwrap();
        vec![first.id(), second.id()]
    };

    let store = FsTaskStore::open(dir.path(), Arc::new(SystemClock), Arc::new(NoopEventSink))
        .await
        .unwrap();
    assert_eq!(
        store.get(created[0]).await.unwrap().state(),
        TaskState::Processing
    );
    let pending = store.list(Some(&worker), TaskState::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id(), created[1]);
    assert_eq!(pending[0].payload().as_bytes(), b"b");
}

async fn open_fs(root: &Path) -> Arc<dyn TaskStore> {
    Arc::new(
        FsTaskStore::open(root, Arc::new(SystemClock), Arc::new(NoopEventSink))
            .await
            .unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn claims_across_two_store_instances_have_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let stores = [open_fs(dir.path()).await, open_fs(dir.path()).await];
    let worker = WorkerName::new("ingest").unwrap();

    for round in 0..20 {
        let task = stores[0].create(&worker, "x".into()).await.unwrap();
        let task_id = task.id();
        let mut joins = Vec::new();
        for i in 0..8 {
            let store = stores[i % 2].clone();
            joins.push(tokio::spawn(async move {
                store
                    .transition(task_id, TaskState::Pending, TaskState::Processing)
                    .await
            }));
        }

        let mut won = 0;
        for join in joins {
            match join.await.unwrap() {
                Ok(_) => won += 1,
                Err(e) => assert!(e.is_conflict(), "round {round}: {e}"),
            }
        }
        assert_eq!(won, 1, "round {round}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completion_and_redispatch_from_two_instances_never_both_apply() {
    let dir = tempfile::tempdir().unwrap();
    let finisher = open_fs(dir.path()).await;
    let sweeper = open_fs(dir.path()).await;
    let worker = WorkerName::new("ingest").unwrap();

    for round in 0..20 {
        let task = finisher.create(&worker, "x".into()).await.unwrap();
        finisher
            .transition(task.id(), TaskState::Pending, TaskState::Processing)
            .await
            .unwrap();
        let task_id = task.id();

        let complete = tokio::spawn({
            let store = finisher.clone();
            async move {
                store
                    .transition(task_id, TaskState::Processing, TaskState::Completed)
                    .await
            }
        });
        let redispatch = tokio::spawn({
            let store = sweeper.clone();
            async move {
                store
                    .transition(task_id, TaskState::Processing, TaskState::Pending)
                    .await
            }
        });
        let completed = complete.await.unwrap().is_ok();
        let redispatched = redispatch.await.unwrap().is_ok();
        assert!(completed != redispatched, "round {round}");

        let stored = finisher.get(task.id()).await.unwrap();
        let expected = if completed {
            TaskState::Completed
        } else {
            TaskState::Pending
        };
        assert_eq!(stored.state(), expected, "round {round}");
    }
}

/// Every `*.json` under `tasks/` parses as a complete task, and no staging
/// file is visible there.
fn assert_tasks_dir_is_clean(root: &Path) {
    for worker_dir in std::fs::read_dir(root.join("tasks")).unwrap() {
        let worker_dir = worker_dir.unwrap().path();
        assert!(worker_dir.is_dir(), "stray entry {}", worker_dir.display());
        for entry in std::fs::read_dir(&worker_dir).unwrap() {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.ends_with(".json"), "unexpected file {name}");
            let bytes = std::fs::read(&path).unwrap();
            let task: Task = serde_json::from_slice(&bytes)
                .unwrap_or_else(|e| panic!("torn record {name}: {e}"));
            assert_eq!(format!("{}.json", task.id()), name);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_see_partial_records_while_writing() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_fs(dir.path()).await;
    let worker = WorkerName::new("ingest").unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let reader = tokio::spawn({
        let store = store.clone();
        let worker = worker.clone();
        let root = dir.path().to_path_buf();
        let done = done.clone();
        async move {
            let mut passes = 0u32;
            while !done.load(Ordering::SeqCst) {
                for state in TaskState::ALL {
                    for task in store.list(Some(&worker), state).await.unwrap() {
                        assert_eq!(task.state(), state);
                        assert_eq!(task.worker(), &worker);
                    }
                }
                let root = root.clone();
                tokio::task::spawn_blocking(move || assert_tasks_dir_is_clean(&root))
                    .await
                    .unwrap();
                passes += 1;
            }
            passes
        }
    });

    let mut writers = Vec::new();
    for i in 0..4 {
        let store = store.clone();
        let worker = worker.clone();
        writers.push(tokio::spawn(async move {
            for j in 0..10 {
                let payload = format!("{i}-{j}-{}", "x".repeat(4096));
                let task = store.create(&worker, payload.into()).await.unwrap();
                store
                    .transition(task.id(), TaskState::Pending, TaskState::Processing)
                    .await
                    .unwrap();
                store
                    .transition(task.id(), TaskState::Processing, TaskState::Completed)
                    .await
                    .unwrap();
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }
    done.store(true, Ordering::SeqCst);

    assert!(reader.await.unwrap() > 0);
    assert_tasks_dir_is_clean(dir.path());
    let completed = store.list(Some(&worker), TaskState::Completed).await.unwrap();
    assert_eq!(completed.len(), 40);
}
