//! `shuttle` subcommands. Everything is printed as pretty JSON on stdout;
//! logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shuttle_core::app::{HandlerError, Runtime, RuntimeBuilder, TaskHandler};
use shuttle_core::config::ShuttleConfig;
use shuttle_core::domain::{Payload, Task, TaskId, TaskState, TransportMode, WorkerName};
use shuttle_core::impls::InMemoryPushTransport;
use tracing::info;

pub fn load_config(path: Option<&Path>, root: Option<PathBuf>) -> Result<ShuttleConfig> {
    let mut config = match path {
        Some(path) => ShuttleConfig::load(path)?,
        None => ShuttleConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(root) = root {
        config.store.root = Some(root);
    }
    Ok(config)
}

/// Runtime over the on-disk store. Background loops are not started.
async fn open(config: ShuttleConfig) -> Result<Runtime> {
    if config.store.root.is_none() {
        bail!("no store directory; pass --root, set SHUTTLE_ROOT or `store.root`");
    }
    RuntimeBuilder::new(config)
        .build()
        .await
        .context("failed to open shuttle runtime")
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn task_id(raw: &str) -> Result<TaskId> {
    raw.parse::<TaskId>()
        .with_context(|| format!("invalid task id '{raw}'"))
}

pub async fn create(config: ShuttleConfig, worker: &str, payload: String) -> Result<()> {
    let runtime = open(config).await?;
    let worker = WorkerName::new(worker)?;
    let task = runtime
        .coordinator()
        .create_task(&worker, Payload::from(payload))
        .await?;
    print_json(&task)
}

pub async fn get(config: ShuttleConfig, raw: &str) -> Result<()> {
    let runtime = open(config).await?;
    let task = runtime.store().get(task_id(raw)?).await?;
    print_json(&task)
}

pub async fn list(config: ShuttleConfig, worker: Option<&str>, state: Option<TaskState>) -> Result<()> {
    let runtime = open(config).await?;
    let worker = worker.map(WorkerName::new).transpose()?;

    let states = match state {
        Some(state) => vec![state],
        None => TaskState::ALL.to_vec(),
    };
    let mut tasks: Vec<Task> = Vec::new();
    for state in states {
        tasks.extend(runtime.store().list(worker.as_ref(), state).await?);
    }
    tasks.sort_by_key(|t| t.fifo_key());
    print_json(&tasks)
}

pub async fn dead_letters(config: ShuttleConfig) -> Result<()> {
    let runtime = open(config).await?;
    print_json(&runtime.store().dead_letters().await?)
}

pub async fn status(config: ShuttleConfig) -> Result<()> {
    let runtime = open(config).await?;
    print_json(&runtime.status().await?)
}

pub async fn sweep(config: ShuttleConfig) -> Result<()> {
    let runtime = open(config).await?;
    match runtime.sweep_from_snapshot().await? {
        Some(report) => print_json(&report),
        None => bail!("no heartbeat snapshot yet; sweep cannot judge liveness"),
    }
}

pub async fn retry(config: ShuttleConfig, raw: &str) -> Result<()> {
    let runtime = open(config).await?;
    let task = runtime.coordinator().retry(task_id(raw)?).await?;
    print_json(&task)
}

pub async fn purge(config: ShuttleConfig, raw: &str) -> Result<()> {
    let runtime = open(config).await?;
    let id = task_id(raw)?;
    runtime.coordinator().purge(id).await?;
    print_json(&serde_json::json!({ "purged": id.to_string() }))
}

#[derive(Debug, Serialize, Deserialize)]
struct GreetPayload {
    name: String,
}

/// Sample handler: fails the first `remaining_failures` tasks, then greets.
struct GreetHandler {
    remaining_failures: AtomicU32,
}

impl GreetHandler {
    fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl TaskHandler for GreetHandler {
    async fn handle(&self, task: &Task) -> Result<(), HandlerError> {
        let payload: GreetPayload = serde_json::from_slice(task.payload().as_bytes())
            .map_err(|e| HandlerError::new(format!("json decode: {e}")))?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::new(format!("intentional failure (left={left})")));
        }

        info!(task_id = %task.id(), "Hello, {}!", payload.name);
        Ok(())
    }
}

fn demo_config(mut config: ShuttleConfig) -> ShuttleConfig {
    config.poll.allow_fast_poll = true;
    config.poll.interval_ms = 100;
    config.hybrid.safety_interval_ms = 1_000;
    config.heartbeat.interval_ms = 200;
    config.sweeper.interval_ms = 1_000;
    config.selector.evaluation_interval_ms = 500;
    config.coordinator.await_poll_interval_ms = 100;
    config
}

#[derive(Debug, Serialize)]
struct DemoOutcome {
    task_id: String,
    state: TaskState,
    attempt: u32,
    retried: bool,
}

pub async fn demo(config: ShuttleConfig, tasks: usize, failures: u32, no_push: bool) -> Result<()> {
    let transport = Arc::new(InMemoryPushTransport::new());
    if no_push {
        transport.set_available(false);
    }

    let mut runtime = RuntimeBuilder::new(demo_config(config))
        .with_push_transport(transport.clone())
        .build()
        .await?;
    runtime.start();

    let worker = WorkerName::new("greeter")?;
    runtime.selector().set_override(&worker, TransportMode::Push);
    let handle = runtime.spawn_worker(worker.clone(), Arc::new(GreetHandler::new(failures)));

    let mut created = Vec::with_capacity(tasks);
    for i in 0..tasks {
        let payload = serde_json::to_vec(&GreetPayload {
            name: format!("guest-{i}"),
        })?;
        created.push(
            runtime
                .coordinator()
                .create_task(&worker, Payload::from(payload))
                .await?,
        );
    }

    let wait = Duration::from_secs(10);
    let mut outcomes = Vec::with_capacity(tasks);
    for task in created {
        let mut done = runtime.coordinator().await_result(task.id(), wait).await?;
        let retried = done.state() == TaskState::Failed;
        if retried {
            runtime.coordinator().retry(done.id()).await?;
            done = runtime.coordinator().await_result(done.id(), wait).await?;
        }
        outcomes.push(DemoOutcome {
            task_id: done.id().to_string(),
            state: done.state(),
            attempt: done.attempt(),
            retried,
        });
    }

    print_json(&outcomes)?;
    print_json(&runtime.status().await?)?;
    info!(push_delivered = transport.delivered(), "demo finished");

    handle.shutdown_and_join().await;
    runtime.shutdown().await;
    Ok(())
}
