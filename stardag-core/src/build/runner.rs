//! Runner abstraction (§4.2 run-types, §4.3.2 re-entrancy, §9 "Design
//! notes" on modeling generator-style yield/resume).
//!
//! The source models dynamic deps as a generator the scheduler drives with
//! `.send(None)`; `run()` here is instead a single `async fn` that never
//! truly returns control to the scheduler mid-flight — it suspends at the
//! `.await` inside [`SchedulerRunContext::yield_deps`] and the scheduler
//! observes that suspension as a message on a channel, not as the task
//! function returning. This is exactly the "suspended coroutine" case
//! called out as the idiomatic per-runner continuation token: for a
//! cooperative runner the token *is* the still-alive Rust future.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::run::{ExecutionMode, RunContext, RunOutcome, TaskError};
use crate::task::{Task, TaskStruct};

/// A task body's request, made via `ctx.yield_deps(..)`, to have `deps`
/// scheduled and awaited before it proceeds.
pub struct YieldRequest {
    pub deps: TaskStruct,
    pub ack: oneshot::Sender<Result<(), TaskError>>,
}

/// The [`RunContext`] handed to a task body. Forwards yields to whichever
/// loop is driving this task's execution (see `scheduler::drive_task`).
pub struct SchedulerRunContext {
    yield_tx: mpsc::UnboundedSender<YieldRequest>,
    cancel: CancellationToken,
}

impl SchedulerRunContext {
    pub fn new(yield_tx: mpsc::UnboundedSender<YieldRequest>, cancel: CancellationToken) -> Self {
        Self { yield_tx, cancel }
    }
}

#[async_trait]
impl RunContext for SchedulerRunContext {
    async fn yield_deps(&mut self, deps: TaskStruct) -> Result<(), TaskError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.yield_tx.send(YieldRequest { deps, ack: ack_tx }).is_err() {
            return Err(TaskError::Cancelled);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TaskError::Cancelled),
            result = ack_rx => result.unwrap_or(Err(TaskError::Cancelled)),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Executes a task body somewhere (in-process, a blocking thread, a child
/// process, or a remote worker) and reports the channel a yield/resume
/// loop can drive it through.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(
        &self,
        task: Arc<dyn Task>,
        yield_tx: mpsc::UnboundedSender<YieldRequest>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, TaskError>;
}

/// Runs the task body as a plain `.await` on the scheduler's own executor.
#[derive(Debug, Default)]
pub struct CooperativeRunner;

#[async_trait]
impl Runner for CooperativeRunner {
    async fn run(
        &self,
        task: Arc<dyn Task>,
        yield_tx: mpsc::UnboundedSender<YieldRequest>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, TaskError> {
        let mut ctx = SchedulerRunContext::new(yield_tx, cancel);
        task.run(&mut ctx).await
    }
}

/// Runs the task body on a blocking-thread pool. Dynamic-dep yields still
/// need to cross back into async land, so the task's own `.await` point is
/// driven via `Handle::block_on` from inside `spawn_blocking` — the
/// "parked thread" continuation token from §9 is, concretely, the OS
/// thread parked inside that `block_on` call.
#[derive(Debug, Default)]
pub struct ThreadRunner;

#[async_trait]
impl Runner for ThreadRunner {
    async fn run(
        &self,
        task: Arc<dyn Task>,
        yield_tx: mpsc::UnboundedSender<YieldRequest>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, TaskError> {
        let handle = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || {
            handle.block_on(async move {
                let mut ctx = SchedulerRunContext::new(yield_tx, cancel);
                task.run(&mut ctx).await
            })
        })
        .await
        .map_err(|e| TaskError::Run(anyhow::anyhow!("runner thread panicked: {e}")))?
    }
}

/// Runs the task body out-of-process: the task is transport-serialized
/// (§4.1 "transport mode") and piped to a worker command's stdin; the
/// worker's exit status is the only signal the scheduler observes (§4.2
/// "Process runner... Must serialize tasks for transport"). Dynamic deps
/// are not supported for process-mode tasks — a subprocess cannot `.await`
/// back into this engine's scheduler — matching the "narrow, one-level
/// yield+resume" scope called out in §9; a task body that calls
/// `ctx.yield_deps` under this runner gets `TaskError::Cancelled` from the
/// closed yield channel.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    /// `argv` of the worker command. The task's transport-mode JSON is
    /// written to its stdin; `argv[0]` is the executable.
    command: Vec<String>,
}

impl Default for ProcessRunner {
    /// No worker binary ships with this crate — a deployment names its own
    /// via [`ProcessRunner::new`]. The default is intentionally a command
    /// that doesn't exist so a misconfigured `ExecutionMode::Process` task
    /// fails loudly at spawn time instead of silently running in-process.
    fn default() -> Self {
        Self {
            command: vec!["stardag-worker".to_string()],
        }
    }
}

impl ProcessRunner {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(
        &self,
        task: Arc<dyn Task>,
        _yield_tx: mpsc::UnboundedSender<YieldRequest>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, TaskError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(TaskError::Run(anyhow::anyhow!(
                "process runner has an empty command"
            )));
        };

        let payload = crate::identity::dump_transport(task.as_ref());
        let payload_bytes = serde_json::to_vec(&payload)
            .map_err(|e| TaskError::Run(anyhow::anyhow!("failed to serialize task for transport: {e}")))?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TaskError::Run(anyhow::anyhow!("failed to spawn process runner worker: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload_bytes)
                .await
                .map_err(|e| TaskError::Run(anyhow::anyhow!("failed to write task payload to worker stdin: {e}")))?;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                Err(TaskError::Cancelled)
            }
            status = child.wait() => {
                let status = status.map_err(|e| TaskError::Run(anyhow::anyhow!("failed to wait on worker process: {e}")))?;
                if status.success() {
                    Ok(RunOutcome::Done)
                } else {
                    Err(TaskError::Run(anyhow::anyhow!("worker process exited with {status}")))
                }
            }
        }
    }
}

/// Dispatches to an out-of-process worker via the registry's remote
/// execution contract. Out of scope for the in-memory reference engine;
/// provided so `ExecutionMode::Remote` has a type to resolve to.
#[derive(Debug, Default)]
pub struct RemoteRunner;

#[async_trait]
impl Runner for RemoteRunner {
    async fn run(
        &self,
        _task: Arc<dyn Task>,
        _yield_tx: mpsc::UnboundedSender<YieldRequest>,
        _cancel: CancellationToken,
    ) -> Result<RunOutcome, TaskError> {
        Err(TaskError::Run(anyhow::anyhow!(
            "remote execution mode requires a configured remote worker pool"
        )))
    }
}

/// Resolves an [`ExecutionMode`] to the `Runner` that handles it.
pub struct RunnerSet {
    pub cooperative: CooperativeRunner,
    pub thread: ThreadRunner,
    pub process: ProcessRunner,
    pub remote: RemoteRunner,
}

impl Default for RunnerSet {
    fn default() -> Self {
        Self {
            cooperative: CooperativeRunner,
            thread: ThreadRunner,
            process: ProcessRunner::default(),
            remote: RemoteRunner,
        }
    }
}

impl RunnerSet {
    pub fn get(&self, mode: ExecutionMode) -> &dyn Runner {
        match mode {
            ExecutionMode::Cooperative => &self.cooperative,
            ExecutionMode::Thread => &self.thread,
            ExecutionMode::Process => &self.process,
            ExecutionMode::Remote => &self.remote,
        }
    }
}
