//! Execution-time types: the runner context a task body sees, the outcome
//! of a single invocation, and the error taxonomy (§4.2, §4.3, §7).

use async_trait::async_trait;

use crate::task::TaskStruct;

/// Which runner family a task should execute under (§4.3 "Runner").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Runs as a plain `.await` on the scheduler's own executor. Cheapest;
    /// appropriate for tasks whose `run()` body is itself non-blocking.
    Cooperative,
    /// Runs on a blocking-thread pool (`tokio::task::spawn_blocking`).
    /// Appropriate for CPU-bound or blocking-IO task bodies.
    Thread,
    /// Runs as a child OS process; the scheduler communicates completion
    /// via exit status and (optionally) a result file.
    Process,
    /// Dispatched to an out-of-process worker via the registry's remote
    /// execution contract; the scheduler only observes lifecycle events.
    Remote,
}

/// What a single `Task::run` invocation produced (§4.2 run-type table).
pub enum RunOutcome {
    /// `RESULT_NONE` — completed normally, no dynamic deps were yielded.
    Done,
    /// `RESULT_DYNAMIC_DEPS` — the task yielded more dependencies and
    /// should be resumed once they are all complete. The continuation is
    /// represented implicitly: because `run()` is an `async fn`, "resuming"
    /// a cooperative task is just letting its still-suspended future
    /// continue past the `.await` inside `ctx.yield_deps(..)`. Thread and
    /// process runners instead re-enter a fresh call once their blocking
    /// yield unblocks (see `build::runner`).
    Suspended,
}

/// Errors a task body (or the traits it touches) can surface.
#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    #[error("target error: {0}")]
    Target(#[source] anyhow::Error),
    #[error("task run failed: {0}")]
    Run(#[source] anyhow::Error),
    #[error("task was cancelled")]
    Cancelled,
    /// The background lock-renewal loop lost ownership mid-run (§4.3.2):
    /// distinguishable from an ordinary task-body error so the scheduler
    /// can decide to retry with a fresh `owner_id` rather than treat it as
    /// a real failure of the task's own logic.
    #[error("lock renewal lost ownership mid-run")]
    LockLost,
}

impl TaskError {
    /// The string form recorded on `TASK_FAILED` events (§7).
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// One uploadable artifact produced by a completed task (§4.4 "Asset
/// upload"). Stardag only prescribes the wire shape; storage is the
/// registry's concern.
#[derive(Debug, Clone)]
pub enum RegistryAsset {
    Markdown { name: String, body: String },
    Json { name: String, body: serde_json::Value },
}

/// The capability a task body uses to request additional dependencies
/// mid-run (§4.2). Implemented by the scheduler; tasks never construct one
/// themselves.
#[async_trait]
pub trait RunContext: Send {
    /// Request that `deps` be scheduled and awaited before this call
    /// returns. On return, every task reachable from `deps` is `COMPLETED`
    /// (§9's synchronization invariant). Cancellation-safe: if the
    /// enclosing build is cancelled while this is pending, it resolves to
    /// `TaskError::Cancelled` instead of hanging.
    async fn yield_deps(&mut self, deps: TaskStruct) -> Result<(), TaskError>;

    /// Cooperative cancellation check; long-running task bodies should
    /// poll this between expensive steps so `BUILD_EXIT_EARLY` can take
    /// effect promptly (§5 "fail-fast").
    fn is_cancelled(&self) -> bool;
}
