//! The build engine: the scheduler loop that drives task state transitions
//! and dispatches to runners (§4.2).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::GraphMap;
use petgraph::Directed;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::build::backoff::Backoff;
use crate::build::graph::discover;
use crate::build::runner::RunnerSet;
use crate::build::state::TaskState;
use crate::lock::{GlobalConcurrencyLock, LockAcquisition, NoOpLock};
use crate::registry::{BuildEvent, NoOpRegistry, Registry, TaskEvent, TaskRegistration};
use crate::run::TaskError;
use crate::task::{flatten_task_struct, Task, TaskRef};

/// On the first task failure: stop dispatching and cancel inflight work,
/// or keep running independent branches and mark downstream `SKIPPED`
/// (§4.2.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    FailFast,
    BestEffort,
}

/// What to do when a lock RPC exhausts its retries (§4.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockErrorPolicy {
    FailTask,
    TreatAsHeldByOther,
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub lock_ttl: Duration,
    pub fail_mode: FailMode,
    pub lock_error_policy: LockErrorPolicy,
    pub check_task_completion: bool,
    pub user_identity: Option<String>,
    /// Falls back to `"unknown"` rather than failing the build when the
    /// surrounding environment has no resolvable commit (§ ambient stack).
    pub commit_hash: String,
    pub description: String,
    /// If every task still outstanding has been sitting in
    /// `WAITING_FOR_LOCK` continuously for at least this long, the build
    /// exits early rather than waiting indefinitely for other builds to
    /// finish the shared work (§4.2.3 "Completion", §9 Open Questions:
    /// waiting-for-lock tasks are cancelled, conservative reading).
    /// `None` disables the check (the default: wait forever).
    pub exit_early_after: Option<Duration>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(60),
            fail_mode: FailMode::BestEffort,
            lock_error_policy: LockErrorPolicy::TreatAsHeldByOther,
            check_task_completion: true,
            user_identity: None,
            commit_hash: "unknown".to_string(),
            description: String::new(),
            exit_early_after: None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Discovery(#[from] crate::build::graph::DiscoveryError),
    #[error("build failed: {0} task(s) did not complete")]
    TaskFailures(usize),
    #[error("build was cancelled")]
    Cancelled,
    /// Remaining inflight work is entirely owned by other builds; this
    /// build gave up waiting rather than block forever (§4.2.3, §7).
    #[error("build exited early: remaining work is owned by other builds")]
    ExitEarly,
}

/// A completed (or failed/cancelled) build's summary (§3 "Build"): the
/// root set it was started for, when it ran, and the final state table.
pub struct BuildReport {
    pub build_id: Uuid,
    pub root_task_ids: Vec<Uuid>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub states: HashMap<Uuid, TaskState>,
}

type RunSlot = Arc<OnceCell<Result<(), Arc<TaskError>>>>;

/// Facade tying together the lock, registry, and runner set. Mirrors the
/// teacher's engine-as-facade-over-a-store shape, generalized from a
/// single persistence trait to the three collaborators stardag needs.
pub struct BuildEngine {
    lock: Arc<dyn GlobalConcurrencyLock>,
    registry: Arc<dyn Registry>,
    runners: RunnerSet,
    config: BuildConfig,
    slots: DashMap<Uuid, RunSlot>,
    states: DashMap<Uuid, TaskState>,
    /// Ids found already complete during this build's discovery sweep
    /// (§4.2.1), reused by `execute_task` to skip a redundant `complete()`
    /// call. Repopulated at the start of every `build()` call.
    precomputed_complete: DashMap<Uuid, ()>,
    /// The dependency graph discovered so far: seeded from the static
    /// `requires()` closure at the start of `build()`, then incrementally
    /// extended every time a task yields dynamic deps (§4.2, §8). Re-checked
    /// for cycles on every extension so a yielded dep that transitively
    /// depends back on its own yielding task fails that task instead of
    /// deadlocking on a `OnceCell` whose initialization is already
    /// in-flight on the same call stack.
    dep_graph: std::sync::Mutex<GraphMap<Uuid, (), Directed>>,
    cancel: CancellationToken,
    exit_early: CancellationToken,
}

impl BuildEngine {
    pub fn new(config: BuildConfig) -> Self {
        Self::with_collaborators(Arc::new(NoOpLock), Arc::new(NoOpRegistry), config)
    }

    pub fn with_collaborators(
        lock: Arc<dyn GlobalConcurrencyLock>,
        registry: Arc<dyn Registry>,
        config: BuildConfig,
    ) -> Self {
        Self::with_runners(lock, registry, RunnerSet::default(), config)
    }

    /// Like [`BuildEngine::with_collaborators`], but also lets a caller
    /// supply a custom [`RunnerSet`] — e.g. a
    /// [`ProcessRunner`](crate::build::runner::ProcessRunner) pointed at a
    /// real worker binary, for deployments that actually use
    /// `ExecutionMode::Process`.
    pub fn with_runners(
        lock: Arc<dyn GlobalConcurrencyLock>,
        registry: Arc<dyn Registry>,
        runners: RunnerSet,
        config: BuildConfig,
    ) -> Self {
        Self {
            lock,
            registry,
            runners,
            config,
            slots: DashMap::new(),
            states: DashMap::new(),
            precomputed_complete: DashMap::new(),
            dep_graph: std::sync::Mutex::new(GraphMap::new()),
            cancel: CancellationToken::new(),
            exit_early: CancellationToken::new(),
        }
    }

    /// External cancellation (§5 "Cancellation"): stop dispatching new
    /// tasks and ask inflight runners to stop promptly.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn build(&self, roots: Vec<Arc<dyn Task>>) -> Result<BuildReport, BuildError> {
        let started_at = Utc::now();
        let root_ids: Vec<Uuid> = roots.iter().map(|t| t.id()).collect();
        let build_id = self
            .registry
            .start_build(&root_ids, &self.config.description)
            .await
            .unwrap_or_else(|_| Uuid::new_v4());

        let graph = discover(roots.clone()).await?;
        let discovered_ids: Vec<Uuid> = graph.tasks.keys().copied().collect();
        self.precomputed_complete.clear();
        for id in &graph.precomputed_complete {
            self.precomputed_complete.insert(*id, ());
        }
        *self.dep_graph.lock().expect("dep graph lock poisoned") = graph.edges.clone();

        let exec_fut = join_all(roots.iter().map(|t| self.run_task(build_id, t.clone())));
        tokio::pin!(exec_fut);

        let results = if let Some(threshold) = self.config.exit_early_after {
            let watcher_fut = self.watch_for_exit_early(&discovered_ids, threshold);
            tokio::pin!(watcher_fut);
            tokio::select! {
                r = &mut exec_fut => r,
                _ = &mut watcher_fut => exec_fut.await,
            }
        } else {
            exec_fut.await
        };
        let failures = results.iter().filter(|r| r.is_err()).count();

        // Anything discovered but never reached a terminal state (e.g. a
        // best-effort branch whose own upstream never failed but which was
        // simply never required by a failing root) is left as-is; record
        // whatever final states we do have for the report.
        let states: HashMap<Uuid, TaskState> = graph
            .tasks
            .keys()
            .filter_map(|id| self.states.get(id).map(|s| (*id, *s)))
            .collect();

        let finished_at = Utc::now();

        if self.exit_early.is_cancelled() {
            let _ = self.registry.build_event(build_id, BuildEvent::ExitEarly).await;
            return Err(BuildError::ExitEarly);
        }

        if self.cancel.is_cancelled() {
            let _ = self.registry.build_event(build_id, BuildEvent::Cancelled).await;
            return Err(BuildError::Cancelled);
        }

        if failures > 0 {
            let _ = self.registry.build_event(build_id, BuildEvent::Failed).await;
            Err(BuildError::TaskFailures(failures))
        } else {
            let _ = self.registry.build_event(build_id, BuildEvent::Completed).await;
            Ok(BuildReport {
                build_id,
                root_task_ids: root_ids,
                started_at,
                finished_at,
                states,
            })
        }
    }

    /// Polls the state table until every discovered task is either
    /// terminal or parked in `WAITING_FOR_LOCK`, with at least one actually
    /// waiting, sustained continuously for `threshold` — then flips
    /// `exit_early` so every waiter unblocks with `TaskError::Cancelled`
    /// (§4.2.3 "Completion": `BUILD_EXIT_EARLY` "if the remaining inflight
    /// set is entirely owned by other builds").
    async fn watch_for_exit_early(&self, discovered_ids: &[Uuid], threshold: Duration) {
        let poll_interval = (threshold / 5).max(Duration::from_millis(50));
        let mut held_since: Option<tokio::time::Instant> = None;
        loop {
            tokio::time::sleep(poll_interval).await;

            let mut any_waiting = false;
            let all_blocked = discovered_ids.iter().all(|id| match self.states.get(id) {
                Some(state) if state.is_terminal() => true,
                Some(state) if matches!(*state, TaskState::WaitingForLock) => {
                    any_waiting = true;
                    true
                }
                _ => false,
            });

            if all_blocked && any_waiting {
                let since = held_since.get_or_insert_with(tokio::time::Instant::now);
                if since.elapsed() >= threshold {
                    self.exit_early.cancel();
                    return;
                }
            } else {
                held_since = None;
            }
        }
    }

    fn set_state(&self, id: Uuid, state: TaskState) {
        self.states.insert(id, state);
    }

    /// Extends the live dependency graph with `deps`' own transitive static
    /// closure plus a direct edge from each dep to `yielding`, then checks
    /// whether doing so introduced a cycle (§8: "yielded dep transitively
    /// depends on yielding task"). Mirrors `graph::discover`'s flattening
    /// loop, just run incrementally against the graph already built from
    /// the static roots instead of from scratch. Returns the yielding task's
    /// id if a cycle was introduced.
    fn extend_dep_graph_and_check_cycle(&self, yielding: Uuid, deps: &[Arc<dyn Task>]) -> Option<Uuid> {
        let mut graph = self.dep_graph.lock().expect("dep graph lock poisoned");

        let mut frontier: Vec<Arc<dyn Task>> = deps.to_vec();
        let mut seen: std::collections::HashSet<Uuid> = std::collections::HashSet::new();
        while let Some(task) = frontier.pop() {
            let id = task.id();
            graph.add_node(id);
            if !seen.insert(id) {
                continue;
            }
            let mut sub_deps = Vec::new();
            flatten_task_struct(&task.requires(), &mut sub_deps);
            for sub in sub_deps {
                let sub_id = sub.id();
                graph.add_node(sub_id);
                graph.add_edge(sub_id, id, ());
                frontier.push(sub);
            }
        }

        for dep in deps {
            graph.add_edge(dep.id(), yielding, ());
        }

        if is_cyclic_directed(&*graph) {
            Some(yielding)
        } else {
            None
        }
    }

    fn slot_for(&self, id: Uuid) -> RunSlot {
        self.slots
            .entry(id)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Execute (or await an already-inflight/previous execution of) a
    /// single task, recursing into its static dependency closure first.
    /// Memoized per task id via `slots`, which is what gives "lock
    /// acquisition is serialized per-task-id across the whole engine" for
    /// free within one process (§4.2.5).
    fn run_task<'a>(
        &'a self,
        build_id: Uuid,
        task: Arc<dyn Task>,
    ) -> BoxFuture<'a, Result<(), TaskError>> {
        Box::pin(async move {
            let id = task.id();
            let slot = self.slot_for(id);
            let result = slot
                .get_or_init(|| async { self.execute_task(build_id, task).await.map_err(Arc::new) })
                .await
                .clone();
            result.map_err(|e| TaskError::Run(anyhow::anyhow!(e.message())))
        })
    }

    async fn execute_task(&self, build_id: Uuid, task: Arc<dyn Task>) -> Result<(), TaskError> {
        let id = task.id();

        if self.cancel.is_cancelled() {
            self.set_state(id, TaskState::Cancelled);
            return Err(TaskError::Cancelled);
        }

        // Dependency ids only (cheap: `Task::id()` never runs anything), so
        // `register_task` can carry them even on the cache-hit path below,
        // where the deps themselves are never recursed into or run — the
        // whole point of the target-existence check is to prune that
        // subtree (§4.2.1 "Completion pre-check").
        let mut deps = Vec::new();
        flatten_task_struct(&task.requires(), &mut deps);
        let dep_ids: Vec<Uuid> = deps.iter().map(|d| d.id()).collect();

        // `register_task` must precede any lifecycle event for this task,
        // including the cache-hit ones below (§4.4 "register_task").
        self.register_task(build_id, task.as_ref(), &dep_ids).await;
        self.set_state(id, TaskState::Pending);
        let _ = self.registry.task_event(build_id, id, TaskEvent::Pending, None).await;

        // Discovery already ran `complete()` once, concurrently, for every
        // task reachable from the build's roots; reuse that answer instead
        // of issuing a second (possibly network/filesystem) existence check
        // here. Dynamically-yielded tasks were never part of that sweep, so
        // they fall through to a direct `complete()` call as before.
        let already_complete = if self.precomputed_complete.contains_key(&id) {
            true
        } else {
            task.complete().await?
        };

        if already_complete {
            self.set_state(id, TaskState::Completed);
            // §8 boundary: only emit TASK_REFERENCED when a completion is
            // already recorded elsewhere (another build, or a prior run);
            // a target that merely happens to exist gets a plain
            // TASK_COMPLETED observation instead.
            let event = match self.lock.is_completed(id).await {
                Ok(true) => TaskEvent::Referenced,
                _ => TaskEvent::Completed,
            };
            let _ = self.registry.task_event(build_id, id, event, None).await;
            return Ok(());
        }

        self.set_state(id, TaskState::WaitingStaticDeps);
        let upstream_results = join_all(deps.iter().map(|d| self.run_task(build_id, d.clone()))).await;
        let upstream_failed = upstream_results.iter().any(|r| r.is_err());

        if upstream_failed {
            match self.config.fail_mode {
                FailMode::FailFast => {
                    self.cancel.cancel();
                    self.set_state(id, TaskState::Failed);
                    return Err(TaskError::Run(anyhow::anyhow!(
                        "upstream dependency failed"
                    )));
                }
                FailMode::BestEffort => {
                    self.set_state(id, TaskState::Skipped);
                    let _ = self
                        .registry
                        .task_event(build_id, id, TaskEvent::Skipped, None)
                        .await;
                    return Err(TaskError::Run(anyhow::anyhow!(
                        "upstream dependency failed, skipped"
                    )));
                }
            }
        }

        self.acquire_and_run(build_id, task).await
    }

    async fn register_task(&self, build_id: Uuid, task: &dyn Task, dep_ids: &[Uuid]) {
        let registration = TaskRegistration {
            task_ref: TaskRef::of(task),
            payload: crate::identity::dump_transport(task),
            user_identity: self.config.user_identity.clone(),
            commit_hash: Some(self.config.commit_hash.clone()),
            dependency_ids: dep_ids.to_vec(),
        };
        if let Err(e) = self.registry.register_task(build_id, &registration).await {
            tracing::warn!(task_id = %task.id(), error = %e, "register_task failed (non-fatal)");
        }
    }

    async fn acquire_and_run(&self, build_id: Uuid, task: Arc<dyn Task>) -> Result<(), TaskError> {
        let id = task.id();
        let mut owner_id = Uuid::new_v4();
        let mut backoff = Backoff::lock_contention();
        let mut waiting_emitted = false;

        loop {
            if self.cancel.is_cancelled() {
                self.set_state(id, TaskState::Cancelled);
                return Err(TaskError::Cancelled);
            }

            self.set_state(id, TaskState::AcquiringLock);
            let acquisition = self
                .lock
                .acquire(id, owner_id, self.config.lock_ttl, self.config.check_task_completion)
                .await;

            match acquisition {
                LockAcquisition::AlreadyCompleted => {
                    self.set_state(id, TaskState::Completed);
                    let _ = self
                        .registry
                        .task_event(build_id, id, TaskEvent::Referenced, None)
                        .await;
                    return Ok(());
                }
                LockAcquisition::Acquired { .. } => {
                    match self.run_locked(build_id, task.clone(), owner_id).await {
                        // The renewal loop lost ownership of the lock while
                        // the task body was still running (§4.3.2): the run
                        // is lost, not necessarily wrong, so either retry it
                        // fresh or fail out per the configured policy rather
                        // than surfacing it as an ordinary task error.
                        Err(TaskError::LockLost) => match self.config.lock_error_policy {
                            LockErrorPolicy::FailTask => return Err(TaskError::LockLost),
                            LockErrorPolicy::TreatAsHeldByOther => {
                                owner_id = Uuid::new_v4();
                                backoff.reset();
                                continue;
                            }
                        },
                        other => return other,
                    }
                }
                LockAcquisition::HeldByOther { .. } | LockAcquisition::WorkspaceCapReached => {
                    self.set_state(id, TaskState::WaitingForLock);
                    if !waiting_emitted {
                        let _ = self
                            .registry
                            .task_event(build_id, id, TaskEvent::WaitingForLock, None)
                            .await;
                        waiting_emitted = true;
                    }
                    tokio::select! {
                        _ = self.exit_early.cancelled() => {
                            self.set_state(id, TaskState::Cancelled);
                            let _ = self
                                .registry
                                .task_event(build_id, id, TaskEvent::Cancelled, None)
                                .await;
                            return Err(TaskError::Cancelled);
                        }
                        _ = tokio::time::sleep(backoff.next_delay()) => {}
                    }
                }
                LockAcquisition::Error(msg) => match self.config.lock_error_policy {
                    LockErrorPolicy::FailTask => {
                        self.set_state(id, TaskState::Failed);
                        let _ = self
                            .registry
                            .task_event(build_id, id, TaskEvent::Failed, Some(&msg))
                            .await;
                        return Err(TaskError::Run(anyhow::anyhow!("lock error: {msg}")));
                    }
                    LockErrorPolicy::TreatAsHeldByOther => {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                },
            }
        }
    }

    async fn run_locked(
        &self,
        build_id: Uuid,
        task: Arc<dyn Task>,
        owner_id: Uuid,
    ) -> Result<(), TaskError> {
        let id = task.id();
        self.set_state(id, TaskState::Running);
        let _ = self.registry.task_event(build_id, id, TaskEvent::Started, None).await;

        let renew_cancel = CancellationToken::new();
        let lock_lost = CancellationToken::new();
        let renew_handle = self.spawn_renewal(id, owner_id, renew_cancel.clone(), lock_lost.clone());

        let (yield_tx, mut yield_rx) = mpsc::unbounded_channel();
        let runner = self.runners.get(task.execution_mode());
        let run_fut = runner.run(task.clone(), yield_tx, self.cancel.clone());
        tokio::pin!(run_fut);

        let mut suspended = false;
        let outcome = loop {
            tokio::select! {
                // The renewal loop has given up ownership of the lock: the
                // run is no longer ours to trust, regardless of what the
                // task body is still doing (§4.3.2).
                _ = lock_lost.cancelled() => break Err(TaskError::LockLost),
                result = &mut run_fut => break result,
                Some(req) = yield_rx.recv() => {
                    if !suspended {
                        self.set_state(id, TaskState::WaitingDynamicDeps);
                        let _ = self.registry.task_event(build_id, id, TaskEvent::Suspended, None).await;
                        suspended = true;
                    }
                    let mut deps = Vec::new();
                    flatten_task_struct(&req.deps, &mut deps);

                    // Detect before recursing: `run_task`'s per-id memoization
                    // would otherwise deadlock forever on a `OnceCell` whose
                    // initialization is already on this very call stack
                    // instead of failing the task (§8 dynamic-dep-cycle
                    // boundary scenario).
                    if let Some(offender) = self.extend_dep_graph_and_check_cycle(id, &deps) {
                        break Err(TaskError::Run(anyhow::anyhow!(
                            "dynamic dependency cycle: a yielded dependency transitively depends on task {offender}"
                        )));
                    }

                    let results = join_all(deps.iter().map(|d| self.run_task(build_id, d.clone()))).await;
                    let ack = if results.iter().any(|r| r.is_err()) {
                        Err(TaskError::Run(anyhow::anyhow!("a yielded dependency failed")))
                    } else {
                        Ok(())
                    };
                    let _ = req.ack.send(ack);
                    self.set_state(id, TaskState::Running);
                    let _ = self.registry.task_event(build_id, id, TaskEvent::Resumed, None).await;
                    suspended = false;
                }
            }
        };

        renew_cancel.cancel();
        let _ = renew_handle.await;

        match outcome {
            Ok(_) => {
                self.set_state(id, TaskState::UploadingAssets);
                let assets = task.registry_assets();
                if !assets.is_empty() {
                    if let Err(e) = self.registry.upload_assets(build_id, id, &assets).await {
                        tracing::warn!(task_id = %id, error = %e, "asset upload failed (non-fatal)");
                    }
                }
                if let Err(e) = self.lock.release(id, owner_id, true).await {
                    tracing::warn!(task_id = %id, error = %e, "lock release failed (non-fatal)");
                }
                self.set_state(id, TaskState::Completed);
                let _ = self.registry.task_event(build_id, id, TaskEvent::Completed, None).await;
                Ok(())
            }
            Err(e) => {
                let _ = self.lock.release(id, owner_id, false).await;
                self.set_state(id, TaskState::Failed);
                let _ = self
                    .registry
                    .task_event(build_id, id, TaskEvent::Failed, Some(&e.message()))
                    .await;
                Err(e)
            }
        }
    }

    /// Renews `task_id`'s lock every `lock_ttl / 3` until `cancel` fires
    /// (the task finished normally) or renewal itself reports the lock was
    /// lost, in which case `lock_lost` is cancelled so `run_locked`'s select
    /// loop can abandon the in-flight run instead of trusting its result
    /// (§4.3.2).
    fn spawn_renewal(
        &self,
        task_id: Uuid,
        owner_id: Uuid,
        cancel: CancellationToken,
        lock_lost: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let lock = self.lock.clone();
        let ttl = self.config.lock_ttl;
        let period = ttl / 3;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        match lock.renew(task_id, owner_id, ttl).await {
                            Ok(true) => {}
                            _ => {
                                tracing::warn!(%task_id, "lock renewal lost ownership");
                                lock_lost.cancel();
                                break;
                            }
                        }
                    }
                }
            }
        })
    }
}
