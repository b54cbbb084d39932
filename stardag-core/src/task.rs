//! The `Task` trait and the structural shape of dependency declarations
//! (§3, §4.1, §4.2).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::identity::{compute_task_id, TypeId};
use crate::param::Param;
use crate::run::{ExecutionMode, RegistryAsset, RunContext, RunOutcome, TaskError};
use crate::target::Target;

/// The shape `requires()` (and a dynamic yield) may take: a single task, an
/// ordered sequence, or a string-keyed mapping, any of which may nest
/// (§3 "Dependency declaration").
#[derive(Clone)]
pub enum TaskStruct {
    None,
    Single(Arc<dyn Task>),
    List(Vec<TaskStruct>),
    Map(BTreeMap<String, TaskStruct>),
}

impl TaskStruct {
    pub fn of(task: Arc<dyn Task>) -> Self {
        TaskStruct::Single(task)
    }

    pub fn from_list(tasks: impl IntoIterator<Item = Arc<dyn Task>>) -> Self {
        TaskStruct::List(tasks.into_iter().map(TaskStruct::Single).collect())
    }
}

/// Flatten an arbitrarily nested `TaskStruct` into the set of tasks it
/// references, in a stable depth-first, left-to-right order (duplicates by
/// id are kept; callers that need a set should dedupe on `task.id()`).
pub fn flatten_task_struct(s: &TaskStruct, out: &mut Vec<Arc<dyn Task>>) {
    match s {
        TaskStruct::None => {}
        TaskStruct::Single(t) => out.push(t.clone()),
        TaskStruct::List(items) => {
            for item in items {
                flatten_task_struct(item, out);
            }
        }
        TaskStruct::Map(map) => {
            // BTreeMap already iterates in sorted key order, which is what
            // makes this flattening deterministic.
            for item in map.values() {
                flatten_task_struct(item, out);
            }
        }
    }
}

/// A lightweight, serializable handle to a task: enough to re-identify it
/// without carrying the full parameter payload. Used for logging and for
/// registry event bodies (ported from `original_source`'s `_task.py::TaskRef`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub id: Uuid,
}

impl TaskRef {
    pub fn of(task: &dyn Task) -> Self {
        let type_id = task.type_id();
        Self {
            namespace: type_id.namespace,
            name: type_id.name,
            version: task.version().to_string(),
            id: task.id(),
        }
    }

    /// A short, human-legible label: `name@version#id8`, used in log lines
    /// and the xtask demo's progress output.
    pub fn slug(&self) -> String {
        let short_id = self.id.simple().to_string();
        format!("{}@{}#{}", self.name, self.version, &short_id[..8])
    }
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slug())
    }
}

/// The central unit of work (§3 "Task"). A task is a typed, named,
/// versioned bundle of parameters whose `requires()` and dynamic `run()`
/// yields describe its place in a dependency graph, and whose `output()`
/// (if any) is the target the scheduler checks for completeness.
///
/// Implementors are expected to be cheap `Clone`-free value types wrapped
/// in `Arc` at construction (task instances flow through the scheduler by
/// `Arc<dyn Task>`); `id()` is derived from `params()` and is expected to be
/// stable for a given set of parameter values, so implementors SHOULD cache
/// it (e.g. behind a `once_cell::sync::OnceCell` field) rather than
/// recomputing the canonical JSON dump on every call.
#[async_trait]
pub trait Task: Send + Sync + std::fmt::Debug {
    /// `(namespace, name)` — the polymorphic discriminator (§4.1).
    fn type_id(&self) -> TypeId;

    /// Schema version string; included in the hash-mode dump so that a
    /// version bump invalidates cached ids (§4.1 rule 2).
    fn version(&self) -> &str {
        "1"
    }

    /// The task's own parameters, in declaration order. Order does not
    /// affect the id (hash-mode serialization re-sorts into a JSON object),
    /// but stable order makes `params()` useful for logging too.
    fn params(&self) -> Vec<Param>;

    /// Static upstream dependencies, resolved once at discovery time.
    fn requires(&self) -> TaskStruct {
        TaskStruct::None
    }

    /// The target this task persists its result to, if any. Pure
    /// side-effect tasks (no persisted output) return `None`.
    fn output(&self) -> Option<Arc<dyn Target>> {
        None
    }

    /// Whether this task's output already exists. Default defers to
    /// `output().exists()`; override to express a custom completeness
    /// check independent of `output()` (spec §4.2 "complete()").
    async fn complete(&self) -> Result<bool, TaskError> {
        match self.output() {
            Some(target) => target.exists().await.map_err(TaskError::Target),
            None => Ok(false),
        }
    }

    /// Which runner family should execute this task (§4.3). Default is the
    /// cheapest, in-process option.
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Cooperative
    }

    /// Assets to upload to the registry after a successful run (§4.4),
    /// e.g. a markdown report or structured metrics blob. Default: none.
    fn registry_assets(&self) -> Vec<RegistryAsset> {
        Vec::new()
    }

    /// Execute the task body. May yield dynamic dependencies through
    /// `ctx.yield_deps(..)` any number of times before returning; the
    /// scheduler guarantees every yielded dependency is complete by the
    /// time the corresponding `yield_deps` call resolves (§4.2, §9).
    ///
    /// Returns `Ok(RunOutcome::Done)` on normal completion with no further
    /// action needed from the caller (the task is responsible for writing
    /// its own `output()`, if any, before returning).
    async fn run(&self, ctx: &mut dyn RunContext) -> Result<RunOutcome, TaskError>;

    /// Derived, cached-by-convention identity (§4.1). The default
    /// implementation recomputes the canonical hash on every call; override
    /// with a memoized field when a task is on a hot path (see
    /// `testing::demo_tasks` for the pattern).
    fn id(&self) -> Uuid {
        compute_task_id(self)
    }
}
