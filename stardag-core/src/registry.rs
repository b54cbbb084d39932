//! The registry client contract (§4.4): an append-only event log the
//! engine writes to and never reads derived state from.

use async_trait::async_trait;
use serde_json::Value as Json;
use uuid::Uuid;

use crate::run::RegistryAsset;
use crate::task::TaskRef;

/// Task-level event kinds, exhaustive per §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Pending,
    Referenced,
    Started,
    Suspended,
    Resumed,
    WaitingForLock,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

/// Build-level event kinds, exhaustive per §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildEvent {
    Started,
    Completed,
    Failed,
    Cancelled,
    ExitEarly,
}

/// What `register_task` uploads before any lifecycle event for that task
/// may be emitted (§4.4 "register_task").
pub struct TaskRegistration {
    pub task_ref: TaskRef,
    pub payload: Json,
    pub user_identity: Option<String>,
    pub commit_hash: Option<String>,
    pub dependency_ids: Vec<Uuid>,
}

/// Append-only event-log client. Every method is fire-and-forget by
/// default (errors are logged, never propagated to fail a build) except
/// where a concrete implementation is configured strict for
/// `register_task`/asset upload (§4.4 "Error tolerance").
#[async_trait]
pub trait Registry: Send + Sync {
    async fn start_build(&self, root_task_ids: &[Uuid], description: &str) -> anyhow::Result<Uuid>;

    async fn register_task(
        &self,
        build_id: Uuid,
        registration: &TaskRegistration,
    ) -> anyhow::Result<()>;

    async fn task_event(&self, build_id: Uuid, task_id: Uuid, event: TaskEvent, error_message: Option<&str>)
        -> anyhow::Result<()>;

    async fn build_event(&self, build_id: Uuid, event: BuildEvent) -> anyhow::Result<()>;

    async fn upload_assets(
        &self,
        build_id: Uuid,
        task_id: Uuid,
        assets: &[RegistryAsset],
    ) -> anyhow::Result<()>;
}

/// The null implementation: the engine selects this when no registry is
/// configured. Correctness of a build never depends on a registry being
/// present (§4.4 "No-op registry").
#[derive(Debug, Default)]
pub struct NoOpRegistry;

#[async_trait]
impl Registry for NoOpRegistry {
    async fn start_build(&self, _root_task_ids: &[Uuid], _description: &str) -> anyhow::Result<Uuid> {
        Ok(Uuid::new_v4())
    }

    async fn register_task(
        &self,
        _build_id: Uuid,
        _registration: &TaskRegistration,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn task_event(
        &self,
        _build_id: Uuid,
        _task_id: Uuid,
        _event: TaskEvent,
        _error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn build_event(&self, _build_id: Uuid, _event: BuildEvent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn upload_assets(
        &self,
        _build_id: Uuid,
        _task_id: Uuid,
        _assets: &[RegistryAsset],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An in-memory recording registry used by tests to assert event ordering
/// (scenarios A/C/D in §8) without a network dependency.
#[derive(Default)]
pub struct RecordingRegistry {
    events: std::sync::Mutex<Vec<String>>,
}

impl RecordingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("poisoned").clone()
    }

    fn push(&self, line: String) {
        self.events.lock().expect("poisoned").push(line);
    }
}

#[async_trait]
impl Registry for RecordingRegistry {
    async fn start_build(&self, _root_task_ids: &[Uuid], _description: &str) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        self.push(format!("BUILD_STARTED {id}"));
        Ok(id)
    }

    async fn register_task(
        &self,
        _build_id: Uuid,
        registration: &TaskRegistration,
    ) -> anyhow::Result<()> {
        self.push(format!("REGISTER_TASK {}", registration.task_ref.id));
        Ok(())
    }

    async fn task_event(
        &self,
        _build_id: Uuid,
        task_id: Uuid,
        event: TaskEvent,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        match error_message {
            Some(msg) => self.push(format!("{event:?} {task_id} ({msg})")),
            None => self.push(format!("{event:?} {task_id}")),
        }
        Ok(())
    }

    async fn build_event(&self, build_id: Uuid, event: BuildEvent) -> anyhow::Result<()> {
        self.push(format!("{event:?} {build_id}"));
        Ok(())
    }

    async fn upload_assets(
        &self,
        _build_id: Uuid,
        task_id: Uuid,
        assets: &[RegistryAsset],
    ) -> anyhow::Result<()> {
        self.push(format!("UPLOAD_ASSETS {task_id} ({} assets)", assets.len()));
        Ok(())
    }
}
