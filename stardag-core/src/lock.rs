//! The global concurrency lock protocol (§4.3): acquire/renew/release a
//! task-scoped lock so that, across all concurrent builds in a workspace,
//! each task id executes at most once.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use uuid::Uuid;

/// Outcome of an `acquire` call (§4.3.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    Acquired {
        acquired_at: i64,
        expires_at: i64,
        version: u64,
    },
    AlreadyCompleted,
    HeldByOther {
        owner_id: Uuid,
    },
    WorkspaceCapReached,
    /// All retries exhausted on a transient RPC failure (§4.3.3).
    Error(String),
}

/// Addressed by `task_id` and `owner_id`; `owner_id` is chosen once per
/// task per scheduler instance and reused across every retry of that task
/// (§4.3.1).
#[async_trait]
pub trait GlobalConcurrencyLock: Send + Sync {
    async fn acquire(
        &self,
        task_id: Uuid,
        owner_id: Uuid,
        ttl: Duration,
        check_task_completion: bool,
    ) -> LockAcquisition;

    /// Extend `expires_at`; `Ok(true)` renewed, `Ok(false)` lock vanished or
    /// is owned by someone else.
    async fn renew(&self, task_id: Uuid, owner_id: Uuid, ttl: Duration) -> Result<bool, String>;

    /// Release; when `task_completed` is set, the implementation should
    /// atomically also record the completion so concurrent `acquire` calls
    /// with `check_task_completion` observe `AlreadyCompleted`.
    async fn release(
        &self,
        task_id: Uuid,
        owner_id: Uuid,
        task_completed: bool,
    ) -> Result<bool, String>;

    async fn is_completed(&self, task_id: Uuid) -> Result<bool, String>;
}

/// A lock that never contends: every `acquire` succeeds immediately for the
/// calling owner. Appropriate for single-build, single-process use where
/// no external coordination is needed (mirrors the teacher's `NoOp` store
/// pattern for optional collaborators).
#[derive(Debug, Default)]
pub struct NoOpLock;

#[async_trait]
impl GlobalConcurrencyLock for NoOpLock {
    async fn acquire(
        &self,
        _task_id: Uuid,
        _owner_id: Uuid,
        ttl: Duration,
        _check_task_completion: bool,
    ) -> LockAcquisition {
        let now = now_unix();
        LockAcquisition::Acquired {
            acquired_at: now,
            expires_at: now + ttl.as_secs() as i64,
            version: 1,
        }
    }

    async fn renew(&self, _task_id: Uuid, _owner_id: Uuid, _ttl: Duration) -> Result<bool, String> {
        Ok(true)
    }

    async fn release(
        &self,
        _task_id: Uuid,
        _owner_id: Uuid,
        _task_completed: bool,
    ) -> Result<bool, String> {
        Ok(true)
    }

    async fn is_completed(&self, _task_id: Uuid) -> Result<bool, String> {
        Ok(false)
    }
}

struct LockRecord {
    owner_id: Uuid,
    expires_at: SystemTime,
    version: u64,
}

/// An in-process, in-memory lock implementing the full state machine from
/// §4.3.1, used by tests that simulate cross-build contention (scenarios D
/// and F) without a network round trip.
#[derive(Default)]
pub struct InMemoryLock {
    locks: Mutex<HashMap<Uuid, LockRecord>>,
    completed: Mutex<std::collections::HashSet<Uuid>>,
    workspace_cap: Option<usize>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            completed: Mutex::new(std::collections::HashSet::new()),
            workspace_cap: None,
        }
    }

    pub fn with_workspace_cap(cap: usize) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            completed: Mutex::new(std::collections::HashSet::new()),
            workspace_cap: Some(cap),
        }
    }
}

#[async_trait]
impl GlobalConcurrencyLock for InMemoryLock {
    async fn acquire(
        &self,
        task_id: Uuid,
        owner_id: Uuid,
        ttl: Duration,
        check_task_completion: bool,
    ) -> LockAcquisition {
        if check_task_completion && self.completed.lock().expect("poisoned").contains(&task_id) {
            return LockAcquisition::AlreadyCompleted;
        }

        let mut locks = self.locks.lock().expect("poisoned");
        let now = SystemTime::now();

        if let Some(existing) = locks.get(&task_id) {
            let expired = existing.expires_at <= now;
            if !expired && existing.owner_id != owner_id {
                return LockAcquisition::HeldByOther {
                    owner_id: existing.owner_id,
                };
            }
        } else if let Some(cap) = self.workspace_cap {
            if locks.len() >= cap {
                return LockAcquisition::WorkspaceCapReached;
            }
        }

        let version = locks.get(&task_id).map(|r| r.version + 1).unwrap_or(1);
        locks.insert(
            task_id,
            LockRecord {
                owner_id,
                expires_at: now + ttl,
                version,
            },
        );
        LockAcquisition::Acquired {
            acquired_at: now_unix(),
            expires_at: now_unix() + ttl.as_secs() as i64,
            version,
        }
    }

    async fn renew(&self, task_id: Uuid, owner_id: Uuid, ttl: Duration) -> Result<bool, String> {
        let mut locks = self.locks.lock().expect("poisoned");
        match locks.get_mut(&task_id) {
            Some(record) if record.owner_id == owner_id => {
                record.expires_at = SystemTime::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(
        &self,
        task_id: Uuid,
        owner_id: Uuid,
        task_completed: bool,
    ) -> Result<bool, String> {
        let mut locks = self.locks.lock().expect("poisoned");
        match locks.get(&task_id) {
            Some(record) if record.owner_id == owner_id => {
                locks.remove(&task_id);
                if task_completed {
                    self.completed.lock().expect("poisoned").insert(task_id);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_completed(&self, task_id: Uuid) -> Result<bool, String> {
        Ok(self.completed.lock().expect("poisoned").contains(&task_id))
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_owner_is_held_by_other_until_release() {
        let lock = InMemoryLock::new();
        let task = Uuid::new_v4();
        let owner_x = Uuid::new_v4();
        let owner_y = Uuid::new_v4();

        let acquired = lock.acquire(task, owner_x, Duration::from_secs(30), true).await;
        assert!(matches!(acquired, LockAcquisition::Acquired { .. }));

        let blocked = lock.acquire(task, owner_y, Duration::from_secs(30), true).await;
        assert!(matches!(blocked, LockAcquisition::HeldByOther { owner_id } if owner_id == owner_x));

        assert!(lock.release(task, owner_x, true).await.unwrap());

        let after = lock.acquire(task, owner_y, Duration::from_secs(30), true).await;
        assert_eq!(after, LockAcquisition::AlreadyCompleted);
    }

    #[tokio::test]
    async fn workspace_cap_blocks_new_locks() {
        let lock = InMemoryLock::with_workspace_cap(1);
        let owner_a = Uuid::new_v4();
        let owner_b = Uuid::new_v4();

        let first = lock
            .acquire(Uuid::new_v4(), owner_a, Duration::from_secs(30), false)
            .await;
        assert!(matches!(first, LockAcquisition::Acquired { .. }));

        let second = lock
            .acquire(Uuid::new_v4(), owner_b, Duration::from_secs(30), false)
            .await;
        assert_eq!(second, LockAcquisition::WorkspaceCapReached);
    }
}
