//! The `Target` capability: a task's persisted output, checked for
//! existence by the scheduler's completion pre-check (§3 "Target", §4.2).

use async_trait::async_trait;
use std::sync::{Arc, RwLock};

/// A handle to wherever a task's result lives. Stardag treats the contents
/// opaquely — serializer selection is the task's concern — the engine only
/// ever calls `exists()`.
#[async_trait]
pub trait Target: Send + Sync + std::fmt::Debug {
    async fn exists(&self) -> Result<bool, anyhow::Error>;
}

/// An in-memory target backed by a shared cell, used by the reference
/// in-memory store and by tests. Mirrors the teacher's in-memory store
/// pattern (a `RwLock`-guarded map standing in for a durable backend).
#[derive(Debug, Clone, Default)]
pub struct MemoryTarget<T> {
    cell: Arc<RwLock<Option<T>>>,
}

impl<T: Clone + Send + Sync + std::fmt::Debug + 'static> MemoryTarget<T> {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(RwLock::new(None)),
        }
    }

    pub fn write(&self, value: T) {
        *self.cell.write().expect("memory target lock poisoned") = Some(value);
    }

    pub fn load(&self) -> Option<T> {
        self.cell.read().expect("memory target lock poisoned").clone()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + std::fmt::Debug + 'static> Target for MemoryTarget<T> {
    async fn exists(&self) -> Result<bool, anyhow::Error> {
        Ok(self.cell.read().expect("memory target lock poisoned").is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_target_round_trips() {
        let target: MemoryTarget<i64> = MemoryTarget::new();
        assert!(!target.exists().await.unwrap());
        target.write(42);
        assert!(target.exists().await.unwrap());
        assert_eq!(target.load(), Some(42));
    }
}
