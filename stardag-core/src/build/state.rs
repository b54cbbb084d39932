//! The per-task state machine driven by the scheduler loop (§4.2.3).

/// A task's position in the build's lifecycle. Transitions are driven
/// exclusively by [`super::scheduler::BuildEngine`]; nothing else mutates
/// this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    New,
    Pending,
    WaitingStaticDeps,
    AcquiringLock,
    WaitingForLock,
    Running,
    WaitingDynamicDeps,
    UploadingAssets,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Skipped | TaskState::Cancelled
        )
    }
}
