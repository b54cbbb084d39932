//! End-to-end scenarios against the in-memory engine, matching the
//! testable properties and named scenarios A/C/D/cycle-detection.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use stardag_core::build::{BuildConfig, BuildEngine, BuildError, FailMode};
use stardag_core::lock::{GlobalConcurrencyLock, InMemoryLock, LockAcquisition};
use stardag_core::registry::RecordingRegistry;
use stardag_core::task::Task;
use stardag_core::testing::demo_tasks::{Add, CyclicPartner, CyclicRoot, Mid};

#[tokio::test]
async fn scenario_a_simple_addition() {
    let left = Arc::new(Add::new(1, 2));
    let right = Arc::new(Add::new(3, 4));
    let root = Arc::new(Add::from_tasks(left.clone(), right.clone()));

    let engine = BuildEngine::new(BuildConfig::default());
    let report = engine.build(vec![root.clone() as Arc<dyn Task>]).await.unwrap();

    // Three distinct task ids: root + two leaves.
    assert_eq!(report.states.len(), 3);
    assert!(report
        .states
        .values()
        .all(|s| matches!(s, stardag_core::build::TaskState::Completed)));
}

#[tokio::test]
async fn diamond_shared_upstream_runs_once() {
    let shared = Arc::new(Add::new(5, 5));
    let via_left = Arc::new(Add::from_tasks(shared.clone(), shared.clone()));

    let engine = BuildEngine::new(BuildConfig::default());
    let report = engine.build(vec![via_left.clone() as Arc<dyn Task>]).await.unwrap();

    // `shared` only ever gets one task-id/state-table entry, regardless of
    // how many edges point at it.
    assert_eq!(report.states.len(), 2);
}

#[tokio::test]
async fn scenario_c_dynamic_deps_resume_in_order() {
    let mid = Arc::new(Mid::new(10, 32));
    let registry = Arc::new(RecordingRegistry::new());
    let lock = Arc::new(InMemoryLock::new());

    let engine = BuildEngine::with_collaborators(lock, registry.clone(), BuildConfig::default());
    let report = engine.build(vec![mid.clone() as Arc<dyn Task>]).await.unwrap();

    assert_eq!(report.states.len(), 3); // Mid + 2 Leaf tasks
    let events = registry.events();

    let suspended_idx = events.iter().position(|e| e.contains("Suspended")).unwrap();
    let resumed_idx = events.iter().position(|e| e.contains("Resumed")).unwrap();
    let mid_completed_idx = events
        .iter()
        .rposition(|e| e.starts_with("Completed") && e.contains(&mid.id().to_string()))
        .unwrap();

    assert!(suspended_idx < resumed_idx);
    assert!(resumed_idx < mid_completed_idx);
}

#[tokio::test]
async fn best_effort_skips_downstream_of_a_failed_task() {
    struct AlwaysFails;

    #[async_trait::async_trait]
    impl Task for AlwaysFails {
        fn type_id(&self) -> stardag_core::identity::TypeId {
            stardag_core::identity::TypeId::new("stardag.tests", "AlwaysFails")
        }
        fn params(&self) -> Vec<stardag_core::param::Param> {
            vec![]
        }
        async fn run(
            &self,
            _ctx: &mut dyn stardag_core::run::RunContext,
        ) -> Result<stardag_core::run::RunOutcome, stardag_core::run::TaskError> {
            Err(stardag_core::run::TaskError::Run(anyhow::anyhow!("boom")))
        }
    }

    let failing = Arc::new(AlwaysFails);
    let downstream = Arc::new(Add::new(1, 1));
    // downstream has no real dependency on `failing` via requires() since
    // Add's operands are fixed; instead drive both as independent roots to
    // assert failure in one branch doesn't prevent the other from completing.
    let config = BuildConfig {
        fail_mode: FailMode::BestEffort,
        ..Default::default()
    };
    let engine = BuildEngine::new(config);
    let roots: Vec<Arc<dyn Task>> = vec![failing, downstream.clone()];
    let result = engine.build(roots).await;

    assert!(result.is_err());
    // The independent branch still completed.
    assert!(downstream.output().unwrap().exists().await.unwrap());
}

#[tokio::test]
async fn lock_contention_between_two_builds_runs_task_once() {
    let lock = Arc::new(InMemoryLock::new());
    let registry_x = Arc::new(RecordingRegistry::new());
    let registry_y = Arc::new(RecordingRegistry::new());

    let shared_for_x = Arc::new(Add::new(7, 8));
    let shared_for_y = Arc::new(Add::new(7, 8)); // same params -> same id

    assert_eq!(shared_for_x.id(), shared_for_y.id());

    let engine_x =
        BuildEngine::with_collaborators(lock.clone(), registry_x.clone(), BuildConfig::default());
    let engine_y =
        BuildEngine::with_collaborators(lock.clone(), registry_y.clone(), BuildConfig::default());

    let (rx, ry) = tokio::join!(
        engine_x.build(vec![shared_for_x.clone() as Arc<dyn Task>]),
        engine_y.build(vec![shared_for_y.clone() as Arc<dyn Task>]),
    );

    rx.unwrap();
    ry.unwrap();

    let x_ran = registry_x.events().iter().any(|e| e.starts_with("Started"));
    let y_ran = registry_y.events().iter().any(|e| e.starts_with("Started"));
    // Exactly one of the two builds actually executed the task; the other
    // observed it already completed.
    assert_ne!(x_ran, y_ran);
}

#[tokio::test]
async fn dynamic_dep_cycle_fails_the_yielding_task() {
    let root = Arc::new(CyclicRoot::new("root"));
    let partner = Arc::new(CyclicPartner::new("partner", root.clone()));
    root.bind_partner(partner.clone());

    let engine = BuildEngine::new(BuildConfig::default());
    let result = engine.build(vec![root.clone() as Arc<dyn Task>]).await;

    // The cycle is only introduced once `root` yields `partner` mid-run, so
    // discovery (over the static graph alone) doesn't see it; the scheduler
    // must detect it on that dynamic extension instead of hanging forever.
    assert!(matches!(result, Err(BuildError::TaskFailures(1))));
}

#[tokio::test(start_paused = true)]
async fn exit_early_when_remaining_work_is_held_by_another_build() {
    let lock = Arc::new(InMemoryLock::new());
    let registry = Arc::new(RecordingRegistry::new());

    let task = Arc::new(Add::new(100, 200));
    // Simulate a different build instance holding the lock for the whole
    // test (a long TTL it never releases).
    let other_owner = Uuid::new_v4();
    let acquired = lock
        .acquire(task.id(), other_owner, Duration::from_secs(3600), true)
        .await;
    assert!(matches!(acquired, LockAcquisition::Acquired { .. }));

    let config = BuildConfig {
        exit_early_after: Some(Duration::from_secs(2)),
        ..Default::default()
    };
    let engine = BuildEngine::with_collaborators(lock, registry.clone(), config);

    let result = engine.build(vec![task.clone() as Arc<dyn Task>]).await;
    assert!(matches!(result, Err(BuildError::ExitEarly)));
    assert!(registry.events().iter().any(|e| e.starts_with("Cancelled")));
}
