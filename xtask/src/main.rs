use std::sync::Arc;
use std::time::{Duration, Instant};

use stardag_core::build::{BuildConfig, BuildEngine};
use stardag_core::task::Task;
use stardag_core::testing::demo_tasks::{Add, FanInOperand, Mid, SlowFanIn, SlowLeaf};
use tracing_subscriber::EnvFilter;

/// Runs the reference demo DAGs against the in-memory engine: a
/// static-dependency diamond (`Add`), a dynamic-dependency DAG (`Mid`
/// yielding two `Leaf` tasks mid-run), and the wide-fan-out/deep-chain
/// benchmark DAGs ported from `original_source`'s `benchmarks/dags.py`.
/// Prints task counts, wall time, and final outputs so a human can eyeball
/// a real build end to end without standing up a registry or lock backend.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    run_addition_scenario().await?;
    run_dynamic_deps_scenario().await?;
    run_wide_fan_out_benchmark().await?;
    run_tree_benchmark().await?;

    Ok(())
}

async fn run_addition_scenario() -> anyhow::Result<()> {
    let left = Arc::new(Add::new(1, 2));
    let right = Arc::new(Add::new(3, 4));
    let root = Arc::new(Add::from_tasks(left, right));
    let root_id = root.id();

    let config = BuildConfig {
        description: "xtask demo: simple addition".to_string(),
        ..Default::default()
    };
    let engine = BuildEngine::new(config);
    let report = engine.build(vec![root.clone()]).await?;

    tracing::info!(
        build_id = %report.build_id,
        tasks = report.states.len(),
        root = %root_id,
        "addition scenario complete",
    );
    Ok(())
}

async fn run_dynamic_deps_scenario() -> anyhow::Result<()> {
    let mid = Arc::new(Mid::new(10, 32));
    let mid_id = mid.id();

    let config = BuildConfig {
        description: "xtask demo: dynamic deps".to_string(),
        ..Default::default()
    };
    let engine = BuildEngine::new(config);
    let report = engine.build(vec![mid.clone()]).await?;

    tracing::info!(
        build_id = %report.build_id,
        tasks = report.states.len(),
        mid = %mid_id,
        "dynamic-deps scenario complete",
    );
    Ok(())
}

/// Ports `io_bound_flat` from `original_source`'s benchmark DAG factory:
/// one root depends on many independent, concurrently-completing leaves.
/// With the default concurrency the wall time should track the leaf sleep
/// duration, not `leaf_count * sleep`, demonstrating that the scheduler's
/// completion pre-check and dispatch loop genuinely run leaves in
/// parallel rather than serializing them (§4.2.3 step 2).
async fn run_wide_fan_out_benchmark() -> anyhow::Result<()> {
    const LEAF_COUNT: usize = 50;
    let sleep = Duration::from_millis(20);

    let leaves: Vec<FanInOperand> = (0..LEAF_COUNT)
        .map(|i| FanInOperand::Leaf(Arc::new(SlowLeaf::new(i as i64, sleep))))
        .collect();
    let root = Arc::new(SlowFanIn::new(leaves, sleep));

    let config = BuildConfig {
        description: "xtask benchmark: wide fan-out".to_string(),
        ..Default::default()
    };
    let engine = BuildEngine::new(config);

    let started = Instant::now();
    let report = engine.build(vec![root.clone()]).await?;
    let elapsed = started.elapsed();

    tracing::info!(
        build_id = %report.build_id,
        tasks = report.states.len(),
        leaf_count = LEAF_COUNT,
        elapsed_ms = elapsed.as_millis(),
        "wide fan-out benchmark complete",
    );
    Ok(())
}

/// Ports `create_tree_dag` from `original_source`'s benchmark DAG factory:
/// a 3-level binary tree (8 leaves, 4 middle, 2 intermediate, 1 root; 15
/// tasks total), exercising multi-level static dependency fan-in rather
/// than the single-level fan-out above.
async fn run_tree_benchmark() -> anyhow::Result<()> {
    let sleep = Duration::from_millis(5);
    let leaves: Vec<Arc<SlowLeaf>> = (0..8)
        .map(|i| Arc::new(SlowLeaf::new(i as i64, sleep)))
        .collect();
    let middle: Vec<Arc<SlowFanIn>> = leaves
        .chunks(2)
        .map(|pair| {
            Arc::new(SlowFanIn::new(
                vec![FanInOperand::Leaf(pair[0].clone()), FanInOperand::Leaf(pair[1].clone())],
                sleep,
            ))
        })
        .collect();
    let intermediate: Vec<Arc<SlowFanIn>> = middle
        .chunks(2)
        .map(|pair| {
            Arc::new(SlowFanIn::new(
                vec![FanInOperand::Node(pair[0].clone()), FanInOperand::Node(pair[1].clone())],
                sleep,
            ))
        })
        .collect();
    let root = Arc::new(SlowFanIn::new(
        intermediate.into_iter().map(FanInOperand::Node).collect(),
        sleep,
    ));

    let config = BuildConfig {
        description: "xtask benchmark: tree fan-in".to_string(),
        ..Default::default()
    };
    let engine = BuildEngine::new(config);

    let started = Instant::now();
    let report = engine.build(vec![root.clone()]).await?;
    let elapsed = started.elapsed();

    tracing::info!(
        build_id = %report.build_id,
        tasks = report.states.len(),
        elapsed_ms = elapsed.as_millis(),
        "tree fan-in benchmark complete",
    );
    Ok(())
}
