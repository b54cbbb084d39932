//! Reference task types exercising the model end to end: `Add` (static
//! deps, scenario A/B) and `Leaf`/`Mid` (dynamic deps, scenario C).

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use uuid::Uuid;

use crate::identity::{compute_task_id, TypeId};
use crate::param::{Param, ParamValue};
use crate::run::{RunContext, RunOutcome, TaskError};
use crate::target::{MemoryTarget, Target};
use crate::task::{Task, TaskStruct};

#[derive(Clone, Debug)]
pub enum Operand {
    Literal(i64),
    Task(Arc<Add>),
}

/// Saves `a + b` to its target. `a`/`b` are each either a literal or
/// another `Add` task, matching the recursive shape of scenario A/B.
#[derive(Debug)]
pub struct Add {
    a: Operand,
    b: Operand,
    target: MemoryTarget<i64>,
    id: OnceLock<Uuid>,
}

impl Add {
    pub fn new(a: i64, b: i64) -> Self {
        Self {
            a: Operand::Literal(a),
            b: Operand::Literal(b),
            target: MemoryTarget::new(),
            id: OnceLock::new(),
        }
    }

    pub fn from_tasks(a: Arc<Add>, b: Arc<Add>) -> Self {
        Self {
            a: Operand::Task(a),
            b: Operand::Task(b),
            target: MemoryTarget::new(),
            id: OnceLock::new(),
        }
    }

    fn operand_param(op: &Operand) -> ParamValue {
        match op {
            Operand::Literal(v) => ParamValue::Int(*v),
            Operand::Task(t) => ParamValue::Task(t.clone()),
        }
    }

    async fn operand_value(op: &Operand) -> i64 {
        match op {
            Operand::Literal(v) => *v,
            // Static deps are guaranteed complete before this task runs
            // (§4.2.5), so the target is always populated here.
            Operand::Task(t) => t.target.load().expect("upstream Add did not write its target"),
        }
    }
}

#[async_trait]
impl Task for Add {
    fn type_id(&self) -> TypeId {
        TypeId::new("stardag.testing.demo_tasks", "Add")
    }

    fn params(&self) -> Vec<Param> {
        vec![
            Param::new("a", Self::operand_param(&self.a)),
            Param::new("b", Self::operand_param(&self.b)),
        ]
    }

    fn requires(&self) -> TaskStruct {
        let mut upstream = Vec::new();
        if let Operand::Task(t) = &self.a {
            upstream.push(TaskStruct::Single(t.clone()));
        }
        if let Operand::Task(t) = &self.b {
            upstream.push(TaskStruct::Single(t.clone()));
        }
        TaskStruct::List(upstream)
    }

    fn output(&self) -> Option<Arc<dyn Target>> {
        Some(Arc::new(self.target.clone()))
    }

    async fn run(&self, _ctx: &mut dyn RunContext) -> Result<RunOutcome, TaskError> {
        let sum = Self::operand_value(&self.a).await + Self::operand_value(&self.b).await;
        self.target.write(sum);
        Ok(RunOutcome::Done)
    }

    fn id(&self) -> Uuid {
        *self.id.get_or_init(|| compute_task_id(self))
    }
}

/// Saves a fixed value. Used as a dynamically-yielded leaf in `Mid`.
#[derive(Debug)]
pub struct Leaf {
    value: i64,
    target: MemoryTarget<i64>,
    id: OnceLock<Uuid>,
}

impl Leaf {
    pub fn new(value: i64) -> Self {
        Self {
            value,
            target: MemoryTarget::new(),
            id: OnceLock::new(),
        }
    }
}

#[async_trait]
impl Task for Leaf {
    fn type_id(&self) -> TypeId {
        TypeId::new("stardag.testing.demo_tasks", "Leaf")
    }

    fn params(&self) -> Vec<Param> {
        vec![Param::new("value", ParamValue::Int(self.value))]
    }

    fn output(&self) -> Option<Arc<dyn Target>> {
        Some(Arc::new(self.target.clone()))
    }

    async fn run(&self, _ctx: &mut dyn RunContext) -> Result<RunOutcome, TaskError> {
        self.target.write(self.value);
        Ok(RunOutcome::Done)
    }

    fn id(&self) -> Uuid {
        *self.id.get_or_init(|| compute_task_id(self))
    }
}

/// Saves a fixed value after an async sleep, standing in for the IO-bound
/// workload in `original_source`'s benchmark DAGs (tree/flat fan-out over
/// many concurrently-completing leaves, §4.2.3 step 2).
#[derive(Debug)]
pub struct SlowLeaf {
    value: i64,
    sleep: std::time::Duration,
    target: MemoryTarget<i64>,
    id: OnceLock<Uuid>,
}

impl SlowLeaf {
    pub fn new(value: i64, sleep: std::time::Duration) -> Self {
        Self {
            value,
            sleep,
            target: MemoryTarget::new(),
            id: OnceLock::new(),
        }
    }
}

#[async_trait]
impl Task for SlowLeaf {
    fn type_id(&self) -> TypeId {
        TypeId::new("stardag.testing.demo_tasks", "SlowLeaf")
    }

    fn params(&self) -> Vec<Param> {
        vec![Param::new("value", ParamValue::Int(self.value))]
    }

    fn output(&self) -> Option<Arc<dyn Target>> {
        Some(Arc::new(self.target.clone()))
    }

    async fn run(&self, _ctx: &mut dyn RunContext) -> Result<RunOutcome, TaskError> {
        tokio::time::sleep(self.sleep).await;
        self.target.write(self.value);
        Ok(RunOutcome::Done)
    }

    fn id(&self) -> Uuid {
        *self.id.get_or_init(|| compute_task_id(self))
    }
}

/// Sums an arbitrary number of `SlowLeaf`/`SlowFanIn` upstreams, so a
/// tree/fan-out benchmark DAG can be built to any width and depth without
/// a fixed two-operand shape (unlike `Add`). Each upstream is either a leaf
/// value or another fan-in level, mirroring `create_tree_dag`'s middle/
/// intermediate/root levels.
#[derive(Clone, Debug)]
pub enum FanInOperand {
    Leaf(Arc<SlowLeaf>),
    Node(Arc<SlowFanIn>),
}

impl FanInOperand {
    fn as_task(&self) -> Arc<dyn Task> {
        match self {
            FanInOperand::Leaf(t) => t.clone(),
            FanInOperand::Node(t) => t.clone(),
        }
    }

    fn value(&self) -> i64 {
        match self {
            FanInOperand::Leaf(t) => t.target.load().expect("upstream leaf did not write its target"),
            FanInOperand::Node(t) => t.target.load().expect("upstream fan-in did not write its target"),
        }
    }
}

#[derive(Debug)]
pub struct SlowFanIn {
    operands: Vec<FanInOperand>,
    sleep: std::time::Duration,
    target: MemoryTarget<i64>,
    id: OnceLock<Uuid>,
}

impl SlowFanIn {
    pub fn new(operands: Vec<FanInOperand>, sleep: std::time::Duration) -> Self {
        Self {
            operands,
            sleep,
            target: MemoryTarget::new(),
            id: OnceLock::new(),
        }
    }
}

#[async_trait]
impl Task for SlowFanIn {
    fn type_id(&self) -> TypeId {
        TypeId::new("stardag.testing.demo_tasks", "SlowFanIn")
    }

    fn params(&self) -> Vec<Param> {
        vec![Param::new(
            "operands",
            ParamValue::List(self.operands.iter().map(|op| ParamValue::Task(op.as_task())).collect()),
        )]
    }

    fn requires(&self) -> TaskStruct {
        TaskStruct::List(self.operands.iter().map(|op| TaskStruct::Single(op.as_task())).collect())
    }

    fn output(&self) -> Option<Arc<dyn Target>> {
        Some(Arc::new(self.target.clone()))
    }

    async fn run(&self, _ctx: &mut dyn RunContext) -> Result<RunOutcome, TaskError> {
        tokio::time::sleep(self.sleep).await;
        let sum: i64 = self.operands.iter().map(FanInOperand::value).sum();
        self.target.write(sum);
        Ok(RunOutcome::Done)
    }

    fn id(&self) -> Uuid {
        *self.id.get_or_init(|| compute_task_id(self))
    }
}

/// Has no static deps; yields two `Leaf` tasks mid-run and sums them once
/// both are complete (scenario C, §8).
#[derive(Debug)]
pub struct Mid {
    leaf_a: i64,
    leaf_b: i64,
    leaves: std::sync::Mutex<Option<(Arc<Leaf>, Arc<Leaf>)>>,
    target: MemoryTarget<i64>,
    id: OnceLock<Uuid>,
}

impl Mid {
    pub fn new(leaf_a: i64, leaf_b: i64) -> Self {
        Self {
            leaf_a,
            leaf_b,
            leaves: std::sync::Mutex::new(None),
            target: MemoryTarget::new(),
            id: OnceLock::new(),
        }
    }
}

#[async_trait]
impl Task for Mid {
    fn type_id(&self) -> TypeId {
        TypeId::new("stardag.testing.demo_tasks", "Mid")
    }

    fn params(&self) -> Vec<Param> {
        vec![
            Param::new("leaf_a", ParamValue::Int(self.leaf_a)),
            Param::new("leaf_b", ParamValue::Int(self.leaf_b)),
        ]
    }

    fn output(&self) -> Option<Arc<dyn Target>> {
        Some(Arc::new(self.target.clone()))
    }

    async fn run(&self, ctx: &mut dyn RunContext) -> Result<RunOutcome, TaskError> {
        let a = Arc::new(Leaf::new(self.leaf_a));
        let b = Arc::new(Leaf::new(self.leaf_b));
        let a_dyn: Arc<dyn Task> = a.clone();
        let b_dyn: Arc<dyn Task> = b.clone();
        let deps = TaskStruct::List(vec![TaskStruct::Single(a_dyn), TaskStruct::Single(b_dyn)]);
        ctx.yield_deps(deps).await?;

        // The yielded deps are guaranteed complete once `yield_deps`
        // returns (§4.2, §9's synchronization invariant).
        let sum = a.target.load().expect("leaf a not written") + b.target.load().expect("leaf b not written");
        self.target.write(sum);
        *self.leaves.lock().expect("poisoned") = Some((a, b));
        Ok(RunOutcome::Done)
    }

    fn id(&self) -> Uuid {
        // `Mid`'s id does not depend on the dynamically-yielded structure
        // (§8 scenario C): only its own declared params participate.
        *self.id.get_or_init(|| compute_task_id(self))
    }
}

/// Yields a [`CyclicPartner`] mid-run; the partner's own static `requires()`
/// points back at this task, so the pair exercises the dynamic-dep-cycle
/// boundary scenario (§8): the yielded dep transitively depends on the
/// yielding task. `partner` is filled in once, right after construction,
/// because a `run()` body only has `&self` and so cannot conjure the `Arc`
/// needed to close the cycle on its own.
#[derive(Debug)]
pub struct CyclicRoot {
    tag: String,
    partner: OnceLock<Arc<CyclicPartner>>,
    target: MemoryTarget<i64>,
    id: OnceLock<Uuid>,
}

impl CyclicRoot {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            partner: OnceLock::new(),
            target: MemoryTarget::new(),
            id: OnceLock::new(),
        }
    }

    /// Must be called once, before this task is handed to a build, with a
    /// partner whose `requires()` resolves back to this task's own id.
    pub fn bind_partner(&self, partner: Arc<CyclicPartner>) {
        self.partner.set(partner).ok();
    }
}

#[async_trait]
impl Task for CyclicRoot {
    fn type_id(&self) -> TypeId {
        TypeId::new("stardag.testing.demo_tasks", "CyclicRoot")
    }

    fn params(&self) -> Vec<Param> {
        vec![Param::new("tag", ParamValue::Str(self.tag.clone()))]
    }

    fn output(&self) -> Option<Arc<dyn Target>> {
        Some(Arc::new(self.target.clone()))
    }

    async fn run(&self, ctx: &mut dyn RunContext) -> Result<RunOutcome, TaskError> {
        let partner = self.partner.get().expect("bind_partner was not called").clone();
        let partner_dyn: Arc<dyn Task> = partner;
        ctx.yield_deps(TaskStruct::Single(partner_dyn)).await?;
        // Unreachable in the cycle scenario: the scheduler fails this task
        // before the yield resolves.
        self.target.write(0);
        Ok(RunOutcome::Done)
    }

    fn id(&self) -> Uuid {
        *self.id.get_or_init(|| compute_task_id(self))
    }
}

/// Statically requires a [`CyclicRoot`], completing the cycle `CyclicRoot`
/// forms by yielding this task mid-run.
#[derive(Debug)]
pub struct CyclicPartner {
    tag: String,
    upstream: Arc<CyclicRoot>,
    target: MemoryTarget<i64>,
    id: OnceLock<Uuid>,
}

impl CyclicPartner {
    pub fn new(tag: impl Into<String>, upstream: Arc<CyclicRoot>) -> Self {
        Self {
            tag: tag.into(),
            upstream,
            target: MemoryTarget::new(),
            id: OnceLock::new(),
        }
    }
}

#[async_trait]
impl Task for CyclicPartner {
    fn type_id(&self) -> TypeId {
        TypeId::new("stardag.testing.demo_tasks", "CyclicPartner")
    }

    fn params(&self) -> Vec<Param> {
        vec![Param::new("tag", ParamValue::Str(self.tag.clone()))]
    }

    fn requires(&self) -> TaskStruct {
        let upstream: Arc<dyn Task> = self.upstream.clone();
        TaskStruct::Single(upstream)
    }

    fn output(&self) -> Option<Arc<dyn Target>> {
        Some(Arc::new(self.target.clone()))
    }

    async fn run(&self, _ctx: &mut dyn RunContext) -> Result<RunOutcome, TaskError> {
        self.target.write(0);
        Ok(RunOutcome::Done)
    }

    fn id(&self) -> Uuid {
        *self.id.get_or_init(|| compute_task_id(self))
    }
}
