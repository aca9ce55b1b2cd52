//! Dispatch table: task kind → executor.
//!
//! The table is built when a scheduler is constructed and shared with every
//! scheduler forked from it. New kinds are added by registering an executor,
//! never by matching on concrete task types.

use super::Scheduler;
use crate::net::NetNode;
use crate::task::{TaskContext, TaskKind};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Runs one node on behalf of a scheduler
pub type Executor = Rc<dyn Fn(&mut Scheduler, &NetNode) -> anyhow::Result<()>>;

#[derive(Clone, Default)]
pub struct DispatchTable {
    executors: HashMap<TaskKind, Executor>,
}

impl DispatchTable {
    /// Table without any executor
    pub fn empty() -> Self {
        Self::default()
    }

    /// Base scheduler table: plain tasks only
    pub fn base() -> Self {
        Self::empty().with(TaskKind::Plain, run_plain_task)
    }

    /// Threaded scheduler table: plain and forking tasks
    pub fn threaded() -> Self {
        Self::base().with(TaskKind::Fork, super::fork::run_fork_task)
    }

    /// Register an executor, returning the one it replaces
    pub fn register<F>(&mut self, kind: TaskKind, executor: F) -> Option<Executor>
    where
        F: Fn(&mut Scheduler, &NetNode) -> anyhow::Result<()> + 'static,
    {
        self.executors.insert(kind, Rc::new(executor))
    }

    pub fn with<F>(mut self, kind: TaskKind, executor: F) -> Self
    where
        F: Fn(&mut Scheduler, &NetNode) -> anyhow::Result<()> + 'static,
    {
        self.register(kind, executor);
        self
    }

    pub fn get(&self, kind: TaskKind) -> Option<Executor> {
        self.executors.get(&kind).cloned()
    }

    pub fn supports(&self, kind: TaskKind) -> bool {
        self.executors.contains_key(&kind)
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.executors.keys().map(ToString::to_string).collect();
        kinds.sort();
        f.debug_struct("DispatchTable").field("kinds", &kinds).finish()
    }
}

/// Run a plain task against the scheduler's namespace and merge what it
/// produced. The task's path choice is handed to the cursor.
pub fn run_plain_task(scheduler: &mut Scheduler, node: &NetNode) -> anyhow::Result<()> {
    let (produced, next_path) = {
        let mut ctx = TaskContext::new(node.id(), scheduler.namespace())
            .with_polling(&scheduler.config().polling);
        let produced = node.task().run(&mut ctx)?;
        (produced, ctx.next_path())
    };
    scheduler.namespace().merge(produced);
    if next_path.is_set() {
        scheduler.select_path(next_path.selected());
    }
    Ok(())
}
