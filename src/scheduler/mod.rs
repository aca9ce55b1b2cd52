//! Scheduler: drives a cursor and dispatches each visited task by kind.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──run()──▶ Running ──cursor exhausted──▶ Completed
//!                       │
//!                       └──task or branch error──▶ Failed
//! ```
//!
//! Tasks run strictly one after another on the thread that called `run()`.
//! The first error stops the loop: it is logged, stored on the scheduler and
//! reported to `on_task_error`, and `run()` returns `Failed` instead of
//! raising. Branch processes already spawned keep running.
//!
//! A scheduler built with [`Scheduler::new`] carries the threaded dispatch
//! table and can fork child schedulers for forking tasks (see `fork`).
//! [`Scheduler::base`] only runs plain tasks.

pub mod dispatch;
mod fork;

pub use dispatch::{DispatchTable, Executor, run_plain_task};
pub use fork::{BranchOutcome, BranchProcess};

use crate::config::EngineConfig;
use crate::cursor::Cursor;
use crate::error::EngineError;
use crate::namespace::Namespace;
use crate::net::{Net, NetNode};
use crate::task::TaskId;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use strum::Display;
use tracing::{error, info, warn};

/// Exit code of a failed run (and of a failed branch process)
pub const ERROR_EXIT_CODE: i32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Process exit code for this status
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Failed => ERROR_EXIT_CODE,
            Self::Created | Self::Running => 1,
        }
    }
}

/// The error that stopped a run and the task it escaped from
#[derive(Debug)]
pub struct TaskFailure {
    pub task: TaskId,
    pub error: anyhow::Error,
}

impl TaskFailure {
    /// True when the net itself is broken rather than the task's work
    pub fn is_configuration(&self) -> bool {
        self.error
            .downcast_ref::<EngineError>()
            .is_some_and(EngineError::is_configuration)
    }
}

/// Lifecycle hooks. Observability only: a hook cannot skip or stop a task.
pub trait SchedulerHooks {
    fn on_task_start(&self, task: &TaskId) {
        info!("-------- Start task: {}", task);
    }

    fn on_task_end(&self, task: &TaskId) {
        info!("-------- End task: {}", task);
    }

    fn on_task_error(&self, _task: &TaskId, _error: &anyhow::Error) {}
}

/// Default hooks: log task start and end
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHooks;

impl SchedulerHooks for LoggingHooks {}

/// Link from a forked scheduler back to its parent's bookkeeping
#[derive(Clone)]
struct ParentLink {
    active: Rc<RefCell<BTreeSet<TaskId>>>,
}

impl ParentLink {
    fn child_started(&self, task: &TaskId) {
        self.active.borrow_mut().insert(task.clone());
    }

    fn child_stopped(&self, task: &TaskId) {
        self.active.borrow_mut().remove(task);
    }
}

pub struct Scheduler {
    namespace: Namespace,
    cursor: Cursor,
    dispatch: Rc<DispatchTable>,
    hooks: Rc<dyn SchedulerHooks>,
    config: Rc<EngineConfig>,
    status: RunStatus,
    failure: Option<TaskFailure>,
    fork_task: Option<TaskId>,
    parent: Option<ParentLink>,
    active_children: Rc<RefCell<BTreeSet<TaskId>>>,
}

impl Scheduler {
    /// Threaded scheduler: runs plain and forking tasks
    pub fn new(namespace: Namespace, cursor: Cursor) -> Self {
        Self::with_dispatch(namespace, cursor, DispatchTable::threaded())
    }

    /// Base scheduler: runs plain tasks only
    pub fn base(namespace: Namespace, cursor: Cursor) -> Self {
        Self::with_dispatch(namespace, cursor, DispatchTable::base())
    }

    pub fn with_dispatch(namespace: Namespace, cursor: Cursor, dispatch: DispatchTable) -> Self {
        Self {
            namespace,
            cursor,
            dispatch: Rc::new(dispatch),
            hooks: Rc::new(LoggingHooks),
            config: Rc::new(EngineConfig::default()),
            status: RunStatus::Created,
            failure: None,
            fork_task: None,
            parent: None,
            active_children: Rc::new(RefCell::new(BTreeSet::new())),
        }
    }

    /// Top-level scheduler: a threaded scheduler over the root net without
    /// an associated forking task
    pub fn top_level(net: Rc<Net>, namespace: Namespace, config: EngineConfig) -> Self {
        Self::new(namespace, Cursor::new(net)).with_config(config)
    }

    pub fn with_hooks(mut self, hooks: Rc<dyn SchedulerHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Rc::new(config);
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn namespace_mut(&mut self) -> &mut Namespace {
        &mut self.namespace
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        self.failure.as_ref()
    }

    pub fn take_failure(&mut self) -> Option<TaskFailure> {
        self.failure.take()
    }

    /// Forking task this scheduler was created for, if it is a branch
    pub fn fork_task(&self) -> Option<&TaskId> {
        self.fork_task.as_ref()
    }

    /// Forked children currently marked as running
    pub fn active_children(&self) -> Vec<TaskId> {
        self.active_children.borrow().iter().cloned().collect()
    }

    pub fn is_child_active(&self, task: &TaskId) -> bool {
        self.active_children.borrow().contains(task)
    }

    /// Make the cursor follow path list `index` after the current task
    pub fn select_path(&mut self, index: usize) {
        self.cursor.select_path(index);
    }

    /// Run until the cursor is exhausted or a task fails.
    ///
    /// Errors are recorded rather than returned; inspect the returned status
    /// or call [`Scheduler::ensure_success`]. A scheduler runs once.
    pub fn run(&mut self) -> RunStatus {
        if self.status != RunStatus::Created {
            warn!("Scheduler already ran (status: {}), ignoring run()", self.status);
            return self.status;
        }
        self.status = RunStatus::Running;
        self.notify_started();

        let net = Rc::clone(self.cursor.net());
        let mut last: Option<TaskId> = None;

        while let Some(step) = self.cursor.next() {
            let index = match step {
                Ok(index) => index,
                Err(err) => {
                    let task = match &err {
                        EngineError::PathOutOfRange { task, .. } => task.clone(),
                        _ => last.clone().unwrap_or_else(|| TaskId::from("<entry>")),
                    };
                    self.fail(task, err.into());
                    break;
                }
            };

            let node = net.node(index);
            if let Err(err) = self.run_task(node) {
                self.fail(node.id().clone(), err);
                break;
            }
            last = Some(node.id().clone());
        }

        if self.status == RunStatus::Running {
            self.status = RunStatus::Completed;
        }
        self.notify_stopped();
        self.status
    }

    /// Fire the start hook, dispatch by kind, fire the end hook
    pub fn run_task(&mut self, node: &NetNode) -> anyhow::Result<()> {
        self.hooks.on_task_start(node.id());
        let executor = self
            .dispatch
            .get(node.kind())
            .ok_or(EngineError::UnknownKind(node.kind()))?;
        executor(self, node)?;
        self.hooks.on_task_end(node.id());
        Ok(())
    }

    /// Error if the run did not complete
    pub fn ensure_success(&self) -> anyhow::Result<()> {
        match (&self.status, &self.failure) {
            (RunStatus::Completed, _) => Ok(()),
            (_, Some(failure)) => Err(anyhow::anyhow!(
                "task '{}' failed: {:#}",
                failure.task,
                failure.error
            )),
            (status, None) => anyhow::bail!("run did not complete (status: {})", status),
        }
    }

    fn fail(&mut self, task: TaskId, error: anyhow::Error) {
        let failure = TaskFailure { task, error };
        if failure.is_configuration() {
            error!("{} CONFIGURATION ERROR: {:?}", failure.task, failure.error);
        } else {
            error!("{} TASK FAILED: {:?}", failure.task, failure.error);
        }
        self.status = RunStatus::Failed;
        self.hooks.on_task_error(&failure.task, &failure.error);
        self.failure = Some(failure);
    }

    fn notify_started(&self) {
        if let (Some(parent), Some(task)) = (&self.parent, &self.fork_task) {
            parent.child_started(task);
        }
    }

    fn notify_stopped(&self) {
        if let (Some(parent), Some(task)) = (&self.parent, &self.fork_task) {
            parent.child_stopped(task);
        }
    }
}
