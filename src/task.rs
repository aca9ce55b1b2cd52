//! Task contract.
//!
//! Every node of a [`Net`] carries a [`Task`]. The scheduler looks up an
//! executor by the task's [`TaskKind`]; plain tasks run against the governing
//! namespace and return the values to publish, forking tasks expose a
//! sub-graph that the threaded scheduler runs in a child scheduler.
//!
//! A task chooses its successor through [`TaskContext::set_next_path`]. This
//! is the only conditional-branch primitive of a net.

use crate::config::PollingConfig;
use crate::namespace::{Namespace, Vars};
use crate::net::Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;

/// Stable identity of a task within a net.
///
/// Used as the dispatch key for hooks and as the key of a namespace's child
/// registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Kind marker the dispatch table keys on.
///
/// `Plain` and `Fork` are the built-in kinds. Collaborators add kinds with
/// `Custom` and register an executor for them; the scheduler never branches
/// on concrete task types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Executes synchronously against the namespace
    Plain,
    /// Spawns a nested scheduler over its own sub-graph
    Fork,
    /// Collaborator-defined kind
    Custom(&'static str),
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => f.write_str("plain"),
            Self::Fork => f.write_str("fork"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

/// Successor path chosen by a task during one invocation.
///
/// Untouched, the cursor follows path 0. When a task sets it more than once
/// the last call wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathSelector {
    selected: Option<usize>,
}

impl PathSelector {
    pub fn set_next_path(&mut self, index: usize) {
        self.selected = Some(index);
    }

    /// The selected path, or the default path 0
    pub fn selected(&self) -> usize {
        self.selected.unwrap_or(0)
    }

    pub fn is_set(&self) -> bool {
        self.selected.is_some()
    }
}

/// What a task sees while it runs: the governing namespace and its branch
/// selector.
pub struct TaskContext<'a> {
    id: &'a TaskId,
    namespace: &'a Namespace,
    polling: &'a PollingConfig,
    next_path: PathSelector,
}

static DEFAULT_POLLING: PollingConfig = PollingConfig::DEFAULT;

impl<'a> TaskContext<'a> {
    pub fn new(id: &'a TaskId, namespace: &'a Namespace) -> Self {
        Self {
            id,
            namespace,
            polling: &DEFAULT_POLLING,
            next_path: PathSelector::default(),
        }
    }

    /// Use the engine's polling settings instead of the defaults
    pub fn with_polling(mut self, polling: &'a PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    /// Polling settings for tasks that wait on a resource status
    pub fn polling(&self) -> &PollingConfig {
        self.polling
    }

    /// Identity of the running task
    pub fn task_id(&self) -> &TaskId {
        self.id
    }

    pub fn namespace(&self) -> &Namespace {
        self.namespace
    }

    /// Look up an upstream value by name
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.namespace.get(key)
    }

    /// Advance along path list `index` instead of the default once this
    /// task returns
    pub fn set_next_path(&mut self, index: usize) {
        self.next_path.set_next_path(index);
    }

    pub fn next_path(&self) -> PathSelector {
        self.next_path
    }

    pub fn next_path_mut(&mut self) -> &mut PathSelector {
        &mut self.next_path
    }
}

/// Capability every net node implements.
pub trait Task {
    /// Kind used to pick the executor
    fn kind(&self) -> TaskKind {
        TaskKind::Plain
    }

    /// Execute against the governing namespace, returning the values to
    /// merge into it
    fn run(&self, ctx: &mut TaskContext<'_>) -> anyhow::Result<Vars>;

    /// Sub-graph of a forking task
    fn net(&self) -> Option<Rc<Net>> {
        None
    }
}

/// Plain task backed by a closure.
pub struct FnTask<F> {
    f: F,
}

impl<F> FnTask<F>
where
    F: Fn(&mut TaskContext<'_>) -> anyhow::Result<Vars>,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Task for FnTask<F>
where
    F: Fn(&mut TaskContext<'_>) -> anyhow::Result<Vars>,
{
    fn run(&self, ctx: &mut TaskContext<'_>) -> anyhow::Result<Vars> {
        (self.f)(ctx)
    }
}

/// Wrap a closure as a shareable plain task
pub fn task_fn<F>(f: F) -> Rc<dyn Task>
where
    F: Fn(&mut TaskContext<'_>) -> anyhow::Result<Vars> + 'static,
{
    Rc::new(FnTask::new(f))
}

/// Forking task: runs its own net in a child scheduler.
pub struct ForkTask {
    net: Rc<Net>,
}

impl ForkTask {
    pub fn new(net: Rc<Net>) -> Self {
        Self { net }
    }

    pub fn shared(net: Rc<Net>) -> Rc<dyn Task> {
        Rc::new(Self::new(net))
    }
}

impl Task for ForkTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Fork
    }

    fn run(&self, ctx: &mut TaskContext<'_>) -> anyhow::Result<Vars> {
        anyhow::bail!(
            "fork task '{}' must be dispatched through a fork executor",
            ctx.task_id()
        )
    }

    fn net(&self) -> Option<Rc<Net>> {
        Some(Rc::clone(&self.net))
    }
}
