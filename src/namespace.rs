//! Namespace: the forkable variable store handed to tasks.
//!
//! `vars` lives behind a shared handle so an inline child forked without
//! isolation sees (and publishes to) the same store as its parent. Forking
//! with isolation deep-copies the map instead. A namespace also keeps the
//! registry of child executions forked from it; forking never inherits that
//! registry.

use crate::scheduler::{BranchProcess, Scheduler};
use crate::task::TaskId;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Named values produced and consumed by tasks
pub type Vars = BTreeMap<String, Value>;

/// Registry entry for a forked child execution
pub struct ChildRecord {
    /// View of the child's namespace (aliases the child's store)
    pub namespace: Namespace,
    /// The child scheduler
    pub scheduler: Rc<RefCell<Scheduler>>,
    /// Process running the child, when it was forked to a new process
    pub process: Option<BranchProcess>,
}

impl fmt::Debug for ChildRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildRecord")
            .field("namespace", &self.namespace)
            .field("process", &self.process.as_ref().map(BranchProcess::pid))
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct Namespace {
    vars: Rc<RefCell<Vars>>,
    children: BTreeMap<TaskId, ChildRecord>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vars(vars: Vars) -> Self {
        Self {
            vars: Rc::new(RefCell::new(vars)),
            children: BTreeMap::new(),
        }
    }

    /// Create a child namespace.
    ///
    /// With `isolate` the child gets a deep copy of `vars`; otherwise both
    /// namespaces share one store. The child's registry starts empty.
    pub fn fork(&self, isolate: bool) -> Namespace {
        let vars = if isolate {
            Rc::new(RefCell::new(self.vars.borrow().clone()))
        } else {
            Rc::clone(&self.vars)
        };
        Namespace {
            vars,
            children: BTreeMap::new(),
        }
    }

    /// True when both namespaces alias the same store
    pub fn shares_vars_with(&self, other: &Namespace) -> bool {
        Rc::ptr_eq(&self.vars, &other.vars)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.vars.borrow().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.borrow().contains_key(key)
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.vars.borrow_mut().insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.vars.borrow_mut().remove(key)
    }

    /// Merge the values a task produced; later values overwrite earlier ones
    pub fn merge(&self, produced: Vars) {
        self.vars.borrow_mut().extend(produced);
    }

    /// Copy of the current values
    pub fn snapshot(&self) -> Vars {
        self.vars.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.vars.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.borrow().is_empty()
    }

    /// Track a forked child execution, returning any record it replaces
    pub fn register_child(&mut self, task: TaskId, record: ChildRecord) -> Option<ChildRecord> {
        tracing::debug!("Registered child execution '{}'", task);
        self.children.insert(task, record)
    }

    pub fn unregister_child(&mut self, task: &TaskId) -> Option<ChildRecord> {
        tracing::debug!("Unregistered child execution '{}'", task);
        self.children.remove(task)
    }

    pub fn child(&self, task: &TaskId) -> Option<&ChildRecord> {
        self.children.get(task)
    }

    pub fn child_mut(&mut self, task: &TaskId) -> Option<&mut ChildRecord> {
        self.children.get_mut(task)
    }

    pub fn children(&self) -> impl Iterator<Item = (&TaskId, &ChildRecord)> {
        self.children.iter()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("vars", &*self.vars.borrow())
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .finish()
    }
}
