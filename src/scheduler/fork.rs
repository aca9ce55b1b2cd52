//! Forking: child schedulers for forking tasks.
//!
//! A forking task gets a child namespace, a cursor over the task's own net
//! and a scheduler sharing the parent's dispatch table, hooks and config.
//! The child is recorded in the parent namespace's registry under the task
//! identity.
//!
//! In `process` mode the child runs in a new OS process and the parent
//! returns at once. Process branches always get an isolated copy of the
//! namespace (separate address spaces share nothing), and report their
//! outcome through a pipe that the parent reads only when it explicitly
//! collects the branch. In `inline` mode the child runs to completion on the
//! current thread and may alias the parent's vars.

use super::{RunStatus, Scheduler};
use crate::config::ForkMode;
use crate::cursor::Cursor;
use crate::error::{EngineError, Result};
use crate::namespace::{ChildRecord, Vars};
use crate::net::{Net, NetNode};
use crate::process_guard::{BranchRegistry, enter_branch_process_group};
use crate::task::TaskId;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::io::{BufWriter, PipeReader, PipeWriter, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use tracing::{debug, error, info, warn};

/// Exit code of a branch process that could not report its outcome
const UNREPORTED_EXIT_CODE: i32 = 70;

/// Final state of a branch process, as reported over its result pipe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchOutcome {
    pub status: RunStatus,
    pub failed_task: Option<TaskId>,
    pub error: Option<String>,
    pub vars: Vars,
}

impl BranchOutcome {
    fn from_scheduler(scheduler: &Scheduler) -> Self {
        let failure = scheduler.failure();
        Self {
            status: scheduler.status(),
            failed_task: failure.map(|f| f.task.clone()),
            error: failure.map(|f| format!("{:#}", f.error)),
            vars: scheduler.namespace().snapshot(),
        }
    }

    fn unreported(wait: WaitStatus) -> Self {
        Self {
            status: RunStatus::Failed,
            failed_task: None,
            error: Some(format!(
                "branch process ended without reporting an outcome ({:?})",
                wait
            )),
            vars: Vars::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Handle to a branch running in its own process
pub struct BranchProcess {
    pid: Pid,
    results: PipeReader,
}

impl BranchProcess {
    pub fn pid(&self) -> u32 {
        self.pid.as_raw().unsigned_abs()
    }

    /// Block until the branch exits and return its reported outcome
    fn join(mut self) -> Result<BranchOutcome> {
        let mut payload = String::new();
        self.results.read_to_string(&mut payload)?;
        let wait = waitpid(self.pid, None)?;
        debug!("Branch process {} ended: {:?}", self.pid, wait);

        if payload.trim().is_empty() {
            return Ok(BranchOutcome::unreported(wait));
        }
        Ok(serde_json::from_str(&payload)?)
    }
}

impl Scheduler {
    /// Create and register a child scheduler for `task` over `net`.
    ///
    /// The child namespace is a deep copy when `isolate` is set and an alias
    /// of this scheduler's vars otherwise.
    pub fn fork(&mut self, task: &TaskId, net: Rc<Net>, isolate: bool) -> Rc<RefCell<Scheduler>> {
        let namespace = self.namespace.fork(isolate);
        let view = namespace.fork(false);

        let child = Rc::new(RefCell::new(Scheduler {
            namespace,
            cursor: Cursor::new(net),
            dispatch: Rc::clone(&self.dispatch),
            hooks: Rc::clone(&self.hooks),
            config: Rc::clone(&self.config),
            status: RunStatus::Created,
            failure: None,
            fork_task: Some(task.clone()),
            parent: Some(super::ParentLink {
                active: Rc::clone(&self.active_children),
            }),
            active_children: Rc::new(RefCell::new(BTreeSet::new())),
        }));

        self.namespace.register_child(
            task.clone(),
            ChildRecord {
                namespace: view,
                scheduler: Rc::clone(&child),
                process: None,
            },
        );
        debug!("Forked child scheduler for '{}' (isolated: {})", task, isolate);
        child
    }

    /// PIDs of process branches not yet collected
    pub fn branch_pids(&self) -> Vec<u32> {
        self.namespace
            .children()
            .filter_map(|(_, record)| record.process.as_ref().map(BranchProcess::pid))
            .collect()
    }

    /// Wait for the process branch forked for `task` and return its outcome.
    ///
    /// The branch's vars are returned as-is; nothing is merged into this
    /// scheduler's namespace.
    pub fn collect_child(&mut self, task: &TaskId) -> Result<BranchOutcome> {
        let process = self
            .namespace
            .child_mut(task)
            .ok_or_else(|| EngineError::state(format!("no child execution registered for '{}'", task)))?
            .process
            .take()
            .ok_or_else(|| {
                EngineError::state(format!("child '{}' has no uncollected branch process", task))
            })?;

        let pid = process.pid();
        let outcome = process.join();
        match BranchRegistry::global().lock() {
            Ok(mut registry) => {
                registry.unregister(pid);
            }
            Err(_) => warn!("Branch registry poisoned, cannot unregister PID {}", pid),
        }
        self.active_children.borrow_mut().remove(task);

        let outcome = outcome?;
        info!("Collected branch '{}' (PID {}): {}", task, pid, outcome.status);
        Ok(outcome)
    }

    /// Collect every uncollected process branch
    pub fn collect_children(&mut self) -> Vec<(TaskId, Result<BranchOutcome>)> {
        let pending: Vec<TaskId> = self
            .namespace
            .children()
            .filter(|(_, record)| record.process.is_some())
            .map(|(task, _)| task.clone())
            .collect();

        pending
            .into_iter()
            .map(|task| {
                let outcome = self.collect_child(&task);
                (task, outcome)
            })
            .collect()
    }

    /// Start `child` in a new process and return without waiting for it
    fn spawn_branch(&mut self, task: &TaskId, child: &Rc<RefCell<Scheduler>>) -> Result<()> {
        let (reader, writer) = std::io::pipe()?;

        // SAFETY: the child process only runs the branch scheduler on this
        // thread and leaves through `_exit`, never returning into the caller.
        match unsafe { fork() }.map_err(|e| EngineError::fork(format!("fork failed: {}", e)))? {
            ForkResult::Child => {
                drop(reader);
                let code = run_branch_process(child, writer);
                // SAFETY: terminate the forked process without unwinding or
                // running the parent's exit handlers.
                unsafe { nix::libc::_exit(code) }
            }
            ForkResult::Parent { child: pid } => {
                drop(writer);
                let raw = pid.as_raw().unsigned_abs();
                match BranchRegistry::global().lock() {
                    Ok(mut registry) => registry.register(raw, task.clone()),
                    Err(_) => warn!("Branch registry poisoned, PID {} is untracked", raw),
                }
                self.active_children.borrow_mut().insert(task.clone());

                let record = self.namespace.child_mut(task).ok_or_else(|| {
                    EngineError::state(format!("child '{}' vanished from the registry", task))
                })?;
                record.process = Some(BranchProcess {
                    pid,
                    results: reader,
                });
                info!("Branch '{}' running in process {}", task, pid);
                Ok(())
            }
        }
    }
}

/// Body of a forked branch process; returns its exit code.
///
/// Never unwinds: a panicking task is reported as a failed outcome so the
/// caller can always leave through `_exit`.
fn run_branch_process(child: &Rc<RefCell<Scheduler>>, writer: PipeWriter) -> i32 {
    // The registry copy lists the parent's other branches; they are not ours
    // to terminate.
    BranchRegistry::forget_inherited();
    if let Err(e) = enter_branch_process_group() {
        warn!("Branch process could not set up its process group: {}", e);
    }

    let panicked = panic::catch_unwind(AssertUnwindSafe(|| {
        child.borrow_mut().run();
    }))
    .err()
    .map(|payload| panic_message(payload.as_ref()));

    let outcome = match child.try_borrow_mut() {
        Ok(mut scheduler) => {
            // Nested process branches would receive the parent-death signal
            // as soon as this process exits.
            for (task, result) in scheduler.collect_children() {
                if let Err(e) = result {
                    error!("Failed to collect nested branch '{}': {}", task, e);
                }
            }
            let mut outcome = BranchOutcome::from_scheduler(&scheduler);
            if let Some(message) = panicked {
                let task = scheduler.cursor().current().map(|node| node.id().clone());
                match &task {
                    Some(task) => error!("{} TASK PANICKED: {}", task, message),
                    None => error!("Branch panicked outside a task: {}", message),
                }
                outcome.status = RunStatus::Failed;
                outcome.failed_task = task;
                outcome.error = Some(format!("task panicked: {}", message));
            }
            outcome
        }
        Err(_) => BranchOutcome {
            status: RunStatus::Failed,
            failed_task: None,
            error: Some(format!(
                "branch scheduler unavailable after panic: {}",
                panicked.as_deref().unwrap_or("unknown")
            )),
            vars: Vars::new(),
        },
    };

    let mut out = BufWriter::new(writer);
    let reported = serde_json::to_writer(&mut out, &outcome)
        .map_err(std::io::Error::from)
        .and_then(|()| out.flush());
    match reported {
        Ok(()) => outcome.status.exit_code(),
        Err(e) => {
            error!("Branch process could not report its outcome: {}", e);
            UNREPORTED_EXIT_CODE
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Executor for `TaskKind::Fork`
pub(super) fn run_fork_task(scheduler: &mut Scheduler, node: &NetNode) -> anyhow::Result<()> {
    let net = node.task().net().ok_or_else(|| {
        EngineError::graph(format!("fork task '{}' does not provide a net", node.id()))
    })?;

    match scheduler.config.fork_mode {
        ForkMode::Process => {
            let child = scheduler.fork(node.id(), net, true);
            scheduler.spawn_branch(node.id(), &child)?;
        }
        ForkMode::Inline => {
            let isolate = scheduler.config.isolate_inline_forks;
            let child = scheduler.fork(node.id(), net, isolate);
            let status = child.borrow_mut().run();
            if status == RunStatus::Failed {
                warn!("Inline branch '{}' failed; parent continues", node.id());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::namespace::Namespace;
    use crate::task::{ForkTask, Task, task_fn};
    use serde_json::json;

    fn inline_config(isolate: bool) -> EngineConfig {
        EngineConfig {
            fork_mode: ForkMode::Inline,
            isolate_inline_forks: isolate,
            ..EngineConfig::default()
        }
    }

    fn publish(key: &'static str) -> Rc<dyn Task> {
        task_fn(move |_| Ok(Vars::from([(key.to_string(), json!(true))])))
    }

    #[test]
    fn test_fork_registers_child_with_fresh_registry() {
        let mut parent = Scheduler::new(Namespace::new(), Cursor::new(Rc::new(Net::empty())));
        let sub = Rc::new(Net::linear([("inner", publish("inner"))]).unwrap());
        let task = TaskId::from("background");

        let child = parent.fork(&task, sub, true);
        let record = parent.namespace().child(&task).expect("registered");

        assert!(record.process.is_none());
        assert!(Rc::ptr_eq(&record.scheduler, &child));
        assert!(record.namespace.shares_vars_with(child.borrow().namespace()));
        assert!(!parent.namespace().shares_vars_with(child.borrow().namespace()));
        assert_eq!(child.borrow().namespace().child_count(), 0);
        assert_eq!(child.borrow().fork_task(), Some(&task));
        assert_eq!(child.borrow().status(), RunStatus::Created);
    }

    #[test]
    fn test_inline_fork_without_isolation_publishes_to_parent() {
        let sub = Rc::new(Net::linear([("inner", publish("from_branch"))]).unwrap());
        let net = Net::linear([
            ("background", ForkTask::shared(sub)),
            ("after", publish("after")),
        ])
        .unwrap();
        let mut scheduler =
            Scheduler::top_level(Rc::new(net), Namespace::new(), inline_config(false));

        assert_eq!(scheduler.run(), RunStatus::Completed);
        assert!(scheduler.namespace().contains("from_branch"));
        assert!(scheduler.namespace().contains("after"));

        let record = scheduler
            .namespace()
            .child(&TaskId::from("background"))
            .expect("registered");
        assert_eq!(record.scheduler.borrow().status(), RunStatus::Completed);
        assert!(scheduler.active_children().is_empty());
    }

    #[test]
    fn test_inline_fork_with_isolation_keeps_parent_clean() {
        let sub = Rc::new(Net::linear([("inner", publish("from_branch"))]).unwrap());
        let net = Net::linear([("background", ForkTask::shared(sub))]).unwrap();
        let mut scheduler =
            Scheduler::top_level(Rc::new(net), Namespace::new(), inline_config(true));

        assert_eq!(scheduler.run(), RunStatus::Completed);
        assert!(!scheduler.namespace().contains("from_branch"));

        let record = scheduler
            .namespace()
            .child(&TaskId::from("background"))
            .expect("registered");
        assert!(record.namespace.contains("from_branch"));
    }

    #[test]
    fn test_inline_branch_failure_does_not_fail_parent() {
        let sub = Rc::new(Net::linear([("inner", task_fn(|_| anyhow::bail!("boom")))]).unwrap());
        let net = Net::linear([
            ("background", ForkTask::shared(sub)),
            ("after", publish("after")),
        ])
        .unwrap();
        let mut scheduler =
            Scheduler::top_level(Rc::new(net), Namespace::new(), inline_config(false));

        assert_eq!(scheduler.run(), RunStatus::Completed);
        assert!(scheduler.namespace().contains("after"));
        let record = scheduler
            .namespace()
            .child(&TaskId::from("background"))
            .expect("registered");
        assert_eq!(record.scheduler.borrow().status(), RunStatus::Failed);
    }

    #[test]
    fn test_child_marks_itself_active_while_running() {
        let observed = Rc::new(RefCell::new(Vec::new()));
        let parent_active = Rc::new(RefCell::new(BTreeSet::new()));
        let seen = Rc::clone(&observed);
        let watched = Rc::clone(&parent_active);
        let sub = Rc::new(
            Net::linear([(
                "inner",
                task_fn(move |_| {
                    seen.borrow_mut()
                        .extend(watched.borrow().iter().cloned());
                    Ok(Vars::new())
                }),
            )])
            .unwrap(),
        );

        let mut parent = Scheduler::new(Namespace::new(), Cursor::new(Rc::new(Net::empty())));
        parent.active_children = Rc::clone(&parent_active);
        let task = TaskId::from("background");
        let child = parent.fork(&task, sub, false);
        child.borrow_mut().run();

        assert_eq!(*observed.borrow(), vec![task.clone()]);
        assert!(!parent.is_child_active(&task));
    }

    #[test]
    fn test_collect_child_requires_process_branch() {
        let mut parent = Scheduler::new(Namespace::new(), Cursor::new(Rc::new(Net::empty())));
        let task = TaskId::from("background");
        assert!(matches!(
            parent.collect_child(&task),
            Err(EngineError::State(_))
        ));

        parent.fork(&task, Rc::new(Net::empty()), true);
        assert!(matches!(
            parent.collect_child(&task),
            Err(EngineError::State(_))
        ));
        assert!(parent.collect_children().is_empty());
    }

    #[test]
    fn test_outcome_serialization_shape() {
        let outcome = BranchOutcome {
            status: RunStatus::Failed,
            failed_task: Some(TaskId::from("copy")),
            error: Some("disk full".to_string()),
            vars: Vars::from([("copied".to_string(), json!(3))]),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], json!("failed"));
        assert_eq!(value["failed_task"], json!("copy"));
        assert!(!outcome.succeeded());
    }
}
