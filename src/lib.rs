//! CloudShift Library
//!
//! Task-graph execution engine for cloud-to-cloud migrations. A migration is
//! a net of tasks; a scheduler walks it with a cursor, runs plain tasks in
//! order and forks forking tasks into their own child schedulers.

pub mod action;
pub mod cli;
pub mod config;
pub mod cursor;
pub mod error;
pub mod namespace;
pub mod net;
pub mod plan;
pub mod process_guard;
pub mod resource;
pub mod scheduler;
pub mod task;
pub mod tasks;

// Re-export main types for convenience
pub use action::{Action, ActionTask};
pub use config::{EngineConfig, ForkMode, PollingConfig, RetryPolicy};
pub use cursor::Cursor;
pub use error::EngineError;
pub use namespace::{ChildRecord, Namespace, Vars};
pub use net::{Net, NetBuilder, NetNode};
pub use plan::Plan;
pub use process_guard::{BranchRegistry, CommandProcessGroup, ProcessGuard};
pub use resource::{Resource, StatusPoller};
pub use scheduler::{
    BranchOutcome, DispatchTable, ERROR_EXIT_CODE, RunStatus, Scheduler, SchedulerHooks,
};
pub use task::{FnTask, ForkTask, PathSelector, Task, TaskContext, TaskId, TaskKind, task_fn};
