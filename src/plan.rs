//! Plan files: JSON descriptions of a net built from the built-in tasks.
//!
//! ```json
//! {
//!   "vars": {"boot_mode": "boot_volume"},
//!   "entry": "check",
//!   "tasks": [
//!     {"id": "check", "type": "branch", "var": "boot_mode", "equals": "boot_volume",
//!      "next": ["convert", "transport"]},
//!     {"id": "convert", "type": "command", "program": "qemu-img", "args": ["info", "disk"],
//!      "output": "disk_info"},
//!     {"id": "transport", "type": "fork", "net": {"tasks": [
//!       {"id": "copy", "type": "set", "values": {"copied": true}}
//!     ]}}
//!   ]
//! }
//! ```
//!
//! `next` is indexed by path; `null` marks an empty path list.

use crate::error::{EngineError, Result};
use crate::namespace::Vars;
use crate::net::Net;
use crate::task::{ForkTask, Task, TaskId};
use crate::tasks::{CommandTask, SelectPath, SetVars};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Initial vars of the top-level namespace
    #[serde(default)]
    pub vars: Vars,
    #[serde(flatten)]
    pub net: NetSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<TaskId>,
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: TaskId,
    #[serde(flatten)]
    pub spec: TaskSpec,
    #[serde(default)]
    pub next: Vec<Option<TaskId>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskSpec {
    Set {
        #[serde(default)]
        values: Vars,
    },
    Branch {
        var: String,
        equals: Value,
    },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        output: Option<String>,
    },
    Fork {
        net: NetSpec,
    },
}

impl TaskSpec {
    /// Path lists a node of this type needs at minimum
    fn min_paths(&self) -> usize {
        match self {
            Self::Branch { .. } => 2,
            _ => 1,
        }
    }

    fn instantiate(&self) -> Result<Rc<dyn Task>> {
        let task: Rc<dyn Task> = match self {
            Self::Set { values } => Rc::new(SetVars::new(values.clone())),
            Self::Branch { var, equals } => Rc::new(SelectPath::new(var.clone(), equals.clone())),
            Self::Command {
                program,
                args,
                env,
                output,
            } => {
                let mut task = CommandTask::new(program.clone()).args(args.iter().cloned());
                for (key, value) in env {
                    task = task.env(key.clone(), value.clone());
                }
                if let Some(name) = output {
                    task = task.output_var(name.clone());
                }
                Rc::new(task)
            }
            Self::Fork { net } => ForkTask::shared(Rc::new(net.build()?)),
        };
        Ok(task)
    }
}

impl NetSpec {
    /// Build and validate the described net
    pub fn build(&self) -> Result<Net> {
        let mut builder = Net::builder();
        for task in &self.tasks {
            let paths = task.next.len().max(task.spec.min_paths());
            builder = builder
                .task(task.id.clone(), task.spec.instantiate()?)
                .branches(task.id.clone(), paths);
            for (path, successor) in task.next.iter().enumerate() {
                if let Some(successor) = successor {
                    builder = builder.edge(task.id.clone(), path, successor.clone());
                }
            }
        }
        if let Some(entry) = &self.entry {
            builder = builder.entry(entry.clone());
        }
        builder.build()
    }
}

impl Plan {
    pub fn from_json(content: &str) -> Result<Self> {
        let plan: Self = serde_json::from_str(content)?;
        if plan.net.tasks.is_empty() {
            return Err(EngineError::config("plan has no tasks"));
        }
        Ok(plan)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read plan from {:?}", path.as_ref()))?;
        Self::from_json(&content).with_context(|| format!("Invalid plan {:?}", path.as_ref()))
    }

    pub fn build_net(&self) -> Result<Rc<Net>> {
        Ok(Rc::new(self.net.build()?))
    }
}
