//! Built-in tasks.

pub mod command;

pub use command::{CommandOutput, CommandTask, run_command};

use crate::namespace::Vars;
use crate::task::{Task, TaskContext};
use serde_json::Value;

/// Publishes a fixed set of values
#[derive(Debug, Clone)]
pub struct SetVars {
    values: Vars,
}

impl SetVars {
    pub fn new(values: Vars) -> Self {
        Self { values }
    }
}

impl Task for SetVars {
    fn run(&self, _ctx: &mut TaskContext<'_>) -> anyhow::Result<Vars> {
        Ok(self.values.clone())
    }
}

/// Takes path 1 when `var` equals `value`, path 0 otherwise
#[derive(Debug, Clone)]
pub struct SelectPath {
    var: String,
    value: Value,
}

impl SelectPath {
    pub const DEFAULT: usize = 0;
    pub const MATCHED: usize = 1;

    pub fn new(var: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            var: var.into(),
            value: value.into(),
        }
    }
}

impl Task for SelectPath {
    fn run(&self, ctx: &mut TaskContext<'_>) -> anyhow::Result<Vars> {
        let matched = ctx.get(&self.var).as_ref() == Some(&self.value);
        ctx.set_next_path(if matched { Self::MATCHED } else { Self::DEFAULT });
        Ok(Vars::new())
    }
}
