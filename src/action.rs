//! Action contract.
//!
//! Migration steps are written as actions: they receive the current vars
//! (`info`), may choose the successor path, and return the values to
//! publish. [`ActionTask`] plugs an action into a net as a plain task.

use crate::namespace::Vars;
use crate::task::{PathSelector, Task, TaskContext};
use std::rc::Rc;

pub trait Action {
    fn run(&self, info: &Vars, next_path: &mut PathSelector) -> anyhow::Result<Vars>;
}

/// Adapter from [`Action`] to [`Task`]
pub struct ActionTask<A> {
    action: A,
}

impl<A: Action> ActionTask<A> {
    pub fn new(action: A) -> Self {
        Self { action }
    }

    pub fn shared(action: A) -> Rc<dyn Task>
    where
        A: 'static,
    {
        Rc::new(Self::new(action))
    }

    pub fn action(&self) -> &A {
        &self.action
    }
}

impl<A: Action> Task for ActionTask<A> {
    fn run(&self, ctx: &mut TaskContext<'_>) -> anyhow::Result<Vars> {
        let info = ctx.namespace().snapshot();
        self.action.run(&info, ctx.next_path_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use crate::task::TaskId;
    use serde_json::json;

    const DEFAULT: usize = 0;
    const DIRECT_FLOW: usize = 1;

    struct IsBootFromVolume;

    impl Action for IsBootFromVolume {
        fn run(&self, info: &Vars, next_path: &mut PathSelector) -> anyhow::Result<Vars> {
            next_path.set_next_path(DEFAULT);
            let boot_mode = info
                .get("boot_mode")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("boot_mode missing from info"))?;
            if boot_mode == "boot_volume" {
                next_path.set_next_path(DIRECT_FLOW);
            }
            Ok(Vars::new())
        }
    }

    #[test]
    fn test_action_selects_direct_flow() {
        let namespace = Namespace::new();
        namespace.set("boot_mode", json!("boot_volume"));
        let id = TaskId::from("is_boot_from_volume");
        let task = ActionTask::new(IsBootFromVolume);

        let mut ctx = TaskContext::new(&id, &namespace);
        task.run(&mut ctx).expect("action succeeds");
        assert_eq!(ctx.next_path().selected(), DIRECT_FLOW);
    }

    #[test]
    fn test_action_error_propagates() {
        let namespace = Namespace::new();
        let id = TaskId::from("is_boot_from_volume");
        let task = ActionTask::new(IsBootFromVolume);

        let mut ctx = TaskContext::new(&id, &namespace);
        let err = task.run(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("boot_mode"));
    }
}
