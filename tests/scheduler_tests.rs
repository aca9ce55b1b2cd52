//! Integration tests for scheduling a migration net end to end
//!
//! These tests verify that:
//! 1. Tasks run in cursor order and publish into the shared namespace
//! 2. The first failing task stops the run and is reported
//! 3. Actions choose successor paths at run time
//! 4. Inline forks alias or isolate vars as configured
//! 5. Tasks poll resources with the engine's polling settings

use cloudshift::action::{Action, ActionTask};
use cloudshift::resource::{Sleeper, is_timeout};
use cloudshift::{
    Cursor, EngineConfig, EngineError, ForkMode, ForkTask, Namespace, Net, PathSelector, Plan,
    PollingConfig, RunStatus, Scheduler, StatusPoller, Task, TaskId, Vars, task_fn,
};
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

const DEFAULT: usize = 0;
const DIRECT_FLOW: usize = 1;

/// Picks the direct flow for instances booted from a volume
struct IsBootFromVolume;

impl Action for IsBootFromVolume {
    fn run(&self, info: &Vars, next_path: &mut PathSelector) -> anyhow::Result<Vars> {
        next_path.set_next_path(DEFAULT);
        if info.get("boot_mode") == Some(&json!("boot_volume")) {
            next_path.set_next_path(DIRECT_FLOW);
        }
        Ok(Vars::new())
    }
}

fn publish(key: &'static str, value: serde_json::Value) -> Rc<dyn Task> {
    task_fn(move |_| Ok(Vars::from([(key.to_string(), value.clone())])))
}

fn inline(isolate: bool) -> EngineConfig {
    EngineConfig {
        fork_mode: ForkMode::Inline,
        isolate_inline_forks: isolate,
        ..EngineConfig::default()
    }
}

/// Net: check -> [image_flow (path 0) | volume_flow (path 1)] -> done
fn boot_net() -> Rc<Net> {
    let net = Net::builder()
        .task("check", ActionTask::shared(IsBootFromVolume))
        .branches("check", 2)
        .task("image_flow", publish("flow", json!("image")))
        .task("volume_flow", publish("flow", json!("volume")))
        .task("done", publish("done", json!(true)))
        .edge("check", DEFAULT, "image_flow")
        .edge("check", DIRECT_FLOW, "volume_flow")
        .then("image_flow", "done")
        .then("volume_flow", "done")
        .entry("check")
        .build()
        .expect("valid net");
    Rc::new(net)
}

#[test]
fn test_linear_net_runs_in_order() {
    let order = Rc::new(RefCell::new(Vec::new()));
    let step = |name: &'static str| {
        let order = Rc::clone(&order);
        task_fn(move |ctx| {
            order.borrow_mut().push(name);
            let seen = ctx.namespace().len();
            Ok(Vars::from([(name.to_string(), json!(seen))]))
        })
    };
    let net = Net::linear([("t1", step("t1")), ("t2", step("t2")), ("t3", step("t3"))]).unwrap();
    let mut scheduler =
        Scheduler::top_level(Rc::new(net), Namespace::new(), EngineConfig::default());

    assert_eq!(scheduler.run(), RunStatus::Completed);
    assert_eq!(*order.borrow(), vec!["t1", "t2", "t3"]);
    // each task sees what its predecessors published
    assert_eq!(scheduler.namespace().get("t3"), Some(json!(2)));
    assert!(scheduler.ensure_success().is_ok());
}

#[test]
fn test_failure_stops_run_and_is_reported() {
    let net = Net::linear([
        ("export", publish("exported", json!(true))),
        (
            "upload",
            task_fn(|_| anyhow::bail!("image service returned 503")),
        ),
        ("boot", publish("booted", json!(true))),
    ])
    .unwrap();
    let mut scheduler =
        Scheduler::top_level(Rc::new(net), Namespace::new(), EngineConfig::default());

    assert_eq!(scheduler.run(), RunStatus::Failed);
    assert!(scheduler.namespace().contains("exported"));
    assert!(!scheduler.namespace().contains("booted"));

    let failure = scheduler.failure().expect("failure recorded");
    assert_eq!(failure.task, TaskId::from("upload"));
    assert!(!failure.is_configuration());
    let err = scheduler.ensure_success().unwrap_err().to_string();
    assert!(err.contains("upload"));
    assert!(err.contains("503"));
}

#[test]
fn test_action_selects_direct_flow() {
    let namespace = Namespace::new();
    namespace.set("boot_mode", "boot_volume");
    let mut scheduler = Scheduler::top_level(boot_net(), namespace, EngineConfig::default());

    assert_eq!(scheduler.run(), RunStatus::Completed);
    assert_eq!(scheduler.namespace().get("flow"), Some(json!("volume")));
    assert_eq!(scheduler.namespace().get("done"), Some(json!(true)));
}

#[test]
fn test_default_path_without_selection() {
    let namespace = Namespace::new();
    namespace.set("boot_mode", "image");
    let mut scheduler = Scheduler::top_level(boot_net(), namespace, EngineConfig::default());

    assert_eq!(scheduler.run(), RunStatus::Completed);
    assert_eq!(scheduler.namespace().get("flow"), Some(json!("image")));
}

#[test]
fn test_out_of_range_path_fails_run() {
    let net = Net::builder()
        .task(
            "check",
            task_fn(|ctx| {
                ctx.set_next_path(5);
                Ok(Vars::new())
            }),
        )
        .branches("check", 2)
        .build()
        .unwrap();
    let mut scheduler =
        Scheduler::top_level(Rc::new(net), Namespace::new(), EngineConfig::default());

    assert_eq!(scheduler.run(), RunStatus::Failed);
    let failure = scheduler.failure().unwrap();
    assert!(failure.is_configuration());
    assert!(matches!(
        failure.error.downcast_ref::<EngineError>(),
        Some(EngineError::PathOutOfRange {
            index: 5,
            available: 2,
            ..
        })
    ));
}

#[test]
fn test_inline_fork_aliases_parent_vars_by_default() {
    let sub = Net::linear([("copy_disk", publish("disk_copied", json!(true)))]).unwrap();
    let net = Net::linear([
        ("transport", ForkTask::shared(Rc::new(sub))),
        ("finish", publish("finished", json!(true))),
    ])
    .unwrap();
    let mut scheduler = Scheduler::top_level(Rc::new(net), Namespace::new(), inline(false));

    assert_eq!(scheduler.run(), RunStatus::Completed);
    assert_eq!(scheduler.namespace().get("disk_copied"), Some(json!(true)));
    assert_eq!(scheduler.namespace().child_count(), 1);
}

#[test]
fn test_isolated_inline_fork_keeps_vars_apart() {
    let sub = Net::linear([("copy_disk", publish("disk_copied", json!(true)))]).unwrap();
    let net = Net::linear([("transport", ForkTask::shared(Rc::new(sub)))]).unwrap();
    let namespace = Namespace::new();
    namespace.set("cloud", "src");
    let mut scheduler = Scheduler::top_level(Rc::new(net), namespace, inline(true));

    assert_eq!(scheduler.run(), RunStatus::Completed);
    assert!(!scheduler.namespace().contains("disk_copied"));

    let task = TaskId::from("transport");
    let record = scheduler.namespace().child(&task).expect("child registered");
    assert_eq!(record.namespace.get("disk_copied"), Some(json!(true)));
    // the copy starts from the parent's vars
    assert_eq!(record.namespace.get("cloud"), Some(json!("src")));
    assert_eq!(record.scheduler.borrow().status(), RunStatus::Completed);
    assert!(!scheduler.is_child_active(&task));
}

#[test]
fn test_failed_inline_branch_does_not_fail_parent() {
    let sub = Net::linear([("broken", task_fn(|_| anyhow::bail!("disk not found")))]).unwrap();
    let net = Net::linear([
        ("transport", ForkTask::shared(Rc::new(sub))),
        ("finish", publish("finished", json!(true))),
    ])
    .unwrap();
    let mut scheduler = Scheduler::top_level(Rc::new(net), Namespace::new(), inline(true));

    assert_eq!(scheduler.run(), RunStatus::Completed);
    assert!(scheduler.namespace().contains("finished"));

    let record = scheduler
        .namespace()
        .child(&TaskId::from("transport"))
        .unwrap();
    assert_eq!(record.scheduler.borrow().status(), RunStatus::Failed);
}

#[test]
fn test_plan_runs_inline() {
    let plan = Plan::from_json(
        r#"{
            "vars": {"boot_mode": "boot_volume"},
            "entry": "check",
            "tasks": [
                {"id": "check", "type": "branch", "var": "boot_mode", "equals": "boot_volume",
                 "next": ["image_flow", "volume_flow"]},
                {"id": "image_flow", "type": "set", "values": {"flow": "image"}},
                {"id": "volume_flow", "type": "set", "values": {"flow": "volume"}, "next": ["host"]},
                {"id": "host", "type": "command", "program": "echo", "args": ["dst-node"],
                 "output": "target_host"}
            ]
        }"#,
    )
    .expect("valid plan");
    let net = plan.build_net().expect("valid net");
    let mut scheduler =
        Scheduler::top_level(net, Namespace::with_vars(plan.vars), EngineConfig::default());

    assert_eq!(scheduler.run(), RunStatus::Completed);
    assert_eq!(scheduler.namespace().get("flow"), Some(json!("volume")));
    assert_eq!(scheduler.namespace().get("target_host"), Some(json!("dst-node")));
}

#[test]
fn test_scheduler_over_cursor_built_by_hand() {
    let net = Rc::new(Net::linear([("only", publish("ran", json!(1)))]).unwrap());
    let mut scheduler = Scheduler::base(Namespace::new(), Cursor::new(net));
    assert_eq!(scheduler.run(), RunStatus::Completed);
    // a second run is ignored
    assert_eq!(scheduler.run(), RunStatus::Completed);
    assert_eq!(scheduler.namespace().get("ran"), Some(json!(1)));
}

#[derive(Clone, Default)]
struct SharedSleeper {
    delays: Rc<RefCell<Vec<Duration>>>,
}

impl Sleeper for SharedSleeper {
    fn sleep(&self, delay: Duration) {
        self.delays.borrow_mut().push(delay);
    }
}

#[test]
fn test_tasks_poll_with_engine_polling_config() {
    let sleeper = SharedSleeper::default();
    let poller = StatusPoller::with_sleeper(sleeper.clone());
    let stuck = |_: &str| -> anyhow::Result<String> { Ok("SAVING".to_string()) };

    let waits = Rc::new(RefCell::new(Vec::new()));
    let record = Rc::clone(&waits);
    let wait_for_snapshot = task_fn(move |ctx| {
        let polling = ctx.polling();
        let backoff = poller.wait_for_status_configured("snap-1", &stuck, "active", polling);
        record.borrow_mut().push(sleeper.delays.take());
        let fixed =
            poller.wait_for_status_with_configured_retries("snap-1", &stuck, "active", polling);
        record.borrow_mut().push(sleeper.delays.take());

        let timed_out = [backoff, fixed].iter().all(|r| matches!(r, Err(e) if is_timeout(e)));
        Ok(Vars::from([("timed_out".to_string(), json!(timed_out))]))
    });

    let net = Net::linear([("wait_for_snapshot", wait_for_snapshot)]).unwrap();
    let config = EngineConfig {
        polling: PollingConfig {
            timeout_secs: 3,
            retries: 2,
            interval_secs: 1,
        },
        ..EngineConfig::default()
    };
    let mut scheduler = Scheduler::top_level(Rc::new(net), Namespace::new(), config);

    assert_eq!(scheduler.run(), RunStatus::Completed);
    assert_eq!(scheduler.namespace().get("timed_out"), Some(json!(true)));
    let secs = |values: &[u64]| -> Vec<Duration> {
        values.iter().map(|&s| Duration::from_secs(s)).collect()
    };
    assert_eq!(*waits.borrow(), vec![secs(&[1, 2]), secs(&[1, 1])]);
}
