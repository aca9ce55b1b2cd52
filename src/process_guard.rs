//! Lifecycle management for branch processes
//!
//! Process branches are fire-and-forget: the scheduler that forks them does
//! not wait. This module makes sure they do not outlive the engine.
//!
//! - Every branch (and every external command a built-in task spawns) leads
//!   its own process group and gets SIGTERM when its parent dies
//! - Branch PIDs are tracked in a global registry
//! - On exit (`ProcessGuard` drop, SIGTERM, SIGINT, SIGHUP) survivors get
//!   SIGTERM, then SIGKILL after a grace period

use crate::task::TaskId;
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, TryLockError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

static BRANCH_REGISTRY: OnceLock<Arc<Mutex<BranchRegistry>>> = OnceLock::new();

/// Branch processes that have been spawned and not yet collected
#[derive(Debug, Default)]
pub struct BranchRegistry {
    branches: HashMap<u32, TaskId>,
    cleanup_initiated: bool,
}

impl BranchRegistry {
    /// Get or create the global registry
    pub fn global() -> Arc<Mutex<BranchRegistry>> {
        BRANCH_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(BranchRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32, task: TaskId) {
        debug!("Registered branch '{}' as PID {}", task, pid);
        self.branches.insert(pid, task);
    }

    pub fn unregister(&mut self, pid: u32) -> Option<TaskId> {
        let task = self.branches.remove(&pid);
        debug!("Unregistered branch PID {}", pid);
        task
    }

    pub fn count(&self) -> usize {
        self.branches.len()
    }

    pub fn task_of(&self, pid: u32) -> Option<&TaskId> {
        self.branches.get(&pid)
    }

    /// Drop every entry without signalling and re-arm `terminate_all`
    pub fn forget_all(&mut self) {
        self.branches.clear();
        self.cleanup_initiated = false;
    }

    /// Empty the global registry a forked branch process inherited.
    ///
    /// Must not block: the lock may have been held by another thread of the
    /// parent at fork time, and that thread does not exist here.
    pub fn forget_inherited() {
        let registry = Self::global();
        match registry.try_lock() {
            Ok(mut registry) => registry.forget_all(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().forget_all(),
            Err(TryLockError::WouldBlock) => {
                warn!("Inherited branch registry is locked, leaving it untouched")
            }
        }
    }

    /// Terminate every tracked branch.
    ///
    /// Sends SIGTERM to each branch's process group, waits up to
    /// `grace_period`, then SIGKILLs whatever is left. Runs at most once.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            debug!("Branch cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.branches.is_empty() {
            debug!("No branch processes to terminate");
            return;
        }

        info!("Terminating {} branch process(es)...", self.branches.len());

        let pids: Vec<u32> = self.branches.keys().copied().collect();
        for &pid in &pids {
            if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
                debug!("Group SIGTERM to {} failed ({}), signalling the PID", pid, e);
                if let Err(e) = send_signal(pid, Signal::SIGTERM) {
                    warn!("Failed to send SIGTERM to branch PID {}: {}", pid, e);
                }
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if !pids.iter().any(|&pid| is_process_alive(pid)) {
                info!("All branch processes terminated gracefully");
                self.branches.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in &pids {
            if is_process_alive(pid) {
                let task = self.branches.get(&pid).map(ToString::to_string);
                warn!(
                    "Branch {:?} (PID {}) did not terminate, sending SIGKILL",
                    task, pid
                );
                if let Err(e) = send_signal_to_group(pid, Signal::SIGKILL) {
                    error!("Failed to send SIGKILL to process group {}: {}", pid, e);
                    let _ = send_signal(pid, Signal::SIGKILL);
                }
            }
        }

        self.branches.clear();
        info!("Branch process cleanup complete");
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Signal a whole process group (negative PID)
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Check if a process is still running (zombies count as dead)
pub fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/<pid>/stat is the state; Z = zombie, X = dead
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }

    true
}

/// RAII guard that terminates every uncollected branch on drop
pub struct ProcessGuard {
    registry: Arc<Mutex<BranchRegistry>>,
    grace_period: Duration,
}

impl ProcessGuard {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            registry: BranchRegistry::global(),
            grace_period,
        }
    }

    pub fn branch_count(&self) -> usize {
        self.registry.lock().map(|r| r.count()).unwrap_or(0)
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        debug!("ProcessGuard dropped, terminating leftover branches");
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(self.grace_period);
        }
    }
}

/// Install handlers for SIGINT, SIGTERM and SIGHUP that terminate all
/// branches and exit with 128 + signal. Call once at program start.
pub fn init_signal_handlers(grace_period: Duration) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };
            info!("Received {}, terminating branch processes...", signal_name);

            if let Ok(mut registry) = BranchRegistry::global().lock() {
                registry.terminate_all(grace_period);
            }
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Make the calling (freshly forked) process lead its own process group and
/// receive SIGTERM when its parent dies
pub fn enter_branch_process_group() -> Result<(), std::io::Error> {
    restore_default_signal_handlers()?;
    nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(std::io::Error::other)?;
    set_parent_death_signal()
}

/// Inherited handlers forward to a signal thread that does not exist after
/// fork, so the branch would ignore SIGTERM.
fn restore_default_signal_handlers() -> Result<(), std::io::Error> {
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        // SAFETY: installing SIG_DFL does not run any code in the handler.
        unsafe { signal::signal(sig, signal::SigHandler::SigDfl) }
            .map_err(std::io::Error::other)?;
    }
    Ok(())
}

fn set_parent_death_signal() -> Result<(), std::io::Error> {
    // SAFETY: prctl with PR_SET_PDEATHSIG only reads its integer arguments.
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Extension trait for `std::process::Command` spawned by tasks
pub trait CommandProcessGroup {
    /// Run the command in its own process group, tied to this process's life
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        self.process_group(0);
        // SAFETY: the hook only calls the async-signal-safe prctl.
        unsafe {
            self.pre_exec(set_parent_death_signal);
        }
        self
    }
}
