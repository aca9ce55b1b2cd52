//! CloudShift - Main entry point
//!
//! Loads a plan file, runs it on a top-level scheduler and reports the
//! final vars as JSON on stdout.

use anyhow::Context;
use cloudshift::cli::{Cli, Commands};
use cloudshift::process_guard::{self, ProcessGuard};
use cloudshift::{EngineConfig, ERROR_EXIT_CODE, ForkMode, Namespace, Plan, RunStatus, Scheduler};
use std::path::Path;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize the logger; `RUST_LOG` overrides the default `info` level
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_logger();
    debug!("CloudShift starting up");

    let cli = Cli::parse_args();
    let code = match cli.command {
        Commands::Validate { plan } => validate(&plan),
        Commands::Run {
            plan,
            config,
            fork_mode,
        } => match run(&plan, config.as_deref(), fork_mode) {
            Ok(code) => code,
            Err(e) => {
                error!("Run aborted: {:#}", e);
                eprintln!("✗ {:#}", e);
                ERROR_EXIT_CODE
            }
        },
    };
    std::process::exit(code);
}

fn validate(path: &Path) -> i32 {
    info!("Validating plan file: {:?}", path);
    let checked = Plan::load_from_file(path).and_then(|plan| {
        let net = plan.build_net()?;
        Ok(net.len())
    });
    match checked {
        Ok(tasks) => {
            println!("✓ Plan is valid ({} tasks): {:?}", tasks, path);
            0
        }
        Err(e) => {
            error!("Plan validation failed: {:#}", e);
            eprintln!("✗ Plan validation failed: {:#}", e);
            1
        }
    }
}

fn load_config(path: Option<&Path>, fork_mode: Option<ForkMode>) -> anyhow::Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(mode) = fork_mode {
        config.fork_mode = mode;
    }
    Ok(config)
}

/// Run a plan and collect its branches; returns the process exit code
fn run(plan_path: &Path, config_path: Option<&Path>, fork_mode: Option<ForkMode>) -> anyhow::Result<i32> {
    let config = load_config(config_path, fork_mode)?;
    let plan = Plan::load_from_file(plan_path)?;
    let net = plan.build_net().context("Plan does not describe a valid net")?;

    let grace = config.shutdown_grace();
    if let Err(e) = process_guard::init_signal_handlers(grace) {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    // Terminates branches left behind if we bail out early
    let _guard = ProcessGuard::new(grace);

    info!(
        "Running plan {:?} ({} tasks, fork mode: {})",
        plan_path,
        net.len(),
        config.fork_mode
    );
    let mut scheduler = Scheduler::top_level(net, Namespace::with_vars(plan.vars), config);
    let status = scheduler.run();

    let mut branches_failed = 0usize;
    for (task, outcome) in scheduler.collect_children() {
        match outcome {
            Ok(outcome) if outcome.succeeded() => {
                info!("Branch '{}' completed", task);
            }
            Ok(outcome) => {
                branches_failed += 1;
                error!(
                    "Branch '{}' failed at {:?}: {}",
                    task,
                    outcome.failed_task,
                    outcome.error.as_deref().unwrap_or("no error reported")
                );
            }
            Err(e) => {
                branches_failed += 1;
                error!("Could not collect branch '{}': {}", task, e);
            }
        }
    }

    let vars = serde_json::to_string_pretty(&scheduler.namespace().snapshot())
        .context("Failed to serialize final vars")?;
    println!("{}", vars);

    if let Err(e) = scheduler.ensure_success() {
        eprintln!("✗ {:#}", e);
    }
    if status == RunStatus::Completed && branches_failed > 0 {
        eprintln!("✗ {} branch(es) failed", branches_failed);
        return Ok(ERROR_EXIT_CODE);
    }
    Ok(status.exit_code())
}
