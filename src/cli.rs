use crate::config::ForkMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CloudShift - run cloud migration plans
#[derive(Parser)]
#[command(name = "cloudshift")]
#[command(about = "Task-graph engine for cloud-to-cloud migrations")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that a plan file describes a valid net
    Validate {
        /// Path to the plan file
        plan: PathBuf,
    },
    /// Run a plan to completion
    Run {
        /// Path to the plan file
        plan: PathBuf,

        /// Engine configuration file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override how forking tasks run (process or inline)
        #[arg(long)]
        fork_mode: Option<ForkMode>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
