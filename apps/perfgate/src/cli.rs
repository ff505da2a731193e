use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{Overrides, ProcessMode};

#[derive(Debug, Parser)]
#[command(
    name = "perfgate",
    version,
    about = "Benchmark harness: drive load against a service, sample its metrics and grade them against targets."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the scenarios in a scenario file and grade them.
    Run(RunArgs),
    /// Load and validate a scenario file without starting anything.
    Validate(RunArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Scenario file (.toml or .json).
    pub scenario_file: PathBuf,

    /// Base URL for health, metrics and load traffic (overrides the file and PERFGATE_TARGET_URL).
    #[arg(long)]
    pub target_url: Option<String>,

    /// Command to launch the service under test; the harness owns its lifecycle.
    #[arg(long, conflicts_with = "attach_pid")]
    pub exec: Option<String>,

    /// PID of an already running service; enables process metrics without owning it.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=i32::MAX as i64))]
    pub attach_pid: Option<u32>,

    /// Write the results as JSON (one object for one scenario, an array otherwise).
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Write a Markdown report.
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Previous --output file to check for regressions against.
    #[arg(long)]
    pub baseline: Option<PathBuf>,

    /// Health path polled for readiness (default /health).
    #[arg(long)]
    pub health_path: Option<String>,

    /// Seconds to wait for the target to become ready.
    #[arg(long)]
    pub startup_timeout_secs: Option<u64>,

    /// Seconds between SIGTERM and SIGKILL when stopping an --exec target.
    #[arg(long)]
    pub stop_grace_secs: Option<u64>,

    /// Append the --exec target's stdout to this file.
    #[arg(long, requires = "exec")]
    pub exec_log: Option<PathBuf>,

    /// Only run the named scenario (repeatable).
    #[arg(long = "scenario")]
    pub scenarios: Vec<String>,

    /// Run scenarios concurrently instead of one after another.
    #[arg(long, default_value_t = false, conflicts_with = "exec")]
    pub parallel: bool,
}

impl RunArgs {
    pub fn overrides(&self) -> Overrides {
        let process = match (&self.exec, self.attach_pid) {
            (Some(command), _) => ProcessMode::Exec(command.clone()),
            (None, Some(pid)) => ProcessMode::AttachPid(pid),
            (None, None) => ProcessMode::Endpoint,
        };
        Overrides {
            target_url: self.target_url.clone(),
            health_path: self.health_path.clone(),
            startup_timeout_secs: self.startup_timeout_secs,
            stop_grace_secs: self.stop_grace_secs,
            process,
            exec_log: self.exec_log.clone(),
            scenarios: self.scenarios.clone(),
        }
    }
}
