use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, clap::Parser)]
#[clap(version, about)]
pub enum Cli {
    Check(CheckCmd),
    Exercise(ExerciseCmd),
}

/// Validate a configuration and show the devices it would export.
///
/// Every device is registered in a scratch in-memory namespace, its resulting geometry is
/// printed, and everything is torn down again.
#[derive(Debug, clap::Args)]
pub struct CheckCmd {
    #[clap(long, short)]
    pub config_file: PathBuf,
}

/// Start the cache and run a randomized, verified workload on every core device.
///
/// The run ends after the duration passes, or earlier when signaled via SIGINT (Ctrl-C) or
/// SIGTERM. All devices are stopped together before exiting.
#[derive(Debug, clap::Args)]
pub struct ExerciseCmd {
    #[clap(long, short)]
    pub config_file: PathBuf,
    #[clap(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub duration: Duration,
    /// Seed of the workload. Random if omitted.
    #[clap(long)]
    pub seed: Option<u64>,
    /// Workers per core device.
    #[clap(long, default_value_t = 2)]
    pub threads: usize,
}
