use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use casblk::memory_disk::Namespace;
use casblk::service::{Cache, Config};
use casblk::workload;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{CheckCmd, Cli, ExerciseCmd};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();
    let cli = <Cli as clap::Parser>::parse();
    match cli {
        Cli::Check(cmd) => check_main(&cmd),
        Cli::Exercise(cmd) => exercise_main(&cmd),
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let buf = fs::read_to_string(path).context("failed to read config file")?;
    let config = toml::from_str::<Config>(&buf).context("failed to parse config file")?;
    config.validate().context("invalid config")?;
    Ok(config)
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

fn check_main(cmd: &CheckCmd) -> Result<()> {
    let config = load_config(&cmd.config_file)?;
    let rt = build_runtime()?;
    let ns = Namespace::new();
    let cache = Cache::new(&config, &ns, rt.handle())?;
    cache.start()?;
    for (name, limits) in ns.list() {
        println!(
            "{name}: {} ({}), logical block {}B, physical block {}B, max request {}, features {:?}, discard {}",
            limits.capacity,
            bytesize::ByteSize(limits.capacity.bytes()),
            limits.logical_block_size,
            limits.physical_block_size,
            limits.max_sectors,
            limits.features,
            if limits.discard.is_some() { "yes" } else { "no" },
        );
    }
    cache.stop()
}

fn exercise_main(cmd: &ExerciseCmd) -> Result<()> {
    let config = load_config(&cmd.config_file)?;
    let rt = build_runtime()?;
    let ns = Namespace::new();
    let cache = Cache::new(&config, &ns, rt.handle())?;
    cache.start()?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
            tracing::info!("signaled to stop, exiting");
            stop.store(true, Ordering::Relaxed);
        })
        .context("failed to setup signal handler")?;
    }
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);

    let disks = cache
        .cores()
        .iter()
        .map(|dev| ns.open(dev.name()).with_context(|| format!("failed to open {}", dev.name())))
        .map(|ret| ret.map(Arc::new))
        .collect::<Result<Vec<_>>>()?;
    let seed = cmd.seed.unwrap_or_else(rand::random);
    let opts = workload::Options {
        duration: cmd.duration,
        seed,
        threads: cmd.threads,
        max_request: config.io.max_io_size + config.io.max_io_size / 4,
    };
    tracing::info!(seed, devices = disks.len(), "running workload");
    let ret = rt.block_on(workload::run(disks, opts, stop));

    // Workers are joined and all handles are closed here, whatever the outcome.
    let stopped = cache.stop();
    let stats = ret.with_context(|| format!("workload failed with seed {seed}"))?;
    stopped?;
    tracing::info!(%stats, "workload passed");
    tracing::info!(cache_lines = cache.line_cache().len(), "line cache");
    Ok(())
}
