//! Task-sequence training binary.
//!
//! Usage:
//!   pcrl-train [OPTIONS]
//!
//! Examples:
//!   # Two tasks in the default room with online consolidation
//!   pcrl-train --tasks 2 --iterations 5000
//!
//!   # Fisher consolidation from a config file
//!   pcrl-train --config run.toml --consolidation fisher --out ./runs/ewc
//!
//! Creating a file named `STOP` in the output directory ends training at
//! the next iteration; snapshots written so far are kept.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use candle_core::Device;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use predictive_rl_rs::config::{ConsolidationMethod, RunConfig};
use predictive_rl_rs::environment::RoomEnvironment;
use predictive_rl_rs::trainer::{StopHandle, Trainer};

#[derive(Parser)]
#[command(name = "pcrl-train")]
#[command(about = "Train a predictive-coding RL agent on a sequence of room tasks")]
#[command(version)]
struct Args {
    /// Run configuration (TOML with [agent], [trainer] and [room] sections)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Number of sequential tasks
    #[arg(short = 't', long)]
    tasks: Option<usize>,

    /// Maximum iterations per task
    #[arg(short = 'i', long)]
    iterations: Option<usize>,

    /// Consolidation strategy (online, fisher, none)
    #[arg(long)]
    consolidation: Option<ConsolidationMethod>,

    /// Seed for initialization, sampling and agent placement
    #[arg(long)]
    seed: Option<u64>,

    /// Output directory for snapshots, weights and the run summary
    #[arg(short = 'o', long)]
    out: Option<PathBuf>,

    /// Use CUDA when available
    #[arg(long)]
    cuda: bool,

    /// CUDA device index
    #[arg(long, default_value = "0")]
    cuda_device: usize,
}

/// Poll for `<dir>/STOP` until training finishes.
fn watch_stop_file(dir: &Path, stop: StopHandle, done: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    let stop_file = dir.join("STOP");
    thread::spawn(move || {
        while !done.load(Ordering::SeqCst) {
            if stop_file.exists() {
                warn!(path = %stop_file.display(), "stop file found, finishing current iteration");
                stop.request_stop();
                return;
            }
            thread::sleep(Duration::from_millis(500));
        }
    })
}

fn main() -> anyhow::Result<()> {
    // Parse arguments
    let args = Args::parse();

    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("predictive_rl_rs=info".parse()?),
        )
        .init();

    let mut run = match &args.config {
        Some(path) => RunConfig::from_file(path)?,
        None => RunConfig::default(),
    };

    // Command line overrides
    if let Some(tasks) = args.tasks {
        run.trainer.num_tasks = tasks;
    }
    if let Some(iterations) = args.iterations {
        run.trainer.iterations_per_task = iterations;
    }
    if let Some(method) = args.consolidation {
        run.agent.consolidation = method;
    }
    if let Some(seed) = args.seed {
        run.agent.seed = seed;
        run.room.seed = seed;
    }
    if let Some(out) = &args.out {
        run.trainer.snapshot_dir = out.clone();
    }
    run.validate()?;

    let device = if args.cuda {
        Device::cuda_if_available(args.cuda_device)?
    } else {
        Device::Cpu
    };
    info!(?device, tasks = run.trainer.num_tasks, "starting run");

    let out_dir = run.trainer.snapshot_dir.clone();
    let run_name = run.trainer.run_name.clone();
    std::fs::create_dir_all(&out_dir)?;
    run.to_file(out_dir.join(format!("{run_name}_config.toml")))?;

    let mut env = RoomEnvironment::new(run.room.clone(), run.agent.batch_size)?;
    let mut trainer = Trainer::new(&run.agent, run.trainer.clone(), &device)?;

    let done = Arc::new(AtomicBool::new(false));
    let watcher = watch_stop_file(&out_dir, trainer.stop_handle(), done.clone());

    let result = trainer.run(&mut env);
    done.store(true, Ordering::SeqCst);
    if watcher.join().is_err() {
        warn!("stop file watcher panicked");
    }
    let summary = result?;

    let weights = out_dir.join(format!("{run_name}_params.safetensors"));
    trainer.model().params().save(&weights)?;
    let summary_path = out_dir.join(format!("{run_name}_summary.json"));
    std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;

    for task in &summary.tasks {
        info!(
            task = task.task,
            iterations = task.iterations,
            accuracy = task.recent_accuracy,
            early_stopped = task.early_stopped,
            "task summary"
        );
    }
    info!(
        stop_reason = ?summary.stop_reason,
        weights = %weights.display(),
        summary = %summary_path.display(),
        "run complete"
    );

    Ok(())
}
