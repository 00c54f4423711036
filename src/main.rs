//! Command-line interface for dv3.
//!
//! `synthesize` turns a text file into one WAV and one alignment plot per line,
//! `checkpoints` lists what an output directory holds, and `init` writes a
//! freshly initialized checkpoint for smoke-testing a configuration.

use anyhow::{bail, Result};
use burn::tensor::backend::Backend;
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::{ArgGroup, Args, Parser, Subcommand};
use dv3::checkpoint::{list_checkpoints, resolve, save_checkpoint, CheckpointSelector};
use dv3::config::{load_config, resolve_relative_path, Config};
use dv3::model::TtsModel;
use dv3::perf;
use dv3::runtime::{ExecutionContext, SynthesisRuntime};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(not(feature = "backend-wgpu"))]
use dv3::error::Dv3Error;

#[cfg(feature = "backend-wgpu")]
use burn_wgpu::graphics::AutoGraphicsApi;
#[cfg(feature = "backend-wgpu")]
use burn_wgpu::{init_setup, Wgpu, WgpuDevice};

/// Top-level CLI options.
#[derive(Parser)]
#[command(name = "dv3")]
#[command(about = "Attention-windowed text-to-speech with Griffin-Lim vocoding", long_about = None)]
struct Cli {
    /// Print performance summary at the end of the run.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize every line of a text file.
    Synthesize(SynthesizeArgs),
    /// List checkpoints in an output directory.
    Checkpoints {
        /// Experiment output directory.
        output: PathBuf,
    },
    /// Write a randomly initialized checkpoint.
    Init {
        /// Experiment configuration YAML.
        #[arg(long)]
        config: PathBuf,
        /// Experiment output directory.
        #[arg(long)]
        output: PathBuf,
        /// Iteration to record in the checkpoint.
        #[arg(long, default_value_t = 0)]
        iteration: u64,
    },
}

#[derive(Args)]
#[command(group(ArgGroup::new("selector").args(["checkpoint", "iteration"])))]
struct SynthesizeArgs {
    /// Experiment configuration YAML.
    #[arg(long)]
    config: PathBuf,
    /// Explicit checkpoint file.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Load `step-<N>` from the output directory.
    #[arg(long)]
    iteration: Option<u64>,
    /// -1 for CPU, otherwise a GPU index.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    device: i32,
    /// Text file, one utterance per line.
    text: PathBuf,
    /// Experiment output directory.
    output: PathBuf,
}

impl SynthesizeArgs {
    fn selector(&self) -> CheckpointSelector {
        match (&self.checkpoint, self.iteration) {
            (Some(path), _) => CheckpointSelector::Path(path.clone()),
            (None, Some(step)) => CheckpointSelector::Iteration(step),
            (None, None) => CheckpointSelector::Latest,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

/// Load the config and resolve the dictionary path against its location.
fn load_experiment_config(path: &Path) -> Result<Config> {
    let mut config = load_config(path)?;
    if let Some(dict) = config.frontend.cmudict_path.take() {
        let resolved = resolve_relative_path(path, &dict);
        config.frontend.cmudict_path = Some(resolved.to_string_lossy().into_owned());
    }
    Ok(config)
}

/// Entry point for the CLI.
fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let verbose = cli.verbose;

    let result = match cli.command {
        Commands::Synthesize(args) => run_synthesize(args),
        Commands::Checkpoints { output } => run_checkpoints(&output),
        Commands::Init {
            config,
            output,
            iteration,
        } => run_init(&config, &output, iteration),
    };

    if verbose {
        eprintln!("{}", perf::report());
    }
    result
}

fn run_synthesize(args: SynthesizeArgs) -> Result<()> {
    let config = load_experiment_config(&args.config)?;
    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupt_flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        interrupt_flag.store(true, Ordering::SeqCst);
    })?;

    if args.device < 0 {
        let context = ExecutionContext::<NdArray<f32>>::new(NdArrayDevice::default());
        return synthesize_with(&config, &args, context, &interrupted);
    }
    #[cfg(feature = "backend-wgpu")]
    {
        let device = WgpuDevice::DiscreteGpu(args.device as usize);
        init_setup::<AutoGraphicsApi>(&device, Default::default());
        synthesize_with(&config, &args, ExecutionContext::<Wgpu>::new(device), &interrupted)
    }
    #[cfg(not(feature = "backend-wgpu"))]
    {
        Err(Dv3Error::Device(format!(
            "GPU device {} requested but dv3 was built without the backend-wgpu feature",
            args.device
        ))
        .into())
    }
}

fn synthesize_with<B: Backend>(
    config: &Config,
    args: &SynthesizeArgs,
    context: ExecutionContext<B>,
    interrupted: &AtomicBool,
) -> Result<()> {
    let runtime =
        SynthesisRuntime::<B>::from_checkpoint(config, &args.selector(), &args.output, context)?;
    let report = runtime.synthesize_file(&args.text, &args.output, Some(interrupted))?;
    info!(
        written = report.written.len(),
        failed = report.failed.len(),
        iteration = runtime.iteration(),
        "synthesis finished"
    );
    if report.interrupted {
        bail!("interrupted");
    }
    if !report.failed.is_empty() {
        let lines: Vec<String> = report.failed.iter().map(|(i, _)| i.to_string()).collect();
        bail!(
            "{} of {} lines failed (lines {})",
            report.failed.len(),
            report.failed.len() + report.written.len(),
            lines.join(", ")
        );
    }
    Ok(())
}

fn run_checkpoints(output: &Path) -> Result<()> {
    let found = list_checkpoints(output)?;
    if found.is_empty() {
        println!("no checkpoints under {}", output.display());
        return Ok(());
    }
    let latest = resolve(&CheckpointSelector::Latest, output)
        .ok()
        .and_then(|(_, step)| step);
    for (step, path) in found {
        let marker = if Some(step) == latest { " (latest)" } else { "" };
        println!("{step}\t{}{marker}", path.display());
    }
    Ok(())
}

fn run_init(config_path: &Path, output: &Path, iteration: u64) -> Result<()> {
    let config = load_experiment_config(config_path)?;
    let device = NdArrayDevice::default();
    let model = TtsModel::<NdArray<f32>>::from_config(&config, &device);
    let path = save_checkpoint(
        model.state_dict()?,
        output,
        iteration,
        &model.weight_norm_layers(),
    )?;
    println!("{}", path.display());
    Ok(())
}
