//! Copy-task training driver.
//!
//! Trains a Neural Turing Machine to reproduce random bit sequences, logging
//! moving averages of the replay bit loss and optionally streaming one JSON
//! report per iteration to a TCP sink.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use ntm_core::copy_task::{generate_sequence, replay_bit_loss};
use ntm_core::report::{IterationReport, LossWindow, Reporter};
use ntm_core::{load_checkpoint, save_checkpoint, Ntm, NtmConfig, RmsPropConfig, Trainer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ntm-copy")]
#[command(about = "Train a Neural Turing Machine on the copy task")]
struct Args {
    /// Seed for weight initialisation and sequence generation
    #[arg(long, default_value = "32702")]
    seed: u64,

    /// Bits per sequence element
    #[arg(long, default_value = "8")]
    width: usize,

    /// Controller hidden units
    #[arg(long, default_value = "100")]
    hidden: usize,

    /// Read/write heads
    #[arg(long, default_value = "1")]
    heads: usize,

    /// Memory rows
    #[arg(long, default_value = "128")]
    rows: usize,

    /// Memory columns
    #[arg(long, default_value = "20")]
    cols: usize,

    /// Network shape as JSON; overrides --hidden, --heads, --rows, --cols
    #[arg(long)]
    config: Option<PathBuf>,

    /// Longest copy sequence; lengths are drawn from 1..=max-len
    #[arg(long, default_value = "20")]
    max_len: usize,

    #[arg(short = 'n', long, default_value = "10000")]
    iterations: u64,

    /// Moving-average window and progress log interval
    #[arg(long, default_value = "100")]
    window: usize,

    /// Uniform init range [-scale, scale)
    #[arg(long, default_value = "0.5")]
    init_scale: f64,

    #[arg(long, default_value = "0.95")]
    decay: f64,

    #[arg(long, default_value = "0.5")]
    momentum: f64,

    #[arg(long, default_value = "0.001")]
    learning_rate: f64,

    #[arg(long, default_value = "0.001")]
    regularization: f64,

    /// Stream iteration reports to host:port
    #[arg(long)]
    report: Option<String>,

    /// Write a checkpoint after training
    #[arg(long)]
    save: Option<PathBuf>,

    /// Continue from a checkpoint instead of random weights
    #[arg(long)]
    resume: Option<PathBuf>,
}

impl Args {
    fn network_config(&self) -> Result<NtmConfig> {
        let cfg = match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("reading network config {}", path.display()))?;
                serde_json::from_str(&json).with_context(|| format!("parsing network config {}", path.display()))?
            }
            None => NtmConfig {
                hidden_size: self.hidden,
                head_count: self.heads,
                memory_rows: self.rows,
                memory_columns: self.cols,
                ..NtmConfig::copy_task(self.width)
            },
        };
        Ok(cfg)
    }

    fn optimizer_config(&self) -> RmsPropConfig {
        RmsPropConfig {
            decay: self.decay,
            momentum: self.momentum,
            learning_rate: self.learning_rate,
            regularization: self.regularization,
        }
    }
}

fn check_task_shape(cfg: &NtmConfig, width: usize) -> Result<()> {
    if cfg.input_size != width + 2 || cfg.output_size != width {
        bail!(
            "network shape {}→{} does not fit copy width {width} (expected {}→{width})",
            cfg.input_size,
            cfg.output_size,
            width + 2
        );
    }
    Ok(())
}

fn build_machine(args: &Args, rng: &mut StdRng) -> Result<Ntm> {
    if let Some(path) = &args.resume {
        let ntm = load_checkpoint(path).with_context(|| format!("loading checkpoint {}", path.display()))?;
        info!(path = %path.display(), weights = ntm.weights_count(), "resumed from checkpoint");
        return Ok(ntm);
    }
    let mut ntm = Ntm::new(args.network_config()?)?;
    ntm.randomize(rng, args.init_scale);
    Ok(ntm)
}

fn save(path: &Path, ntm: &Ntm) -> Result<()> {
    save_checkpoint(path, ntm).with_context(|| format!("saving checkpoint {}", path.display()))?;
    info!(path = %path.display(), "checkpoint written");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.width == 0 || args.max_len == 0 {
        bail!("--width and --max-len must be at least 1");
    }
    if !args.init_scale.is_finite() || args.init_scale <= 0.0 {
        bail!("--init-scale must be positive, got {}", args.init_scale);
    }
    let optimizer = args.optimizer_config();
    optimizer.validate()?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let ntm = build_machine(&args, &mut rng)?;
    check_task_shape(ntm.config(), args.width)?;
    info!(
        seed = args.seed,
        weights = ntm.weights_count(),
        hidden = ntm.config().hidden_size,
        heads = ntm.config().head_count,
        rows = ntm.config().memory_rows,
        cols = ntm.config().memory_columns,
        "starting copy-task training"
    );

    let mut reporter = match &args.report {
        Some(addr) => Reporter::connect_tcp(addr, Duration::from_secs(2)),
        None => Reporter::disabled(),
    };

    let mut trainer = Trainer::new(ntm);
    let mut losses = LossWindow::new(args.window);
    let mut times = LossWindow::new(args.window);
    let log_every = args.window.max(1) as u64;

    for iteration in 1..=args.iterations {
        let size = rng.gen_range(1..=args.max_len);
        let sequence = generate_sequence(&mut rng, size, args.width);

        let started = Instant::now();
        let step = match trainer.train(&sequence.inputs, &sequence.targets, &optimizer) {
            Ok(step) => step,
            Err(e) => {
                warn!(iteration, size, error = %e, "training stopped");
                if let Some(path) = &args.save {
                    save(path, trainer.ntm())?;
                }
                return Err(e).with_context(|| format!("iteration {iteration}"));
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let bits = replay_bit_loss(&sequence, &step.outputs);
        losses.push(bits);
        times.push(elapsed_ms as f64);
        reporter.report(&IterationReport { iteration, average_loss: bits, elapsed_ms, sequence_length: size });

        if iteration % log_every == 0 {
            info!(
                iteration,
                loss_bits = losses.mean(),
                ms_per_iter = times.mean(),
                "progress"
            );
        }
    }

    info!(iterations = trainer.iterations(), final_loss_bits = losses.mean(), "training finished");
    if let Some(path) = &args.save {
        save(path, trainer.ntm())?;
    }
    Ok(())
}
