//! sftpack CLI - packing statistics, configuration checks and learning-rate tables.
//!
//! Training itself is a library call (`TrainingLoop::run` in sftpack-trainer)
//! because the model is supplied by the embedding application.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sftpack_core::{ExampleSource, SchedulerBuilder, TrainingConfig};
use sftpack_data::{JsonlExampleSource, PackedDataLoader, PackingStats};

#[derive(Parser)]
#[command(name = "sftpack")]
#[command(author, version, about = "Packed supervised fine-tuning toolkit", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Configuration file plus command-line overrides.
#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    /// Path to training configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Learning rate
    #[arg(long)]
    learning_rate: Option<f64>,

    /// Number of epochs
    #[arg(long)]
    num_train_epochs: Option<usize>,

    /// Packed window length
    #[arg(long)]
    max_seq_length: Option<usize>,

    /// Windows per micro-batch
    #[arg(long)]
    per_device_train_batch_size: Option<usize>,

    /// Micro-batches per optimizer step
    #[arg(long)]
    gradient_accumulation_steps: Option<usize>,

    /// Fraction of steps spent warming up
    #[arg(long)]
    warmup_ratio: Option<f64>,

    /// Fraction of steps spent cooling down
    #[arg(long)]
    cooldown_ratio: Option<f64>,

    /// Output directory
    #[arg(short, long)]
    output_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Dry-run the packer over a dataset and print packing statistics
    PackStats {
        #[command(flatten)]
        config: ConfigArgs,

        /// Dataset path (pre-tokenized JSONL)
        #[arg(short, long)]
        dataset: PathBuf,

        /// Epoch to pack (selects the shuffle order)
        #[arg(long, default_value = "0")]
        epoch: usize,
    },

    /// Load and validate a configuration, then print the schedule boundaries
    Validate {
        #[command(flatten)]
        config: ConfigArgs,

        /// Total optimizer steps (defaults to max_train_steps)
        #[arg(long)]
        total_steps: Option<usize>,
    },

    /// Print the learning-rate table of a run
    Schedule {
        #[command(flatten)]
        config: ConfigArgs,

        /// Total optimizer steps (defaults to max_train_steps)
        #[arg(long)]
        total_steps: Option<usize>,

        /// Print every N-th step
        #[arg(long, default_value = "1")]
        every: usize,
    },
}

impl ConfigArgs {
    /// Read the YAML file (or defaults), apply overrides and validate.
    fn load(&self) -> anyhow::Result<TrainingConfig> {
        let mut config: TrainingConfig = match &self.config {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => TrainingConfig::default(),
        };

        if let Some(lr) = self.learning_rate {
            config.learning_rate = lr;
        }
        if let Some(epochs) = self.num_train_epochs {
            config.num_train_epochs = epochs;
        }
        if let Some(len) = self.max_seq_length {
            config.max_seq_length = len;
        }
        if let Some(batch_size) = self.per_device_train_batch_size {
            config.per_device_train_batch_size = batch_size;
        }
        if let Some(steps) = self.gradient_accumulation_steps {
            config.gradient_accumulation_steps = steps;
        }
        if let Some(ratio) = self.warmup_ratio {
            config.warmup_ratio = ratio;
        }
        if let Some(ratio) = self.cooldown_ratio {
            config.cooldown_ratio = ratio;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::PackStats {
            config,
            dataset,
            epoch,
        } => run_pack_stats(config.load()?, dataset, epoch).await,
        Commands::Validate {
            config,
            total_steps,
        } => run_validate(&config.load()?, total_steps),
        Commands::Schedule {
            config,
            total_steps,
            every,
        } => run_schedule(&config.load()?, total_steps, every),
    }
}

/// Dry-run one epoch, stopping early once `interrupted` is raised.
///
/// Returns `None` when the pass was interrupted.
fn pack_dataset(
    config: &TrainingConfig,
    dataset: &Path,
    epoch: usize,
    interrupted: &AtomicBool,
) -> anyhow::Result<Option<PackingStats>> {
    let mut source = JsonlExampleSource::new(dataset);
    if config.shuffle {
        source = source.with_shuffle(config.seed);
    }
    let loader = PackedDataLoader::from_training_config(config)?;
    let examples = source
        .open(epoch)?
        .take_while(|_| !interrupted.load(Ordering::Relaxed));
    let stats = loader.dry_run_examples(examples)?;
    if interrupted.load(Ordering::Relaxed) {
        return Ok(None);
    }
    Ok(Some(stats))
}

/// Pack the dataset on a blocking thread; ctrl-c stops the pass.
async fn run_pack_stats(config: TrainingConfig, dataset: PathBuf, epoch: usize) -> anyhow::Result<()> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let mut task = {
        let path = dataset.clone();
        let pack_config = config.clone();
        let interrupted = Arc::clone(&interrupted);
        tokio::task::spawn_blocking(move || pack_dataset(&pack_config, &path, epoch, &interrupted))
    };

    let packed = tokio::select! {
        joined = &mut task => joined.context("Packing task panicked")??,
        _ = tokio::signal::ctrl_c() => {
            interrupted.store(true, Ordering::Relaxed);
            tracing::warn!("Interrupted, stopping packing pass");
            task.await.context("Packing task panicked")??;
            None
        }
    };
    let Some(stats) = packed else {
        anyhow::bail!("interrupted");
    };

    let steps_per_epoch = config.steps_per_epoch(stats.num_windows);
    println!("========================================");
    println!("Dataset:          {}", dataset.display());
    println!("Window length:    {}", config.max_seq_length);
    println!("Multipack:        {}", config.use_multipack);
    println!("{}", stats.summary());
    println!("Max seqs/window:  {}", stats.max_sequences_per_window);
    println!("Steps per epoch:  {steps_per_epoch}");
    println!("Total steps:      {}", config.total_steps(steps_per_epoch));
    println!("========================================");
    Ok(())
}

fn resolve_total_steps(config: &TrainingConfig, total_steps: Option<usize>) -> Option<usize> {
    total_steps.or(config.max_train_steps)
}

fn run_validate(config: &TrainingConfig, total_steps: Option<usize>) -> anyhow::Result<()> {
    println!("Configuration is valid.");
    println!("  learning_rate:   {:e}", config.learning_rate);
    println!("  scheduler:       {:?}", config.lr_scheduler_type);
    println!("  optimizer:       {:?} (rank {})", config.optimizer, config.ladamw_rank);
    println!(
        "  batch:           {} windows x {} accumulation x {} tokens",
        config.per_device_train_batch_size, config.gradient_accumulation_steps, config.max_seq_length
    );
    println!("  reweighting:     {:?}", config.reweighting);

    match resolve_total_steps(config, total_steps) {
        Some(total) => {
            let scheduler = SchedulerBuilder::from_config(config, total).build()?;
            let (warmup, cooldown) = (scheduler.warmup_steps(), scheduler.cooldown_steps());
            println!("  total steps:     {total}");
            println!("  warmup:          steps 0..{warmup}");
            println!("  stable:          steps {warmup}..{}", total - cooldown);
            println!("  cooldown:        steps {}..{total}", total - cooldown);
        }
        None => println!(
            "  schedule:        warmup {:.0}% / cooldown {:.0}% (pass --total-steps for boundaries)",
            config.warmup_ratio * 100.0,
            config.cooldown_ratio * 100.0
        ),
    }
    Ok(())
}

fn run_schedule(config: &TrainingConfig, total_steps: Option<usize>, every: usize) -> anyhow::Result<()> {
    let total = resolve_total_steps(config, total_steps)
        .context("--total-steps is required when max_train_steps is not configured")?;
    if every == 0 {
        anyhow::bail!("--every must be > 0");
    }

    let scheduler = SchedulerBuilder::from_config(config, total).build()?;
    println!("{:>8}  {:<9}  {:>12}", "step", "phase", "lr");
    let mut steps: Vec<usize> = (0..=total).step_by(every).collect();
    if steps.last() != Some(&total) {
        steps.push(total);
    }
    for step in steps {
        println!(
            "{:>8}  {:<9}  {:>12.4e}",
            step,
            scheduler.phase(step).to_string(),
            scheduler.get_lr(step)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn jsonl(lines: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..lines {
            writeln!(
                file,
                r#"{{"id": {i}, "turns": [{{"role": "user", "tokens": [1, 2]}}, {{"role": "assistant", "tokens": [3, 4, 5]}}]}}"#
            )
            .unwrap();
        }
        file
    }

    #[test]
    fn test_pack_dataset_reports_stats() {
        let file = jsonl(3);
        let config = TrainingConfig {
            max_seq_length: 8,
            ..Default::default()
        };
        let stats = pack_dataset(&config, file.path(), 0, &AtomicBool::new(false))
            .unwrap()
            .unwrap();
        assert_eq!(stats.num_sequences, 3);
        assert_eq!(stats.num_windows, 3);
    }

    #[test]
    fn test_pack_dataset_stops_when_interrupted() {
        let file = jsonl(3);
        let interrupted = AtomicBool::new(true);
        let stats = pack_dataset(&TrainingConfig::default(), file.path(), 0, &interrupted).unwrap();
        assert!(stats.is_none());
    }
}
