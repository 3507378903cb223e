//! Training callbacks for monitoring and logging.
//!
//! - [`ProgressCallback`] - Progress bar for training visualization
//! - [`LoggingCallback`] - Step and evaluation metrics through `tracing`
//! - [`MetricsJsonCallback`] - JSONL metrics file
//! - [`CompositeCallback`] - Fan-out to several callbacks
//!
//! The JSONL file can be imported into experiment trackers that accept
//! offline metric files, one JSON object per line.

use sftpack_core::{EvalMetrics, StepMetrics, TrainingCallback};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Progress bar callback for training visualization.
pub struct ProgressCallback {
    progress: indicatif::ProgressBar,
}

impl ProgressCallback {
    /// Create a progress bar; its length is set when training starts.
    pub fn new() -> Self {
        let progress = indicatif::ProgressBar::new(0);
        let style = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .map(|style| style.progress_chars("#>-"))
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar());
        progress.set_style(style);
        Self { progress }
    }
}

impl Default for ProgressCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingCallback for ProgressCallback {
    fn on_train_start(&mut self, total_steps: usize) {
        self.progress.reset();
        self.progress.set_length(total_steps as u64);
    }

    fn on_train_end(&mut self, step: usize) {
        self.progress.set_position(step as u64);
        self.progress.finish_with_message("Training complete!");
    }

    fn on_step_end(&mut self, metrics: &StepMetrics) {
        self.progress.set_position(metrics.step as u64);
        self.progress.set_message(format!(
            "loss: {:.4} lr: {:.2e} [{}]",
            metrics.loss, metrics.learning_rate, metrics.phase
        ));
    }
}

/// Logging callback for training metrics.
#[derive(Debug, Default)]
pub struct LoggingCallback;

impl LoggingCallback {
    /// Create a new logging callback.
    pub fn new() -> Self {
        Self
    }
}

impl TrainingCallback for LoggingCallback {
    fn on_train_start(&mut self, total_steps: usize) {
        tracing::info!(total_steps, "Training started");
    }

    fn on_step_end(&mut self, metrics: &StepMetrics) {
        tracing::info!(
            step = metrics.step,
            epoch = metrics.epoch,
            phase = %metrics.phase,
            loss = metrics.loss,
            lr = metrics.learning_rate,
            grad_norm = metrics.grad_norm.unwrap_or(f64::NAN),
            effective_tokens_pct = metrics.effective_tokens_pct,
            mean_weight = metrics.reweight.mean_weight,
            alpha = metrics.reweight.alpha,
            skipped = metrics.skipped_steps,
            "Training step"
        );
        if let Some(q) = &metrics.loss_quantiles {
            tracing::debug!(
                step = metrics.step,
                q10 = q.q10,
                q50 = q.q50,
                q90 = q.q90,
                "Token loss quantiles"
            );
        }
    }

    fn on_evaluate(&mut self, step: usize, metrics: &EvalMetrics) {
        tracing::info!(
            step,
            loss = metrics.loss,
            perplexity = metrics.perplexity,
            "Evaluation"
        );
    }

    fn on_epoch_end(&mut self, epoch: usize) {
        tracing::info!(epoch, "Epoch complete");
    }
}

/// JSONL metrics callback.
///
/// The output format is JSONL with one JSON object per line:
///
/// ```json
/// {"step": 10, "loss": 2.5, "learning_rate": 2e-5, "phase": "warmup", "timestamp": "2026-01-01T12:00:00Z"}
/// {"event": "evaluate", "step": 100, "loss": 2.1, "timestamp": "2026-01-01T12:05:00Z"}
/// ```
pub struct MetricsJsonCallback {
    writer: BufWriter<File>,
    path: PathBuf,
    current_epoch: usize,
    run_name: Option<String>,
    config: Option<serde_json::Value>,
}

impl MetricsJsonCallback {
    /// Create a new JSONL metrics callback, truncating `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            current_epoch: 0,
            run_name: None,
            config: None,
        })
    }

    /// Set an optional run name for identification.
    pub fn with_run_name(mut self, name: impl Into<String>) -> Self {
        self.run_name = Some(name.into());
        self
    }

    /// Set training configuration to log at start.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }

    /// Get the path to the metrics file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_entry(&mut self, mut entry: serde_json::Value) {
        entry["timestamp"] = serde_json::json!(chrono::Utc::now().to_rfc3339());
        if let Ok(line) = serde_json::to_string(&entry) {
            if let Err(e) = writeln!(self.writer, "{}", line) {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to write metrics");
            }
        }
    }

    fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

impl TrainingCallback for MetricsJsonCallback {
    fn on_train_start(&mut self, total_steps: usize) {
        let mut entry = serde_json::json!({
            "event": "train_start",
            "total_steps": total_steps,
        });
        if let Some(ref name) = self.run_name {
            entry["run_name"] = serde_json::json!(name);
        }
        if let Some(ref config) = self.config {
            entry["config"] = config.clone();
        }
        self.write_entry(entry);
        self.flush();
    }

    fn on_train_end(&mut self, step: usize) {
        self.write_entry(serde_json::json!({
            "event": "train_end",
            "step": step,
        }));
        self.flush();
    }

    fn on_epoch_start(&mut self, epoch: usize) {
        self.current_epoch = epoch;
    }

    fn on_epoch_end(&mut self, epoch: usize) {
        self.write_entry(serde_json::json!({
            "event": "epoch_end",
            "epoch": epoch,
        }));
        self.flush();
    }

    fn on_step_end(&mut self, metrics: &StepMetrics) {
        let entry = match serde_json::to_value(metrics) {
            Ok(value) => value,
            Err(_) => serde_json::json!({ "step": metrics.step, "loss": metrics.loss }),
        };
        self.write_entry(entry);

        // Flush every 10 steps to balance I/O and data safety
        if metrics.step % 10 == 0 {
            self.flush();
        }
    }

    fn on_evaluate(&mut self, step: usize, metrics: &EvalMetrics) {
        self.write_entry(serde_json::json!({
            "event": "evaluate",
            "step": step,
            "epoch": self.current_epoch,
            "loss": metrics.loss,
            "perplexity": metrics.perplexity,
            "sources": metrics.custom,
        }));
        self.flush();
    }

    fn on_save(&mut self, path: &Path) {
        self.write_entry(serde_json::json!({
            "event": "checkpoint_saved",
            "path": path.display().to_string(),
        }));
        self.flush();
    }
}

impl Drop for MetricsJsonCallback {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Composite callback that forwards events to multiple callbacks.
///
/// # Example
///
/// ```ignore
/// use sftpack_trainer::{CompositeCallback, MetricsJsonCallback, ProgressCallback, TrainingLoop};
///
/// let mut composite = CompositeCallback::new();
/// composite.add(Box::new(ProgressCallback::new()));
/// composite.add(Box::new(MetricsJsonCallback::new("metrics.jsonl")?));
/// let trainer = TrainingLoop::new(config)?.with_callback(composite);
/// ```
pub struct CompositeCallback {
    callbacks: Vec<Box<dyn TrainingCallback>>,
}

impl CompositeCallback {
    /// Create a new empty composite callback.
    pub fn new() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }

    /// Add a callback to the composite.
    pub fn add(&mut self, callback: Box<dyn TrainingCallback>) {
        self.callbacks.push(callback);
    }

    /// Get the number of callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Check if there are no callbacks.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl Default for CompositeCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingCallback for CompositeCallback {
    fn on_train_start(&mut self, total_steps: usize) {
        for cb in &mut self.callbacks {
            cb.on_train_start(total_steps);
        }
    }

    fn on_train_end(&mut self, step: usize) {
        for cb in &mut self.callbacks {
            cb.on_train_end(step);
        }
    }

    fn on_epoch_start(&mut self, epoch: usize) {
        for cb in &mut self.callbacks {
            cb.on_epoch_start(epoch);
        }
    }

    fn on_epoch_end(&mut self, epoch: usize) {
        for cb in &mut self.callbacks {
            cb.on_epoch_end(epoch);
        }
    }

    fn on_step_end(&mut self, metrics: &StepMetrics) {
        for cb in &mut self.callbacks {
            cb.on_step_end(metrics);
        }
    }

    fn on_evaluate(&mut self, step: usize, metrics: &EvalMetrics) {
        for cb in &mut self.callbacks {
            cb.on_evaluate(step, metrics);
        }
    }

    fn on_save(&mut self, path: &Path) {
        for cb in &mut self.callbacks {
            cb.on_save(path);
        }
    }
}
