//! Training loop driver.
//!
//! Connects the packed data loader, the model, the loss reducer, the example
//! reweighter, the learning-rate schedule and [`LAdamW`]. One optimizer step:
//!
//! 1. take `gradient_accumulation_steps` masked micro-batches (prefetched)
//! 2. forward each window for per-token losses
//! 3. weigh the packed examples and reduce the loss
//! 4. backward with the per-token weights and accumulate gradients
//! 5. update with the scheduled rate (clipping, non-finite steps skipped)
//! 6. advance schedule, reweighter and [`TrainingState`]
//! 7. metrics, evaluation and checkpoints at their cadences
//!
//! The schedule advances on skipped steps too. The stop signal is only
//! checked between optimizer steps.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use sftpack_core::{
    CheckpointCadence, EvalMetrics, ExampleSource, LearningRateScheduler, LossQuantiles,
    Optimizer, ReweightSummary, Result, SchedulePhase, SchedulerBuilder, SftPackError,
    StepMetrics, StepOutcome, TrainingCallback, TrainingConfig,
};
use sftpack_data::{Example, MicroBatch, PackedBatch, PackedDataLoader};
use tracing::{debug, info, warn};

use crate::callbacks::CompositeCallback;
use crate::checkpoint::{CheckpointManager, CheckpointMetadata, CheckpointTag, TrainerSnapshot};
use crate::ladamw::{LAdamW, LAdamWConfig};
use crate::loss::{segment_signals, LossReducer};
use crate::params::ParameterSet;
use crate::retry::RetryPolicy;
use crate::reweight::{ExampleReweighter, ExampleSignal};

/// Model boundary of the training loop.
///
/// The model owns its parameters and computes per-token next-token losses
/// and their gradients. The loop never looks inside either.
pub trait TrainableModel {
    /// Trainable parameters, in a fixed order.
    fn parameters(&self) -> &ParameterSet;

    /// Mutable access for the optimizer update.
    fn parameters_mut(&mut self) -> &mut ParameterSet;

    /// Per-position loss of a packed window (length `window_len`).
    fn forward(&mut self, batch: &PackedBatch) -> Result<Vec<f32>>;

    /// Gradient of `sum_t token_weights[t] * loss_t`, one tensor per
    /// parameter in [`Self::parameters`] order.
    fn backward(&mut self, batch: &PackedBatch, token_weights: &[f32]) -> Result<Vec<Array2<f32>>>;

    /// Per-position loss for evaluation.
    fn forward_eval(&mut self, batch: &PackedBatch) -> Result<Vec<f32>> {
        self.forward(batch)
    }
}

/// Cooperative stop request, checked between optimizer steps.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// A signal that has not been raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop at the next step boundary.
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Position of the run. `step` and `epoch` only ever increase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrainingState {
    /// Optimizer steps committed.
    pub step: usize,
    /// Current epoch.
    pub epoch: usize,
    /// Schedule phase at `step`.
    pub phase: SchedulePhase,
    /// Micro-batches consumed in the current epoch.
    pub micro_batches_in_epoch: usize,
}

/// Summary of a finished or stopped run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    /// Final position.
    pub state: TrainingState,
    /// Terminal step of the run.
    pub total_steps: usize,
    /// Steps skipped because of non-finite gradients.
    pub skipped_steps: usize,
    /// Exponential moving average of the step loss.
    pub running_loss: Option<f64>,
    /// Best evaluation loss seen.
    pub best_eval_loss: Option<f64>,
    /// Wall-clock seconds spent in [`TrainingLoop::run`].
    pub elapsed_secs: f64,
}

/// How [`TrainingLoop::run`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainOutcome {
    /// The terminal step was reached.
    Completed(TrainSummary),
    /// The stop signal was raised.
    Stopped(TrainSummary),
}

impl TrainOutcome {
    /// Summary of the run.
    pub fn summary(&self) -> &TrainSummary {
        match self {
            Self::Completed(summary) | Self::Stopped(summary) => summary,
        }
    }

    /// Whether the run was stopped early.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }
}

/// Metrics gathered between two logging steps.
#[derive(Debug, Default)]
struct LogInterval {
    loss_sum: f64,
    loss_count: usize,
    supervised_tokens: usize,
    window_tokens: usize,
    learning_rate: f64,
    phase: SchedulePhase,
    grad_norm: Option<f64>,
    reweight: ReweightSummary,
    quantiles: Option<LossQuantiles>,
    steps: usize,
}

/// Optimizer-side state that lives for one call to `run`.
struct StepEngine {
    optimizer: LAdamW,
    scheduler: LearningRateScheduler,
    accumulated: Vec<Array2<f32>>,
    pending: usize,
    step_loss: (f64, usize),
    interval: LogInterval,
    started: Instant,
    stopped: bool,
    last_eval_step: Option<usize>,
    last_step_checkpoint: Option<usize>,
}

impl StepEngine {
    fn new(optimizer: LAdamW, scheduler: LearningRateScheduler, params: &ParameterSet) -> Self {
        Self {
            optimizer,
            scheduler,
            accumulated: params.zeros_like(),
            pending: 0,
            step_loss: (0.0, 0),
            interval: LogInterval::default(),
            started: Instant::now(),
            stopped: false,
            last_eval_step: None,
            last_step_checkpoint: None,
        }
    }

    fn accumulate(&mut self, grads: &[Array2<f32>]) -> Result<()> {
        if grads.len() != self.accumulated.len() {
            return Err(SftPackError::ShapeMismatch {
                expected: vec![self.accumulated.len()],
                actual: vec![grads.len()],
            });
        }
        for (acc, grad) in self.accumulated.iter_mut().zip(grads) {
            if acc.dim() != grad.dim() {
                return Err(SftPackError::ShapeMismatch {
                    expected: vec![acc.nrows(), acc.ncols()],
                    actual: vec![grad.nrows(), grad.ncols()],
                });
            }
            *acc += grad;
        }
        Ok(())
    }
}

/// Supervised fine-tuning loop over packed windows.
pub struct TrainingLoop {
    config: TrainingConfig,
    loader: PackedDataLoader,
    reducer: LossReducer,
    reweighter: ExampleReweighter,
    callbacks: CompositeCallback,
    checkpoints: Option<CheckpointManager>,
    eval_sources: Vec<Box<dyn ExampleSource<Item = Example>>>,
    stop: StopSignal,
    retry: RetryPolicy,
    state: TrainingState,
    pending_resume: Option<TrainerSnapshot>,
    best_eval_loss: Option<f64>,
    running_loss: Option<f64>,
    skipped_steps: usize,
}

impl TrainingLoop {
    /// Create a loop from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SftPackError::Config`] for an invalid configuration.
    pub fn new(config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let loader = PackedDataLoader::from_training_config(&config)?;
        Ok(Self {
            loader,
            reducer: LossReducer::from_training_config(&config),
            reweighter: ExampleReweighter::from_training_config(&config),
            callbacks: CompositeCallback::new(),
            checkpoints: None,
            eval_sources: Vec::new(),
            stop: StopSignal::new(),
            retry: RetryPolicy::new(config.io_retries),
            state: TrainingState::default(),
            pending_resume: None,
            best_eval_loss: None,
            running_loss: None,
            skipped_steps: 0,
            config,
        })
    }

    /// Add a callback.
    pub fn with_callback(mut self, callback: impl TrainingCallback + 'static) -> Self {
        self.callbacks.add(Box::new(callback));
        self
    }

    /// Save checkpoints through `manager`.
    pub fn with_checkpoint_manager(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    /// Add a named evaluation source.
    pub fn with_eval_source(mut self, source: impl ExampleSource<Item = Example> + 'static) -> Self {
        self.eval_sources.push(Box::new(source));
        self
    }

    /// Use an externally owned stop signal.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Override the dataset retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Training configuration.
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Current position.
    pub fn state(&self) -> TrainingState {
        self.state
    }

    /// Handle to the stop signal.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// The example reweighter.
    pub fn reweighter(&self) -> &ExampleReweighter {
        &self.reweighter
    }

    /// Best evaluation loss seen.
    pub fn best_eval_loss(&self) -> Option<f64> {
        self.best_eval_loss
    }

    /// Resume from a checkpoint.
    ///
    /// Reweighting state and position are restored here. Parameters,
    /// optimizer and schedule state are restored when [`Self::run`] starts,
    /// since they need the model and the packed dataset size.
    pub fn resume(&mut self, snapshot: TrainerSnapshot) -> Result<()> {
        self.reweighter.restore(snapshot.reweight.clone())?;
        self.state = snapshot.training;
        self.best_eval_loss = snapshot.metadata.best_eval_loss;
        self.running_loss = Some(snapshot.metadata.running_loss);
        info!(
            step = self.state.step,
            epoch = self.state.epoch,
            "Resuming from checkpoint"
        );
        self.pending_resume = Some(snapshot);
        Ok(())
    }

    /// Train `model` on `source` until the terminal step or a stop request.
    ///
    /// # Errors
    ///
    /// Configuration errors surface before the first step. Model errors,
    /// packing errors and exhausted I/O retries end the run.
    pub fn run<M, S>(&mut self, model: &mut M, source: &S) -> Result<TrainOutcome>
    where
        M: TrainableModel,
        S: ExampleSource<Item = Example> + ?Sized,
    {
        let epoch_steps = self.plan_epochs(source)?;
        let total_steps = self
            .config
            .max_train_steps
            .unwrap_or_else(|| epoch_steps.iter().sum());
        let scheduler = SchedulerBuilder::from_config(&self.config, total_steps).build()?;
        let optimizer = LAdamW::new(LAdamWConfig::from_training_config(&self.config), model.parameters())?;
        let mut engine = StepEngine::new(optimizer, scheduler, model.parameters());

        if let Some(snapshot) = self.pending_resume.take() {
            model.parameters_mut().load_from(&snapshot.parameters)?;
            engine.optimizer.restore(snapshot.optimizer)?;
            engine.scheduler.restore(snapshot.schedule)?;
        }
        self.state.phase = engine.scheduler.phase(self.state.step);

        let memory = engine.optimizer.memory_usage();
        info!(
            epochs = epoch_steps.len(),
            steps_per_epoch = epoch_steps[0],
            total_steps,
            warmup_steps = engine.scheduler.warmup_steps(),
            cooldown_steps = engine.scheduler.cooldown_steps(),
            optimizer_state_mb = memory.state_mb(),
            dense_equivalent_mb = memory.dense_equivalent_mb(),
            "Starting training"
        );
        self.callbacks.on_train_start(total_steps);

        let loader = self.loader.clone();
        while self.state.step < total_steps
            && (self.config.max_train_steps.is_some()
                || self.state.epoch < self.config.num_train_epochs)
        {
            let epoch = self.state.epoch;
            if let Some(planned) = epoch_steps.get(epoch) {
                debug!(epoch, planned_steps = *planned, "Starting epoch");
            }
            self.callbacks.on_epoch_start(epoch);

            let mut skip = self.state.micro_batches_in_epoch;
            let mut delivered = 0usize;
            let examples = self.retry.run("dataset open", || source.open(epoch))?;
            loader.for_each_micro_batch_in(examples, |micro_batch| {
                delivered += 1;
                if skip > 0 {
                    skip -= 1;
                    return Ok(ControlFlow::Continue(()));
                }
                self.train_micro_batch(model, &mut engine, micro_batch, total_steps)
            })?;

            if engine.stopped {
                break;
            }
            if engine.pending > 0 {
                self.finish_step(model, &mut engine)?;
            }
            self.end_epoch(model, &mut engine)?;

            if delivered == 0 {
                warn!(epoch, "Epoch produced no micro-batches, ending run");
                break;
            }
        }

        if engine.interval.steps > 0 {
            self.emit_metrics(&mut engine);
        }

        let stopped = engine.stopped;
        if stopped {
            info!(step = self.state.step, "Stop requested, saving final checkpoint");
            self.save_checkpoint(model, &mut engine, CheckpointTag::Step(self.state.step), false)?;
        } else {
            if self.state.step < total_steps {
                warn!(
                    step = self.state.step,
                    total_steps, "Data exhausted before the terminal step"
                );
            }
            self.finish_training(model, &mut engine)?;
        }
        self.callbacks.on_train_end(self.state.step);

        let summary = TrainSummary {
            state: self.state,
            total_steps,
            skipped_steps: self.skipped_steps,
            running_loss: self.running_loss,
            best_eval_loss: self.best_eval_loss,
            elapsed_secs: engine.started.elapsed().as_secs_f64(),
        };
        info!(
            step = summary.state.step,
            skipped_steps = summary.skipped_steps,
            loss = summary.running_loss.unwrap_or(f64::NAN),
            "Training finished"
        );
        Ok(if stopped {
            TrainOutcome::Stopped(summary)
        } else {
            TrainOutcome::Completed(summary)
        })
    }

    /// Mean masked loss over every evaluation source.
    ///
    /// Per-source losses are reported in [`EvalMetrics::custom`] under the
    /// source name; `loss` is their mean.
    pub fn evaluate<M: TrainableModel>(&self, model: &mut M) -> Result<EvalMetrics> {
        if self.eval_sources.is_empty() {
            return Err(SftPackError::InvalidArgument(
                "no evaluation sources configured".to_string(),
            ));
        }

        let mut custom = HashMap::new();
        let mut losses = Vec::with_capacity(self.eval_sources.len());
        for source in &self.eval_sources {
            let examples = self.retry.run("dataset open", || source.open(0))?;
            let (mut sum, mut count) = (0.0f64, 0usize);
            self.loader.for_each_micro_batch_in(examples, |micro_batch| {
                for window in &micro_batch.windows {
                    let token_losses = model.forward_eval(&window.batch)?;
                    if token_losses.len() != window.batch.window_len {
                        return Err(SftPackError::ShapeMismatch {
                            expected: vec![window.batch.window_len],
                            actual: vec![token_losses.len()],
                        });
                    }
                    for (t, &loss) in token_losses.iter().enumerate() {
                        if window.mask.is_supervised(t) {
                            sum += f64::from(loss);
                            count += 1;
                        }
                    }
                }
                Ok(ControlFlow::Continue(()))
            })?;

            if count == 0 {
                warn!(source = source.name(), "Evaluation source has no supervised tokens");
                continue;
            }
            let mean = sum / count as f64;
            debug!(source = source.name(), loss = mean, tokens = count, "Evaluated source");
            custom.insert(source.name().to_string(), mean);
            losses.push(mean);
        }

        if losses.is_empty() {
            return Err(SftPackError::InvalidArgument(
                "evaluation sources produced no supervised tokens".to_string(),
            ));
        }
        let mut metrics = EvalMetrics::from_loss(losses.iter().sum::<f64>() / losses.len() as f64);
        metrics.custom = custom;
        Ok(metrics)
    }

    /// Dry-run the order of every epoch and return its optimizer steps.
    ///
    /// Packing depends on example order, so shuffled epochs can differ in
    /// window count. With `max_train_steps` only the first epoch is sized.
    fn plan_epochs<S>(&self, source: &S) -> Result<Vec<usize>>
    where
        S: ExampleSource<Item = Example> + ?Sized,
    {
        let epochs = if self.config.max_train_steps.is_some() {
            1
        } else {
            self.config.num_train_epochs.max(1)
        };

        let mut epoch_steps = Vec::with_capacity(epochs);
        for epoch in 0..epochs {
            let stats = self
                .retry
                .run("dataset open", || source.open(epoch))
                .and_then(|examples| self.loader.dry_run_examples(examples))?;
            if stats.num_windows == 0 {
                return Err(SftPackError::config(format!(
                    "training source '{}' produced no packed windows",
                    source.name()
                )));
            }
            if epoch == 0 {
                info!("{}", stats.summary());
            }
            debug!(epoch, windows = stats.num_windows, "Sized epoch");
            epoch_steps.push(self.config.steps_per_epoch(stats.num_windows));
        }
        Ok(epoch_steps)
    }

    /// Last evaluation and final checkpoint of a completed run.
    fn finish_training<M: TrainableModel>(&mut self, model: &mut M, engine: &mut StepEngine) -> Result<()> {
        let step = self.state.step;
        let mut is_best = false;
        if !self.eval_sources.is_empty() && engine.last_eval_step != Some(step) {
            is_best = self.run_evaluation(model, engine)?;
        }
        if is_best || engine.last_step_checkpoint != Some(step) {
            self.save_checkpoint(model, engine, CheckpointTag::Step(step), is_best)?;
        }
        Ok(())
    }

    /// Evaluate, report and track the best loss. Returns whether it improved.
    fn run_evaluation<M: TrainableModel>(&mut self, model: &mut M, engine: &mut StepEngine) -> Result<bool> {
        let step = self.state.step;
        let metrics = self.evaluate(model)?;
        info!(step, eval_loss = metrics.loss, perplexity = metrics.perplexity, "Evaluation");
        engine.last_eval_step = Some(step);
        let improved = self.best_eval_loss.map_or(true, |best| metrics.loss < best);
        if improved {
            self.best_eval_loss = Some(metrics.loss);
        }
        self.callbacks.on_evaluate(step, &metrics);
        Ok(improved)
    }

    fn train_micro_batch<M: TrainableModel>(
        &mut self,
        model: &mut M,
        engine: &mut StepEngine,
        micro_batch: MicroBatch,
        total_steps: usize,
    ) -> Result<ControlFlow<()>> {
        if engine.pending == 0 && self.stop.is_stop_requested() {
            engine.stopped = true;
            return Ok(ControlFlow::Break(()));
        }

        let windows = &micro_batch.windows;
        let token_losses = windows
            .iter()
            .map(|window| model.forward(&window.batch))
            .collect::<Result<Vec<_>>>()?;

        let segments = segment_signals(windows, &token_losses);
        let signals: Vec<ExampleSignal> = segments.iter().map(|s| s.signal).collect();
        let weights = self.reweighter.weigh(&signals);
        let reduced = self
            .reducer
            .reduce(windows, &token_losses, &segments, &weights.gradient_scales())?;
        self.reweighter.observe(&signals);

        for (window, token_weights) in windows.iter().zip(&reduced.token_weights) {
            let grads = model.backward(&window.batch, token_weights)?;
            engine.accumulate(&grads)?;
        }
        engine.pending += 1;
        self.state.micro_batches_in_epoch += 1;

        if reduced.loss.is_finite() {
            engine.step_loss.0 += reduced.loss;
            engine.step_loss.1 += 1;
            engine.interval.loss_sum += reduced.loss;
            engine.interval.loss_count += 1;
        }
        engine.interval.supervised_tokens += reduced.supervised_tokens;
        engine.interval.window_tokens += reduced.window_tokens;
        engine.interval.reweight = weights.summary();
        if reduced.quantiles.is_some() {
            engine.interval.quantiles = reduced.quantiles;
        }

        if engine.pending == self.config.gradient_accumulation_steps {
            self.finish_step(model, engine)?;
            if self.state.step >= total_steps {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Apply the accumulated gradients and run the per-step cadences.
    fn finish_step<M: TrainableModel>(&mut self, model: &mut M, engine: &mut StepEngine) -> Result<()> {
        let lr = engine.scheduler.current_lr();
        let phase = engine.scheduler.phase(engine.scheduler.current_step());
        engine.optimizer.set_learning_rate(lr);

        let inv = 1.0 / engine.pending as f32;
        for grad in &mut engine.accumulated {
            grad.mapv_inplace(|g| g * inv);
        }
        let outcome = engine
            .optimizer
            .step(model.parameters_mut().tensors_mut(), &engine.accumulated)?;
        for grad in &mut engine.accumulated {
            grad.fill(0.0);
        }
        engine.pending = 0;

        engine.scheduler.step();
        self.reweighter.advance();
        self.state.step += 1;
        self.state.phase = engine.scheduler.phase(self.state.step);
        let step = self.state.step;

        match outcome {
            StepOutcome::Applied { grad_norm, clipped } => {
                debug!(step, lr, grad_norm, clipped, "Optimizer step applied");
                engine.interval.grad_norm = Some(grad_norm);
            }
            StepOutcome::Skipped { reason } => {
                self.skipped_steps += 1;
                debug!(step, reason = %reason, "Optimizer step skipped");
            }
        }

        let (loss_sum, loss_count) = std::mem::take(&mut engine.step_loss);
        if loss_count > 0 {
            let step_loss = loss_sum / loss_count as f64;
            self.running_loss = Some(match self.running_loss {
                Some(running) => 0.99 * running + 0.01 * step_loss,
                None => step_loss,
            });
        }
        engine.interval.learning_rate = lr;
        engine.interval.phase = phase;
        engine.interval.steps += 1;

        if step % self.config.logging_steps.max(1) == 0 {
            self.emit_metrics(engine);
        }

        let mut is_best = false;
        if let Some(every) = self.config.eval_per_steps {
            if step % every == 0 && !self.eval_sources.is_empty() {
                is_best = self.run_evaluation(model, engine)?;
            }
        }

        let cadence_due = matches!(
            self.config.checkpointing_steps,
            Some(CheckpointCadence::Steps(every)) if step % every == 0
        );
        if cadence_due || is_best {
            self.save_checkpoint(model, engine, CheckpointTag::Step(step), is_best)?;
        }
        Ok(())
    }

    fn end_epoch<M: TrainableModel>(&mut self, model: &M, engine: &mut StepEngine) -> Result<()> {
        let epoch = self.state.epoch;
        info!(epoch, step = self.state.step, "Epoch complete");
        self.callbacks.on_epoch_end(epoch);

        self.state.epoch += 1;
        self.state.micro_batches_in_epoch = 0;
        if matches!(self.config.checkpointing_steps, Some(CheckpointCadence::Epoch(_))) {
            self.save_checkpoint(model, engine, CheckpointTag::Epoch(epoch), false)?;
        }
        Ok(())
    }

    fn emit_metrics(&mut self, engine: &mut StepEngine) {
        let interval = std::mem::take(&mut engine.interval);
        let effective_tokens_pct = if interval.window_tokens > 0 {
            100.0 * interval.supervised_tokens as f64 / interval.window_tokens as f64
        } else {
            0.0
        };
        let loss = if interval.loss_count > 0 {
            interval.loss_sum / interval.loss_count as f64
        } else {
            f64::NAN
        };
        let metrics = StepMetrics {
            step: self.state.step,
            epoch: self.state.epoch,
            phase: interval.phase,
            loss,
            learning_rate: interval.learning_rate,
            grad_norm: interval.grad_norm,
            effective_tokens_pct,
            reweight: interval.reweight,
            loss_quantiles: interval.quantiles,
            skipped_steps: self.skipped_steps,
            elapsed_secs: engine.started.elapsed().as_secs_f64(),
        };
        self.callbacks.on_step_end(&metrics);
    }

    fn snapshot<M: TrainableModel>(&self, model: &M, engine: &StepEngine) -> TrainerSnapshot {
        let metadata = CheckpointMetadata::new(
            self.state.step,
            self.state.epoch,
            self.running_loss.filter(|l| l.is_finite()).unwrap_or(0.0),
            engine.optimizer.learning_rate(),
        )
        .with_best_eval_loss(self.best_eval_loss)
        .with_training_config(&self.config)
        .with_seed(self.config.seed);

        TrainerSnapshot {
            metadata,
            training: self.state,
            parameters: model.parameters().clone(),
            optimizer: engine.optimizer.state_snapshot(),
            schedule: engine.scheduler.state(),
            reweight: self.reweighter.state().clone(),
        }
    }

    fn save_checkpoint<M: TrainableModel>(
        &mut self,
        model: &M,
        engine: &mut StepEngine,
        tag: CheckpointTag,
        is_best: bool,
    ) -> Result<()> {
        let Some(manager) = &self.checkpoints else {
            return Ok(());
        };
        let snapshot = self.snapshot(model, engine);
        let path = manager.save_checkpoint(&snapshot, tag, is_best)?;
        if let CheckpointTag::Step(step) = tag {
            engine.last_step_checkpoint = Some(step);
        }
        self.callbacks.on_save(&path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladamw::LAdamWBuilder;

    #[test]
    fn test_stop_signal_is_shared() {
        let signal = StopSignal::new();
        let handle = signal.clone();
        assert!(!signal.is_stop_requested());
        handle.request_stop();
        assert!(signal.is_stop_requested());
    }

    #[test]
    fn test_accumulate_rejects_foreign_gradients() {
        let params = ParameterSet::new()
            .with("w", Array2::zeros((2, 3)))
            .unwrap();
        let optimizer = LAdamWBuilder::new(1e-3).build(&params).unwrap();
        let scheduler = SchedulerBuilder::new().total_steps(10).build().unwrap();
        let mut engine = StepEngine::new(optimizer, scheduler, &params);

        engine.accumulate(&[Array2::ones((2, 3))]).unwrap();
        engine.accumulate(&[Array2::ones((2, 3))]).unwrap();
        assert_eq!(engine.accumulated[0][[1, 2]], 2.0);

        assert!(matches!(
            engine.accumulate(&[Array2::ones((3, 2))]),
            Err(SftPackError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            engine.accumulate(&[]),
            Err(SftPackError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = TrainingConfig {
            warmup_ratio: 0.8,
            cooldown_ratio: 0.5,
            ..Default::default()
        };
        assert!(matches!(TrainingLoop::new(config), Err(SftPackError::Config(_))));
    }
}
