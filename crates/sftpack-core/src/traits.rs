//! Core trait definitions.

use crate::{EvalMetrics, Result, StepMetrics, StepOutcome};
use std::path::Path;

/// Restartable source of training records.
///
/// Every call to [`ExampleSource::open`] starts a fresh pass; resources held
/// by a pass are released when the returned iterator is dropped.
pub trait ExampleSource: Send + Sync {
    /// The record type yielded by this source.
    type Item;

    /// Human-readable name used in logs and eval metrics.
    fn name(&self) -> &str;

    /// Start a pass over the records of `epoch`.
    fn open(&self, epoch: usize) -> Result<Box<dyn Iterator<Item = Result<Self::Item>> + Send + '_>>;

    /// Number of records, if known without a pass.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// Optimizer trait.
pub trait Optimizer {
    /// The tensor type used by this optimizer.
    type Tensor;

    /// Update parameters using gradients.
    ///
    /// Non-finite gradients skip the update and report
    /// [`StepOutcome::Skipped`] instead of failing.
    fn step(&mut self, params: &mut [Self::Tensor], grads: &[Self::Tensor]) -> Result<StepOutcome>;

    /// Get current learning rate.
    fn learning_rate(&self) -> f64;

    /// Set learning rate.
    fn set_learning_rate(&mut self, lr: f64);

    /// Number of updates applied so far.
    fn step_count(&self) -> usize;
}

/// Callback trait for training events.
pub trait TrainingCallback: Send {
    /// Called at the start of training.
    fn on_train_start(&mut self, _total_steps: usize) {}

    /// Called at the end of training.
    fn on_train_end(&mut self, _step: usize) {}

    /// Called at the start of each epoch.
    fn on_epoch_start(&mut self, _epoch: usize) {}

    /// Called at the end of each epoch.
    fn on_epoch_end(&mut self, _epoch: usize) {}

    /// Called at the logging cadence.
    fn on_step_end(&mut self, _metrics: &StepMetrics) {}

    /// Called after each evaluation.
    fn on_evaluate(&mut self, _step: usize, _metrics: &EvalMetrics) {}

    /// Called when a checkpoint is saved.
    fn on_save(&mut self, _path: &Path) {}
}
