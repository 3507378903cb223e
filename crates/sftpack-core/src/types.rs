//! Common type definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::SchedulePhase;

/// How supervised token losses are reduced to a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReduceLoss {
    /// Mean over supervised tokens.
    #[default]
    Mean,
    /// Sum over supervised tokens divided by `batch_size * max_seq_length`.
    Sum,
}

/// Token-level loss selection applied on top of the structural mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LossMaskingStrategy {
    /// Every supervised token contributes.
    #[default]
    Default,
    /// Only tokens with loss above the batch median contribute.
    BelowMedian,
    /// As `BelowMedian`, with surviving losses scaled by 2.
    BelowMedianMultiple,
    /// Only tokens above the 75% quantile contribute, scaled by 4.
    BelowQuantileMultiple,
}

impl LossMaskingStrategy {
    /// Quantile threshold and scale factor, or `None` for the default strategy.
    #[must_use]
    pub const fn threshold(&self) -> Option<(f64, f64)> {
        match self {
            Self::Default => None,
            Self::BelowMedian => Some((0.5, 1.0)),
            Self::BelowMedianMultiple => Some((0.5, 2.0)),
            Self::BelowQuantileMultiple => Some((0.75, 4.0)),
        }
    }
}

/// Handling of examples longer than a packing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LongExamplePolicy {
    /// Keep the leading tokens that fit and flag the segment.
    #[default]
    Truncate,
    /// Skip the example.
    Drop,
}

/// Handling of examples that carry no tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmptyExamplePolicy {
    /// Yield a packing error.
    #[default]
    Fail,
    /// Log and continue.
    Skip,
}

/// Result of a single optimizer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// Parameters were updated.
    Applied {
        /// Global gradient norm before clipping.
        grad_norm: f64,
        /// Whether the gradients were scaled down.
        clipped: bool,
    },
    /// The update was skipped and state left untouched.
    Skipped {
        /// Why the step was skipped.
        reason: String,
    },
}

impl StepOutcome {
    /// Whether the step was skipped.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    /// Pre-clip gradient norm for applied steps.
    #[must_use]
    pub fn grad_norm(&self) -> Option<f64> {
        match self {
            Self::Applied { grad_norm, .. } => Some(*grad_norm),
            Self::Skipped { .. } => None,
        }
    }
}

/// Summary of the example weights used in one step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ReweightSummary {
    /// Mean weight.
    pub mean_weight: f64,
    /// Smallest weight.
    pub min_weight: f64,
    /// Largest weight.
    pub max_weight: f64,
    /// Blend factor between uniform and policy weights.
    pub alpha: f64,
}

/// Token loss quantiles (10/25/50/75/90 %).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct LossQuantiles {
    /// 10% quantile.
    pub q10: f64,
    /// 25% quantile.
    pub q25: f64,
    /// Median.
    pub q50: f64,
    /// 75% quantile.
    pub q75: f64,
    /// 90% quantile.
    pub q90: f64,
}

/// Scalar metrics emitted at the logging cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StepMetrics {
    /// Optimizer step (1-based, after the update).
    pub step: usize,
    /// Epoch the step belongs to.
    pub epoch: usize,
    /// Schedule phase at this step.
    pub phase: SchedulePhase,
    /// Mean training loss over the logging interval.
    pub loss: f64,
    /// Learning rate used for the update.
    pub learning_rate: f64,
    /// Pre-clip global gradient norm of the last applied step.
    pub grad_norm: Option<f64>,
    /// Supervised tokens over window tokens, in percent.
    pub effective_tokens_pct: f64,
    /// Example weight statistics.
    pub reweight: ReweightSummary,
    /// Loss quantiles, when a quantile masking strategy is active.
    pub loss_quantiles: Option<LossQuantiles>,
    /// Steps skipped so far because of non-finite gradients.
    pub skipped_steps: usize,
    /// Wall-clock seconds since training started.
    pub elapsed_secs: f64,
}

/// Evaluation metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalMetrics {
    /// Loss value.
    pub loss: f64,
    /// Perplexity.
    pub perplexity: f64,
    /// Custom metrics (per-source losses).
    pub custom: HashMap<String, f64>,
}

impl EvalMetrics {
    /// Metrics from a mean loss.
    #[must_use]
    pub fn from_loss(loss: f64) -> Self {
        Self {
            loss,
            perplexity: loss.exp(),
            custom: HashMap::new(),
        }
    }
}
