//! Online per-example loss reweighting.
//!
//! A [`ReweightPolicy`] maps an example's loss signal to a raw weight. The
//! [`ExampleReweighter`] blends that weight with a uniform prior:
//!
//! ```text
//! w = clamp((1 - alpha) * 1 + alpha * policy_weight, 0, weight_cap)
//! ```
//!
//! During warmup `alpha` ramps linearly from 0 to 1. Afterwards the
//! reweighter either freezes its statistics (`alpha = 1`, stationary
//! weights) or decays `alpha` geometrically back towards uniform weights.
//!
//! Batch weights are combined as a convex combination, and the per-example
//! gradient scales are normalised to mean 1 so gradient magnitudes stay
//! comparable to the unweighted loss.

use std::fmt;

use serde::{Deserialize, Serialize};
use sftpack_core::{
    ReweightAfterWarmup, ReweightSummary, ReweightingType, SftPackError, Result, TrainingConfig,
};
use tracing::info;

/// Loss signal of one example in the current micro-batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExampleSignal {
    /// Example the signal belongs to.
    pub example_id: u64,
    /// Mean loss over the example's supervised tokens.
    pub loss: f64,
    /// Supervised tokens the mean was taken over.
    pub num_tokens: usize,
}

/// Running statistics handed to policies.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReweightStats {
    /// Reference loss, or `None` before any observation.
    pub mean_loss: Option<f64>,
    /// Examples observed so far.
    pub observations: usize,
}

/// Strategy mapping an example signal to a raw weight.
pub trait ReweightPolicy: Send + Sync + fmt::Debug {
    /// Policy name for logs.
    fn name(&self) -> &'static str;

    /// Raw, unblended weight of one example.
    fn compute_weight(&self, signal: &ExampleSignal, stats: &ReweightStats, step: usize) -> f64;
}

/// Every example weighs 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformPolicy;

impl ReweightPolicy for UniformPolicy {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compute_weight(&self, _signal: &ExampleSignal, _stats: &ReweightStats, _step: usize) -> f64 {
        1.0
    }
}

/// `(loss / mean_loss)^(1 / temperature)`: emphasises hard examples.
#[derive(Debug, Clone, Copy)]
pub struct LossProportionalPolicy {
    /// Higher temperatures flatten the weights.
    pub temperature: f64,
}

impl ReweightPolicy for LossProportionalPolicy {
    fn name(&self) -> &'static str {
        "loss"
    }

    fn compute_weight(&self, signal: &ExampleSignal, stats: &ReweightStats, _step: usize) -> f64 {
        match stats.mean_loss {
            Some(mean) if mean > 0.0 => (signal.loss / mean).powf(1.0 / self.temperature),
            _ => 1.0,
        }
    }
}

/// `(mean_loss / loss)^(1 / temperature)`: down-weights outliers.
#[derive(Debug, Clone, Copy)]
pub struct InverseLossPolicy {
    /// Higher temperatures flatten the weights.
    pub temperature: f64,
}

impl ReweightPolicy for InverseLossPolicy {
    fn name(&self) -> &'static str {
        "inverse_loss"
    }

    fn compute_weight(&self, signal: &ExampleSignal, stats: &ReweightStats, _step: usize) -> f64 {
        match stats.mean_loss {
            Some(mean) if mean > 0.0 => (mean / signal.loss).powf(1.0 / self.temperature),
            _ => 1.0,
        }
    }
}

/// Policy selected by a config value.
pub fn policy_for(kind: ReweightingType, temperature: f64) -> Box<dyn ReweightPolicy> {
    match kind {
        ReweightingType::None => Box::new(UniformPolicy),
        ReweightingType::Loss => Box::new(LossProportionalPolicy { temperature }),
        ReweightingType::InverseLoss => Box::new(InverseLossPolicy { temperature }),
    }
}

/// Checkpointable reweighter state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReweightState {
    /// Optimizer steps completed.
    pub step: usize,
    /// Steps over which the policy is blended in.
    pub warmup_steps: usize,
    /// EMA of the per-example loss.
    pub running_mean_loss: Option<f64>,
    /// Examples observed.
    pub observations: usize,
    /// Reference loss captured at the end of warmup (freeze policy).
    pub frozen_mean: Option<f64>,
}

/// Reweighter settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReweighterConfig {
    /// Steps over which the policy is blended in.
    pub warmup_steps: usize,
    /// Behaviour once warmup is exhausted.
    pub after_warmup: ReweightAfterWarmup,
    /// Per-step decay of `alpha` after warmup (decay policy).
    pub decay: f64,
    /// EMA decay of the running mean loss.
    pub ema_decay: f64,
    /// Upper bound on any weight.
    pub weight_cap: f64,
}

impl Default for ReweighterConfig {
    fn default() -> Self {
        Self {
            warmup_steps: 0,
            after_warmup: ReweightAfterWarmup::Freeze,
            decay: 0.99,
            ema_decay: 0.9,
            weight_cap: 5.0,
        }
    }
}

impl ReweighterConfig {
    /// Reweighter settings of a training config.
    pub fn from_training_config(config: &TrainingConfig) -> Self {
        Self {
            warmup_steps: config.reweight_warmup_steps,
            after_warmup: config.reweight_after_warmup,
            decay: config.reweight_decay,
            ema_decay: config.reweight_ema_decay,
            weight_cap: config.weight_cap,
        }
    }
}

/// Weights of one micro-batch, aligned with its signals.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchWeights {
    /// Blended weight per signal.
    pub weights: Vec<f64>,
    /// Blend factor used.
    pub alpha: f64,
}

impl BatchWeights {
    /// `sum(w_i * L_i) / sum(w_i)`, or the plain mean when all weights are 0.
    pub fn combine(&self, losses: &[f64]) -> f64 {
        if losses.is_empty() {
            return 0.0;
        }
        let total: f64 = self.weights.iter().sum();
        if total > 0.0 {
            self.weights.iter().zip(losses).map(|(w, l)| w * l).sum::<f64>() / total
        } else {
            losses.iter().sum::<f64>() / losses.len() as f64
        }
    }

    /// Per-example gradient scales `w_i / mean(w)`; uniform when the weights
    /// sum to 0.
    pub fn gradient_scales(&self) -> Vec<f64> {
        let n = self.weights.len();
        let mean = self.weights.iter().sum::<f64>() / n.max(1) as f64;
        if mean > 0.0 {
            self.weights.iter().map(|w| w / mean).collect()
        } else {
            vec![1.0; n]
        }
    }

    /// Statistics for the metrics sink.
    pub fn summary(&self) -> ReweightSummary {
        if self.weights.is_empty() {
            return ReweightSummary {
                mean_weight: 1.0,
                min_weight: 1.0,
                max_weight: 1.0,
                alpha: self.alpha,
            };
        }
        let n = self.weights.len() as f64;
        ReweightSummary {
            mean_weight: self.weights.iter().sum::<f64>() / n,
            min_weight: self.weights.iter().copied().fold(f64::INFINITY, f64::min),
            max_weight: self.weights.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            alpha: self.alpha,
        }
    }
}

/// Online example reweighter.
#[derive(Debug)]
pub struct ExampleReweighter {
    policy: Box<dyn ReweightPolicy>,
    config: ReweighterConfig,
    state: ReweightState,
}

impl ExampleReweighter {
    /// Create a reweighter around `policy`.
    pub fn new(policy: Box<dyn ReweightPolicy>, config: ReweighterConfig) -> Self {
        Self {
            policy,
            state: ReweightState {
                warmup_steps: config.warmup_steps,
                ..Default::default()
            },
            config,
        }
    }

    /// Reweighter selected and configured by a training config.
    pub fn from_training_config(config: &TrainingConfig) -> Self {
        Self::new(
            policy_for(config.reweighting, config.reweight_temperature),
            ReweighterConfig::from_training_config(config),
        )
    }

    /// Active policy.
    pub fn policy(&self) -> &dyn ReweightPolicy {
        self.policy.as_ref()
    }

    /// Current state.
    pub fn state(&self) -> &ReweightState {
        &self.state
    }

    /// Restore a saved state.
    ///
    /// # Errors
    ///
    /// Returns [`SftPackError::InvalidArgument`] if the saved warmup length
    /// differs from the configured one.
    pub fn restore(&mut self, state: ReweightState) -> Result<()> {
        if state.warmup_steps != self.config.warmup_steps {
            return Err(SftPackError::InvalidArgument(format!(
                "checkpoint reweight warmup {} does not match configured {}",
                state.warmup_steps, self.config.warmup_steps
            )));
        }
        self.state = state;
        Ok(())
    }

    /// Whether the warmup is exhausted.
    pub fn warmup_done(&self) -> bool {
        self.state.step >= self.config.warmup_steps
    }

    /// Blend factor at the current step.
    pub fn alpha(&self) -> f64 {
        let warmup = self.config.warmup_steps;
        let step = self.state.step;
        if step < warmup {
            return step as f64 / warmup as f64;
        }
        match self.config.after_warmup {
            ReweightAfterWarmup::Freeze => 1.0,
            ReweightAfterWarmup::Decay => {
                let exponent = i32::try_from(step - warmup).unwrap_or(i32::MAX);
                self.config.decay.powi(exponent)
            }
        }
    }

    /// Statistics the policy sees at the current step.
    pub fn stats(&self) -> ReweightStats {
        ReweightStats {
            mean_loss: self.state.frozen_mean.or(self.state.running_mean_loss),
            observations: self.state.observations,
        }
    }

    /// Weights for one micro-batch of signals. Does not change state.
    pub fn weigh(&self, signals: &[ExampleSignal]) -> BatchWeights {
        let alpha = self.alpha();
        let stats = self.stats();
        let weights = signals
            .iter()
            .map(|signal| {
                let raw = if alpha > 0.0 {
                    self.policy.compute_weight(signal, &stats, self.state.step)
                } else {
                    1.0
                };
                let raw = if raw.is_finite() { raw } else { 1.0 };
                ((1.0 - alpha) + alpha * raw).clamp(0.0, self.config.weight_cap)
            })
            .collect();
        BatchWeights { weights, alpha }
    }

    /// Fold finite example losses into the running mean.
    ///
    /// A no-op once statistics are frozen.
    pub fn observe(&mut self, signals: &[ExampleSignal]) {
        if self.state.frozen_mean.is_some() {
            return;
        }
        let finite: Vec<f64> = signals
            .iter()
            .filter(|s| s.num_tokens > 0 && s.loss.is_finite())
            .map(|s| s.loss)
            .collect();
        if finite.is_empty() {
            return;
        }
        let batch_mean = finite.iter().sum::<f64>() / finite.len() as f64;
        let ema = self.config.ema_decay;
        self.state.running_mean_loss = Some(match self.state.running_mean_loss {
            Some(running) => ema * running + (1.0 - ema) * batch_mean,
            None => batch_mean,
        });
        self.state.observations += finite.len();
    }

    /// Record a committed optimizer step.
    pub fn advance(&mut self) {
        self.state.step += 1;
        let freeze = self.config.after_warmup == ReweightAfterWarmup::Freeze;
        if freeze && self.warmup_done() && self.state.frozen_mean.is_none() {
            if let Some(mean) = self.state.running_mean_loss {
                self.state.frozen_mean = Some(mean);
                info!(
                    step = self.state.step,
                    policy = self.policy.name(),
                    mean_loss = mean,
                    "Reweighting warmup complete, statistics frozen"
                );
            }
        }
    }
}
