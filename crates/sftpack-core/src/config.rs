//! Configuration types for sftpack.
//!
//! The launcher hands the core a flat mapping of hyperparameters. Every
//! field has a serde default so partial YAML files deserialize, and
//! [`TrainingConfig::validate`] is the single gate that rejects bad values
//! before any step runs.

use serde::{Deserialize, Serialize};

use crate::{
    EmptyExamplePolicy, LongExamplePolicy, LossMaskingStrategy, ReduceLoss, Result, SftPackError,
};

/// Upper bound accepted for `ladamw_rank`.
pub const MAX_LADAMW_RANK: usize = 4096;

/// Training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Packed windows per micro-batch on one replica.
    #[serde(default = "default_batch_size")]
    pub per_device_train_batch_size: usize,

    /// Micro-batches accumulated per optimizer step.
    #[serde(default = "default_one")]
    pub gradient_accumulation_steps: usize,

    /// Peak learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Learning rate scheduler type.
    #[serde(default)]
    pub lr_scheduler_type: LrSchedulerType,

    /// Fraction of total steps spent in linear warmup.
    #[serde(default = "default_warmup_ratio")]
    pub warmup_ratio: f64,

    /// Fraction of total steps spent in the final linear decay (wsd only).
    #[serde(default = "default_cooldown_ratio")]
    pub cooldown_ratio: f64,

    /// Number of passes over the training data.
    #[serde(default = "default_epochs")]
    pub num_train_epochs: usize,

    /// Maximum optimizer steps (overrides epochs if set).
    #[serde(default)]
    pub max_train_steps: Option<usize>,

    /// Length of every packed training window.
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,

    /// Decoupled weight decay.
    #[serde(default)]
    pub weight_decay: f64,

    /// Global gradient norm ceiling (0 disables clipping).
    #[serde(default = "default_grad_clip")]
    pub clip_grad_norm: f64,

    /// Optimizer type.
    #[serde(default)]
    pub optimizer: OptimizerType,

    /// Rank of the compressed second-moment estimate.
    #[serde(default = "default_ladamw_rank")]
    pub ladamw_rank: usize,

    /// Decay used when re-fitting the second-moment projection basis.
    #[serde(default = "default_beta0")]
    pub beta0: f64,

    /// First-moment decay.
    #[serde(default = "default_beta1")]
    pub beta1: f64,

    /// Second-moment decay.
    #[serde(default = "default_beta2")]
    pub beta2: f64,

    /// Denominator epsilon.
    #[serde(default = "default_eps")]
    pub adam_epsilon: f64,

    /// Steps between re-projections of the second-moment basis.
    #[serde(default = "default_reproject_interval")]
    pub reproject_interval: usize,

    /// Use the unfused reference optimizer path.
    #[serde(default)]
    pub no_fused: bool,

    /// Exclude non-assistant turns from the loss.
    #[serde(default = "default_true")]
    pub mask_users: bool,

    /// Also exclude the first token of every packed segment after the first.
    #[serde(default)]
    pub mask_segment_starts: bool,

    /// Pack several examples per window.
    #[serde(default = "default_true")]
    pub use_multipack: bool,

    /// Windows kept open simultaneously by the best-fit packer.
    #[serde(default = "default_open_windows")]
    pub max_open_windows: usize,

    /// Token appended after every packed segment, if any.
    #[serde(default)]
    pub separator_token: Option<u32>,

    /// Token written into padding positions.
    #[serde(default)]
    pub pad_token_id: u32,

    /// What to do with examples longer than a window.
    #[serde(default)]
    pub long_example_policy: LongExamplePolicy,

    /// What to do with examples that carry no tokens.
    #[serde(default)]
    pub empty_example_policy: EmptyExamplePolicy,

    /// How supervised token losses are reduced.
    #[serde(default)]
    pub reduce_loss: ReduceLoss,

    /// Token-level loss selection strategy.
    #[serde(default)]
    pub loss_masking: LossMaskingStrategy,

    /// Example reweighting policy.
    #[serde(default)]
    pub reweighting: ReweightingType,

    /// Steps over which weights move from uniform to the policy.
    #[serde(default)]
    pub reweight_warmup_steps: usize,

    /// Behaviour once the reweighting warmup is exhausted.
    #[serde(default)]
    pub reweight_after_warmup: ReweightAfterWarmup,

    /// Per-step decay toward uniform weights (`decay` mode only).
    #[serde(default = "default_reweight_decay")]
    pub reweight_decay: f64,

    /// Temperature of the loss-based policies.
    #[serde(default = "default_one_f64")]
    pub reweight_temperature: f64,

    /// EMA decay of the running mean loss used by the policies.
    #[serde(default = "default_reweight_ema")]
    pub reweight_ema_decay: f64,

    /// Upper bound on a single example weight.
    #[serde(default = "default_weight_cap")]
    pub weight_cap: f64,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Shuffle examples at the start of every epoch.
    #[serde(default = "default_true")]
    pub shuffle: bool,

    /// Emit step metrics every N optimizer steps.
    #[serde(default = "default_logging_steps")]
    pub logging_steps: usize,

    /// Evaluate every N optimizer steps.
    #[serde(default)]
    pub eval_per_steps: Option<usize>,

    /// Checkpoint cadence.
    #[serde(default)]
    pub checkpointing_steps: Option<CheckpointCadence>,

    /// Checkpoints kept on disk (None keeps all).
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: Option<usize>,

    /// Output directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Windows packed ahead of the training step.
    #[serde(default = "default_prefetch_depth")]
    pub prefetch_depth: usize,

    /// Attempts for dataset opens and checkpoint writes.
    #[serde(default = "default_io_retries")]
    pub io_retries: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            per_device_train_batch_size: default_batch_size(),
            gradient_accumulation_steps: default_one(),
            learning_rate: default_lr(),
            lr_scheduler_type: LrSchedulerType::default(),
            warmup_ratio: default_warmup_ratio(),
            cooldown_ratio: default_cooldown_ratio(),
            num_train_epochs: default_epochs(),
            max_train_steps: None,
            max_seq_length: default_max_seq_length(),
            weight_decay: 0.0,
            clip_grad_norm: default_grad_clip(),
            optimizer: OptimizerType::default(),
            ladamw_rank: default_ladamw_rank(),
            beta0: default_beta0(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            adam_epsilon: default_eps(),
            reproject_interval: default_reproject_interval(),
            no_fused: false,
            mask_users: true,
            mask_segment_starts: false,
            use_multipack: true,
            max_open_windows: default_open_windows(),
            separator_token: None,
            pad_token_id: 0,
            long_example_policy: LongExamplePolicy::default(),
            empty_example_policy: EmptyExamplePolicy::default(),
            reduce_loss: ReduceLoss::default(),
            loss_masking: LossMaskingStrategy::default(),
            reweighting: ReweightingType::default(),
            reweight_warmup_steps: 0,
            reweight_after_warmup: ReweightAfterWarmup::default(),
            reweight_decay: default_reweight_decay(),
            reweight_temperature: default_one_f64(),
            reweight_ema_decay: default_reweight_ema(),
            weight_cap: default_weight_cap(),
            seed: default_seed(),
            shuffle: true,
            logging_steps: default_logging_steps(),
            eval_per_steps: None,
            checkpointing_steps: None,
            max_checkpoints: default_max_checkpoints(),
            output_dir: default_output_dir(),
            prefetch_depth: default_prefetch_depth(),
            io_retries: default_io_retries(),
        }
    }
}

impl TrainingConfig {
    /// Check every range constraint.
    ///
    /// # Errors
    ///
    /// Returns [`SftPackError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        check_unit_interval("warmup_ratio", self.warmup_ratio)?;
        check_unit_interval("cooldown_ratio", self.cooldown_ratio)?;
        if self.warmup_ratio + self.cooldown_ratio > 1.0 {
            return Err(SftPackError::config(format!(
                "warmup_ratio ({}) + cooldown_ratio ({}) must not exceed 1",
                self.warmup_ratio, self.cooldown_ratio
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate >= 0.0) {
            return Err(SftPackError::config(format!(
                "learning_rate must be a finite non-negative number, got {}",
                self.learning_rate
            )));
        }
        check_positive("per_device_train_batch_size", self.per_device_train_batch_size)?;
        check_positive("gradient_accumulation_steps", self.gradient_accumulation_steps)?;
        check_positive("max_seq_length", self.max_seq_length)?;
        check_positive("logging_steps", self.logging_steps)?;
        check_positive("max_open_windows", self.max_open_windows)?;
        check_positive("reproject_interval", self.reproject_interval)?;
        check_positive("io_retries", self.io_retries)?;
        if self.max_train_steps.is_none() {
            check_positive("num_train_epochs", self.num_train_epochs)?;
        }
        if self.ladamw_rank == 0 || self.ladamw_rank > MAX_LADAMW_RANK {
            return Err(SftPackError::config(format!(
                "ladamw_rank must be in 1..={MAX_LADAMW_RANK}, got {}",
                self.ladamw_rank
            )));
        }
        for (name, beta) in [
            ("beta0", self.beta0),
            ("beta1", self.beta1),
            ("beta2", self.beta2),
        ] {
            if !(0.0..1.0).contains(&beta) {
                return Err(SftPackError::config(format!(
                    "{name} must be in [0, 1), got {beta}"
                )));
            }
        }
        if !(self.adam_epsilon > 0.0) {
            return Err(SftPackError::config("adam_epsilon must be > 0"));
        }
        if !(self.weight_decay >= 0.0) {
            return Err(SftPackError::config("weight_decay must be >= 0"));
        }
        if !(self.clip_grad_norm >= 0.0) {
            return Err(SftPackError::config("clip_grad_norm must be >= 0"));
        }
        if !(self.weight_cap > 0.0) {
            return Err(SftPackError::config("weight_cap must be > 0"));
        }
        if !(self.reweight_temperature > 0.0) {
            return Err(SftPackError::config("reweight_temperature must be > 0"));
        }
        if !(self.reweight_decay > 0.0 && self.reweight_decay <= 1.0) {
            return Err(SftPackError::config("reweight_decay must be in (0, 1]"));
        }
        check_unit_interval("reweight_ema_decay", self.reweight_ema_decay)?;
        if let Some(sep) = self.separator_token {
            if self.max_seq_length < 2 {
                return Err(SftPackError::config(format!(
                    "separator_token {sep} needs max_seq_length >= 2"
                )));
            }
        }
        if self.loss_masking != LossMaskingStrategy::Default && self.reduce_loss != ReduceLoss::Sum
        {
            return Err(SftPackError::config(format!(
                "loss_masking = {:?} requires reduce_loss = sum",
                self.loss_masking
            )));
        }
        if let Some(CheckpointCadence::Steps(0)) = self.checkpointing_steps {
            return Err(SftPackError::config("checkpointing_steps must be > 0"));
        }
        if let Some(0) = self.eval_per_steps {
            return Err(SftPackError::config("eval_per_steps must be > 0"));
        }
        Ok(())
    }

    /// Windows consumed by one optimizer step.
    #[must_use]
    pub fn windows_per_step(&self) -> usize {
        self.per_device_train_batch_size * self.gradient_accumulation_steps
    }

    /// Optimizer steps in one epoch over `num_windows` packed windows.
    #[must_use]
    pub fn steps_per_epoch(&self, num_windows: usize) -> usize {
        num_windows.div_ceil(self.windows_per_step().max(1))
    }

    /// Total optimizer steps of the run.
    #[must_use]
    pub fn total_steps(&self, steps_per_epoch: usize) -> usize {
        self.max_train_steps
            .unwrap_or(self.num_train_epochs * steps_per_epoch)
    }
}

fn check_unit_interval(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SftPackError::config(format!(
            "{name} must be in [0, 1], got {value}"
        )))
    }
}

fn check_positive(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        Err(SftPackError::config(format!("{name} must be > 0")))
    } else {
        Ok(())
    }
}

/// Learning rate scheduler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerType {
    /// Constant learning rate (no warmup).
    Constant,
    /// Linear warmup then constant.
    ConstantWithWarmup,
    /// Linear decay.
    Linear,
    /// Cosine annealing.
    Cosine,
    /// Cosine with restarts.
    CosineWithRestarts,
    /// Polynomial decay.
    Polynomial,
    /// Warmup, stable plateau, linear cooldown.
    #[default]
    Wsd,
}

/// Optimizer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    /// AdamW with a dense second moment.
    #[serde(rename = "adamw")]
    AdamW,
    /// AdamW with a rank-compressed second moment.
    #[default]
    #[serde(rename = "ladamw")]
    LAdamW,
}

/// Example reweighting policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReweightingType {
    /// Every example weighs 1.
    #[default]
    None,
    /// Weight grows with the example loss relative to the running mean.
    Loss,
    /// Weight shrinks with the example loss relative to the running mean.
    InverseLoss,
}

/// What the reweighter does once its warmup is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReweightAfterWarmup {
    /// Freeze policy statistics; weights become a stationary function of the signal.
    #[default]
    Freeze,
    /// Decay geometrically back to uniform weights.
    Decay,
}

/// Checkpoint cadence: every N optimizer steps or at every epoch end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckpointCadence {
    /// Every N optimizer steps.
    Steps(usize),
    /// At the end of every epoch.
    Epoch(EpochKeyword),
}

impl CheckpointCadence {
    /// Cadence that saves at every epoch end.
    pub const EVERY_EPOCH: Self = Self::Epoch(EpochKeyword::Epoch);
}

/// The literal `epoch` accepted by [`CheckpointCadence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpochKeyword {
    /// `epoch`
    Epoch,
}

// Default value functions
fn default_batch_size() -> usize {
    4
}
fn default_one() -> usize {
    1
}
fn default_one_f64() -> f64 {
    1.0
}
fn default_lr() -> f64 {
    2e-5
}
fn default_warmup_ratio() -> f64 {
    0.03
}
fn default_cooldown_ratio() -> f64 {
    0.1
}
fn default_epochs() -> usize {
    2
}
fn default_max_seq_length() -> usize {
    2048
}
fn default_grad_clip() -> f64 {
    1.0
}
fn default_ladamw_rank() -> usize {
    256
}
fn default_beta0() -> f64 {
    0.9
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}
fn default_eps() -> f64 {
    1e-8
}
fn default_reproject_interval() -> usize {
    200
}
fn default_true() -> bool {
    true
}
fn default_open_windows() -> usize {
    4
}
fn default_reweight_decay() -> f64 {
    0.99
}
fn default_reweight_ema() -> f64 {
    0.9
}
fn default_weight_cap() -> f64 {
    5.0
}
fn default_seed() -> u64 {
    42
}
fn default_logging_steps() -> usize {
    10
}
fn default_max_checkpoints() -> Option<usize> {
    Some(5)
}
fn default_output_dir() -> String {
    "./output".into()
}
fn default_prefetch_depth() -> usize {
    2
}
fn default_io_retries() -> usize {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        TrainingConfig::default().validate().unwrap();
    }

    #[test]
    fn test_ratio_sum_rejected() {
        let config = TrainingConfig {
            warmup_ratio: 0.6,
            cooldown_ratio: 0.5,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SftPackError::Config(_)));
        assert!(err.to_string().contains("cooldown_ratio"));
    }

    #[test]
    fn test_rank_bounds() {
        let zero = TrainingConfig {
            ladamw_rank: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let huge = TrainingConfig {
            ladamw_rank: MAX_LADAMW_RANK + 1,
            ..Default::default()
        };
        assert!(huge.validate().is_err());
    }

    #[test]
    fn test_quantile_masking_requires_sum() {
        let config = TrainingConfig {
            loss_masking: LossMaskingStrategy::BelowMedian,
            reduce_loss: ReduceLoss::Mean,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TrainingConfig {
            reduce_loss: ReduceLoss::Sum,
            ..config
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_step_arithmetic() {
        let config = TrainingConfig {
            per_device_train_batch_size: 2,
            gradient_accumulation_steps: 3,
            num_train_epochs: 2,
            ..Default::default()
        };
        assert_eq!(config.windows_per_step(), 6);
        assert_eq!(config.steps_per_epoch(13), 3);
        assert_eq!(config.total_steps(3), 6);

        let capped = TrainingConfig {
            max_train_steps: Some(4),
            ..config
        };
        assert_eq!(capped.total_steps(3), 4);
    }

    #[test]
    fn test_yaml_flat_mapping() {
        let yaml = r#"
learning_rate: 5.0e-5
warmup_ratio: 0.1
cooldown_ratio: 0.2
lr_scheduler_type: wsd
optimizer: ladamw
ladamw_rank: 128
reweighting: loss
reweight_warmup_steps: 50
mask_users: false
checkpointing_steps: epoch
"#;
        let config: TrainingConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.ladamw_rank, 128);
        assert_eq!(config.reweighting, ReweightingType::Loss);
        assert!(!config.mask_users);
        assert_eq!(
            config.checkpointing_steps,
            Some(CheckpointCadence::EVERY_EPOCH)
        );
        config.validate().unwrap();

        let stepped: TrainingConfig = serde_yaml::from_str("checkpointing_steps: 500").unwrap();
        assert_eq!(
            stepped.checkpointing_steps,
            Some(CheckpointCadence::Steps(500))
        );
    }
}
