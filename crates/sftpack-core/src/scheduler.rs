//! Learning rate scheduler implementations.
//!
//! [`wsd_rate`] is the pure warmup-stable-decay function. The standard decay
//! family is kept alongside it so a config can switch schedules without
//! touching the training loop. [`LearningRateScheduler`] wraps either with a
//! monotonic step counter that is checkpointed as [`ScheduleState`].

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::debug;

use crate::{LrSchedulerType, Result, SftPackError, TrainingConfig};

/// Phase of the schedule at a given step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePhase {
    /// Linear ramp from 0 to the base rate.
    #[default]
    Warmup,
    /// Constant base rate.
    Stable,
    /// Linear decay to 0.
    Cooldown,
}

impl std::fmt::Display for SchedulePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warmup => write!(f, "warmup"),
            Self::Stable => write!(f, "stable"),
            Self::Cooldown => write!(f, "cooldown"),
        }
    }
}

/// Checkpointable scheduler position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScheduleState {
    /// Optimizer steps taken so far.
    pub step: usize,
    /// Phase at `step`.
    pub phase: SchedulePhase,
}

/// Number of warmup and cooldown steps for a run of `total_steps`.
#[must_use]
pub fn wsd_boundaries(total_steps: usize, warmup_ratio: f64, cooldown_ratio: f64) -> (usize, usize) {
    let warmup = (total_steps as f64 * warmup_ratio).floor() as usize;
    let cooldown = (total_steps as f64 * cooldown_ratio).floor() as usize;
    (warmup.min(total_steps), cooldown.min(total_steps - warmup.min(total_steps)))
}

/// Warmup-stable-decay learning rate.
///
/// Ramps linearly from 0 to `base_lr` over `floor(total * warmup_ratio)`
/// steps, holds `base_lr`, then decays linearly to 0 over the final
/// `floor(total * cooldown_ratio)` steps. Any step at or past `total_steps`
/// yields 0.
#[must_use]
pub fn wsd_rate(
    step: usize,
    total_steps: usize,
    base_lr: f64,
    warmup_ratio: f64,
    cooldown_ratio: f64,
) -> f64 {
    let (warmup, cooldown) = wsd_boundaries(total_steps, warmup_ratio, cooldown_ratio);
    wsd_rate_with_steps(step, total_steps, base_lr, warmup, cooldown)
}

fn wsd_rate_with_steps(
    step: usize,
    total_steps: usize,
    base_lr: f64,
    warmup: usize,
    cooldown: usize,
) -> f64 {
    if step >= total_steps {
        return 0.0;
    }
    if step < warmup {
        return base_lr * step as f64 / warmup as f64;
    }
    let cooldown_start = total_steps - cooldown;
    if cooldown > 0 && step >= cooldown_start {
        return base_lr * (total_steps - step) as f64 / cooldown as f64;
    }
    base_lr
}

/// Learning rate scheduler that computes LR based on training progress.
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    /// Base learning rate.
    base_lr: f64,
    /// Minimum learning rate (for warmup and decay of the standard family).
    min_lr: f64,
    /// Total training steps.
    total_steps: usize,
    /// Warmup steps.
    warmup_steps: usize,
    /// Cooldown steps (wsd only).
    cooldown_steps: usize,
    /// Scheduler type.
    scheduler_type: LrSchedulerType,
    /// Number of restarts for cosine with restarts.
    num_restarts: usize,
    /// Current step.
    current_step: usize,
}

impl LearningRateScheduler {
    /// Create a new learning rate scheduler.
    pub fn new(
        base_lr: f64,
        total_steps: usize,
        warmup_steps: usize,
        scheduler_type: LrSchedulerType,
    ) -> Self {
        Self {
            base_lr,
            min_lr: 0.0,
            total_steps,
            warmup_steps,
            cooldown_steps: 0,
            scheduler_type,
            num_restarts: 1,
            current_step: 0,
        }
    }

    /// Set minimum learning rate.
    pub fn with_min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }

    /// Set number of cooldown steps.
    pub fn with_cooldown_steps(mut self, cooldown_steps: usize) -> Self {
        self.cooldown_steps = cooldown_steps;
        self
    }

    /// Set number of restarts for cosine with restarts.
    pub fn with_num_restarts(mut self, num_restarts: usize) -> Self {
        self.num_restarts = num_restarts;
        self
    }

    /// Get learning rate for a specific step.
    #[must_use]
    pub fn get_lr(&self, step: usize) -> f64 {
        match self.scheduler_type {
            LrSchedulerType::Wsd => {
                return wsd_rate_with_steps(
                    step,
                    self.total_steps,
                    self.base_lr,
                    self.warmup_steps,
                    self.cooldown_steps,
                )
            }
            LrSchedulerType::Constant => return self.base_lr,
            _ => {}
        }

        // Warmup phase
        if step < self.warmup_steps {
            let warmup_factor = step as f64 / self.warmup_steps.max(1) as f64;
            return self.min_lr + (self.base_lr - self.min_lr) * warmup_factor;
        }

        // Post-warmup phase
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps);
        let current_decay_step = step.saturating_sub(self.warmup_steps);

        if decay_steps == 0 {
            return self.base_lr;
        }

        let progress = (current_decay_step as f64 / decay_steps as f64).min(1.0);

        match self.scheduler_type {
            LrSchedulerType::Constant
            | LrSchedulerType::ConstantWithWarmup
            | LrSchedulerType::Wsd => self.base_lr,

            LrSchedulerType::Linear => {
                self.min_lr + (self.base_lr - self.min_lr) * (1.0 - progress)
            }

            LrSchedulerType::Cosine => {
                self.min_lr + (self.base_lr - self.min_lr) * 0.5 * (1.0 + (PI * progress).cos())
            }

            LrSchedulerType::CosineWithRestarts => {
                let cycle_length = decay_steps / self.num_restarts.max(1);
                let cycle_progress = if cycle_length > 0 {
                    (current_decay_step % cycle_length) as f64 / cycle_length as f64
                } else {
                    0.0
                };
                self.min_lr
                    + (self.base_lr - self.min_lr) * 0.5 * (1.0 + (PI * cycle_progress).cos())
            }

            LrSchedulerType::Polynomial => {
                let power = 2.0; // Quadratic decay
                self.min_lr + (self.base_lr - self.min_lr) * (1.0 - progress).powf(power)
            }
        }
    }

    /// Phase of the schedule at `step`.
    ///
    /// Only the wsd schedule has a cooldown; the other schedules report
    /// `Stable` once warmup ends.
    #[must_use]
    pub fn phase(&self, step: usize) -> SchedulePhase {
        if step < self.warmup_steps {
            return SchedulePhase::Warmup;
        }
        let cooldown_start = self.total_steps.saturating_sub(self.cooldown_steps);
        if self.scheduler_type == LrSchedulerType::Wsd
            && self.cooldown_steps > 0
            && step >= cooldown_start
        {
            SchedulePhase::Cooldown
        } else {
            SchedulePhase::Stable
        }
    }

    /// Get learning rate for current step.
    #[must_use]
    pub fn current_lr(&self) -> f64 {
        self.get_lr(self.current_step)
    }

    /// Advance the scheduler by one step.
    pub fn step(&mut self) {
        let before = self.phase(self.current_step);
        self.current_step += 1;
        let after = self.phase(self.current_step);
        if after != before {
            debug!(step = self.current_step, from = %before, to = %after, "Schedule phase change");
        }
    }

    /// Move the step counter forward to `step`.
    ///
    /// # Errors
    ///
    /// Returns [`SftPackError::InvalidArgument`] if `step` is behind the
    /// current position. Use [`Self::restore`] to rewind from a checkpoint.
    pub fn set_step(&mut self, step: usize) -> Result<()> {
        if step < self.current_step {
            return Err(SftPackError::InvalidArgument(format!(
                "scheduler cannot move backwards from step {} to {step}",
                self.current_step
            )));
        }
        self.current_step = step;
        Ok(())
    }

    /// Get the current step.
    #[must_use]
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Total steps of the run.
    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Warmup steps of the run.
    #[must_use]
    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    /// Cooldown steps of the run.
    #[must_use]
    pub fn cooldown_steps(&self) -> usize {
        self.cooldown_steps
    }

    /// Check if training is complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.current_step >= self.total_steps
    }

    /// Snapshot of the current position.
    #[must_use]
    pub fn state(&self) -> ScheduleState {
        ScheduleState {
            step: self.current_step,
            phase: self.phase(self.current_step),
        }
    }

    /// Restore a position saved by [`Self::state`].
    ///
    /// # Errors
    ///
    /// Returns [`SftPackError::InvalidArgument`] if the saved phase does not
    /// match what this schedule reports at the saved step.
    pub fn restore(&mut self, state: ScheduleState) -> Result<()> {
        let expected = self.phase(state.step);
        if expected != state.phase {
            return Err(SftPackError::InvalidArgument(format!(
                "checkpoint phase {} does not match schedule phase {expected} at step {}",
                state.phase, state.step
            )));
        }
        self.current_step = state.step;
        debug!(step = state.step, phase = %state.phase, "Restored schedule state");
        Ok(())
    }
}

/// Builder for `LearningRateScheduler`.
#[derive(Debug, Clone)]
pub struct SchedulerBuilder {
    base_lr: f64,
    min_lr: f64,
    total_steps: usize,
    warmup_steps: usize,
    warmup_ratio: Option<f64>,
    cooldown_ratio: f64,
    scheduler_type: LrSchedulerType,
    num_restarts: usize,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerBuilder {
    /// Create a new scheduler builder.
    pub fn new() -> Self {
        Self {
            base_lr: 2e-5,
            min_lr: 0.0,
            total_steps: 1000,
            warmup_steps: 0,
            warmup_ratio: None,
            cooldown_ratio: 0.0,
            scheduler_type: LrSchedulerType::Wsd,
            num_restarts: 1,
        }
    }

    /// Builder seeded from a training config.
    pub fn from_config(config: &TrainingConfig, total_steps: usize) -> Self {
        Self::new()
            .base_lr(config.learning_rate)
            .total_steps(total_steps)
            .warmup_ratio(config.warmup_ratio)
            .cooldown_ratio(config.cooldown_ratio)
            .scheduler_type(config.lr_scheduler_type)
    }

    /// Set base learning rate.
    pub fn base_lr(mut self, lr: f64) -> Self {
        self.base_lr = lr;
        self
    }

    /// Set minimum learning rate.
    pub fn min_lr(mut self, lr: f64) -> Self {
        self.min_lr = lr;
        self
    }

    /// Set total training steps.
    pub fn total_steps(mut self, steps: usize) -> Self {
        self.total_steps = steps;
        self
    }

    /// Set warmup steps.
    pub fn warmup_steps(mut self, steps: usize) -> Self {
        self.warmup_steps = steps;
        self.warmup_ratio = None;
        self
    }

    /// Set warmup ratio (alternative to warmup_steps).
    pub fn warmup_ratio(mut self, ratio: f64) -> Self {
        self.warmup_ratio = Some(ratio);
        self
    }

    /// Set cooldown ratio (wsd only).
    pub fn cooldown_ratio(mut self, ratio: f64) -> Self {
        self.cooldown_ratio = ratio;
        self
    }

    /// Set scheduler type.
    pub fn scheduler_type(mut self, scheduler: LrSchedulerType) -> Self {
        self.scheduler_type = scheduler;
        self
    }

    /// Set number of restarts for cosine with restarts.
    pub fn num_restarts(mut self, restarts: usize) -> Self {
        self.num_restarts = restarts;
        self
    }

    /// Build the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`SftPackError::Config`] if a ratio is outside `[0, 1]`, the
    /// ratios overlap, or explicit warmup steps exceed the run length.
    pub fn build(self) -> Result<LearningRateScheduler> {
        let warmup_ratio = self.warmup_ratio.unwrap_or(0.0);
        for (name, ratio) in [
            ("warmup_ratio", warmup_ratio),
            ("cooldown_ratio", self.cooldown_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(SftPackError::config(format!(
                    "{name} must be in [0, 1], got {ratio}"
                )));
            }
        }
        if warmup_ratio + self.cooldown_ratio > 1.0 {
            return Err(SftPackError::config(format!(
                "warmup_ratio ({warmup_ratio}) + cooldown_ratio ({}) must not exceed 1",
                self.cooldown_ratio
            )));
        }

        let (warmup_steps, cooldown_steps) = if self.warmup_ratio.is_some() {
            wsd_boundaries(self.total_steps, warmup_ratio, self.cooldown_ratio)
        } else {
            let (_, cooldown) = wsd_boundaries(self.total_steps, 0.0, self.cooldown_ratio);
            (self.warmup_steps, cooldown)
        };
        if warmup_steps + cooldown_steps > self.total_steps {
            return Err(SftPackError::config(format!(
                "warmup ({warmup_steps}) + cooldown ({cooldown_steps}) steps exceed total steps ({})",
                self.total_steps
            )));
        }

        Ok(LearningRateScheduler::new(
            self.base_lr,
            self.total_steps,
            warmup_steps,
            self.scheduler_type,
        )
        .with_min_lr(self.min_lr)
        .with_cooldown_steps(cooldown_steps)
        .with_num_restarts(self.num_restarts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_wsd_scenario() {
        let lr = 5e-5;
        assert!(close(wsd_rate(0, 100, lr, 0.1, 0.2), 0.0));
        assert!(close(wsd_rate(10, 100, lr, 0.1, 0.2), lr));
        assert!(close(wsd_rate(50, 100, lr, 0.1, 0.2), lr));
        assert!(close(wsd_rate(100, 100, lr, 0.1, 0.2), 0.0));
        assert!(close(wsd_rate(5, 100, lr, 0.1, 0.2), lr / 2.0));
        assert!(close(wsd_rate(90, 100, lr, 0.1, 0.2), lr / 2.0));
    }

    #[test]
    fn test_wsd_continuity_at_seams() {
        let lr = 1.0;
        for &(total, warmup, cooldown) in &[
            (100usize, 0.1, 0.2),
            (1000, 0.03, 0.1),
            (37, 0.25, 0.5),
            (10, 0.5, 0.5),
        ] {
            let (w, c) = wsd_boundaries(total, warmup, cooldown);
            let max_jump = lr / w.min(c).max(1) as f64;
            for step in 1..=total {
                let jump = (wsd_rate(step, total, lr, warmup, cooldown)
                    - wsd_rate(step - 1, total, lr, warmup, cooldown))
                .abs();
                assert!(
                    jump <= max_jump + 1e-12,
                    "jump {jump} at step {step} for total={total}"
                );
            }
        }
    }

    #[test]
    fn test_wsd_zero_warmup_starts_at_base() {
        assert!(close(wsd_rate(0, 100, 1.0, 0.0, 0.2), 1.0));
        assert!(close(wsd_rate(100, 100, 1.0, 0.0, 0.0), 0.0));
    }

    #[test]
    fn test_wsd_phases_are_monotonic() {
        let scheduler = SchedulerBuilder::new()
            .total_steps(100)
            .warmup_ratio(0.1)
            .cooldown_ratio(0.2)
            .build()
            .unwrap();

        assert_eq!(scheduler.phase(0), SchedulePhase::Warmup);
        assert_eq!(scheduler.phase(9), SchedulePhase::Warmup);
        assert_eq!(scheduler.phase(10), SchedulePhase::Stable);
        assert_eq!(scheduler.phase(79), SchedulePhase::Stable);
        assert_eq!(scheduler.phase(80), SchedulePhase::Cooldown);

        let mut last = SchedulePhase::Warmup;
        for step in 0..=120 {
            let phase = scheduler.phase(step);
            assert!(phase >= last);
            last = phase;
        }
    }

    #[test]
    fn test_builder_rejects_overlapping_ratios() {
        let err = SchedulerBuilder::new()
            .warmup_ratio(0.7)
            .cooldown_ratio(0.5)
            .build()
            .unwrap_err();
        assert!(matches!(err, SftPackError::Config(_)));
    }

    #[test]
    fn test_set_step_refuses_rewind() {
        let mut scheduler = SchedulerBuilder::new().total_steps(10).build().unwrap();
        scheduler.set_step(5).unwrap();
        assert!(scheduler.set_step(3).is_err());

        let state = ScheduleState {
            step: 2,
            phase: scheduler.phase(2),
        };
        scheduler.restore(state).unwrap();
        assert_eq!(scheduler.current_step(), 2);
    }

    #[test]
    fn test_step_walks_through_phases() {
        let mut scheduler = SchedulerBuilder::new()
            .total_steps(10)
            .warmup_ratio(0.2)
            .cooldown_ratio(0.3)
            .build()
            .unwrap();

        let mut phases = vec![scheduler.phase(scheduler.current_step())];
        while !scheduler.is_complete() {
            scheduler.step();
            phases.push(scheduler.phase(scheduler.current_step()));
        }
        phases.dedup();
        assert_eq!(
            phases,
            vec![SchedulePhase::Warmup, SchedulePhase::Stable, SchedulePhase::Cooldown]
        );
        assert_eq!(scheduler.current_step(), 10);
    }

    #[test]
    fn test_restore_rejects_inconsistent_phase() {
        let mut scheduler = SchedulerBuilder::new()
            .total_steps(100)
            .warmup_ratio(0.1)
            .cooldown_ratio(0.2)
            .build()
            .unwrap();
        let bad = ScheduleState {
            step: 50,
            phase: SchedulePhase::Cooldown,
        };
        assert!(scheduler.restore(bad).is_err());
    }

    #[test]
    fn test_linear_decay() {
        let scheduler = LearningRateScheduler::new(1e-4, 1000, 0, LrSchedulerType::Linear);

        assert!((scheduler.get_lr(0) - 1e-4).abs() < 1e-10);
        assert!(scheduler.get_lr(500) < 1e-4);
        assert!(scheduler.get_lr(999) < scheduler.get_lr(500));
    }

    #[test]
    fn test_cosine_warmup() {
        let scheduler = LearningRateScheduler::new(1e-4, 1000, 100, LrSchedulerType::Cosine);

        assert!(scheduler.get_lr(0) < scheduler.get_lr(50));
        assert!(scheduler.get_lr(50) < scheduler.get_lr(100));
        assert!((scheduler.get_lr(100) - 1e-4).abs() < 1e-10);
        assert!(scheduler.get_lr(999) < scheduler.get_lr(500));
    }

    #[test]
    fn test_constant_with_warmup() {
        let scheduler =
            LearningRateScheduler::new(1e-4, 1000, 10, LrSchedulerType::ConstantWithWarmup);
        assert!(close(scheduler.get_lr(0), 0.0));
        assert!(close(scheduler.get_lr(10), 1e-4));
        assert!(close(scheduler.get_lr(999), 1e-4));
    }
}
