//! Loss reduction over masked token losses.
//!
//! The model reports one loss per window position. This module turns those
//! into per-example signals for the reweighter, and into the per-token
//! weights whose weighted sum is the training objective:
//!
//! ```text
//! weight_t = mask_t * select_t * scale_{example(t)} / normaliser
//! ```
//!
//! `normaliser` is the supervised token count for `mean` reduction, or
//! `batch_size * max_seq_length` for `sum` reduction. `select_t` is 1 unless
//! a quantile masking strategy keeps only the tokens above a loss quantile.

use sftpack_core::{
    LossMaskingStrategy, LossQuantiles, ReduceLoss, Result, SftPackError, TrainingConfig,
};
use sftpack_data::MaskedWindow;

use crate::reweight::ExampleSignal;

/// Loss signal of one packed segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentSignal {
    /// Window index within the micro-batch.
    pub window: usize,
    /// Segment index within the window.
    pub segment: usize,
    /// Per-example signal.
    pub signal: ExampleSignal,
}

/// Mean supervised loss of every segment that has supervised tokens.
pub fn segment_signals(windows: &[MaskedWindow], token_losses: &[Vec<f32>]) -> Vec<SegmentSignal> {
    let mut signals = Vec::new();
    for (w, (window, losses)) in windows.iter().zip(token_losses).enumerate() {
        for (s, segment) in window.batch.segments.iter().enumerate() {
            let mut sum = 0.0f64;
            let mut count = 0usize;
            for t in segment.start..segment.end().min(losses.len()) {
                if window.mask.is_supervised(t) {
                    sum += f64::from(losses[t]);
                    count += 1;
                }
            }
            if count > 0 {
                signals.push(SegmentSignal {
                    window: w,
                    segment: s,
                    signal: ExampleSignal {
                        example_id: segment.example_id,
                        loss: sum / count as f64,
                        num_tokens: count,
                    },
                });
            }
        }
    }
    signals
}

/// Linearly interpolated quantile of sorted values.
pub fn quantile(sorted: &[f32], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => f64::from(sorted[0]),
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            f64::from(sorted[lo]) * (1.0 - frac) + f64::from(sorted[hi]) * frac
        }
    }
}

/// 10/25/50/75/90 % quantiles of `values`, or `None` when empty.
pub fn loss_quantiles(values: &[f32]) -> Option<LossQuantiles> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    Some(LossQuantiles {
        q10: quantile(&sorted, 0.10),
        q25: quantile(&sorted, 0.25),
        q50: quantile(&sorted, 0.50),
        q75: quantile(&sorted, 0.75),
        q90: quantile(&sorted, 0.90),
    })
}

/// Objective of one micro-batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedLoss {
    /// Weighted loss value.
    pub loss: f64,
    /// Gradient weight per position, one vector per window.
    pub token_weights: Vec<Vec<f32>>,
    /// Supervised positions across the micro-batch.
    pub supervised_tokens: usize,
    /// Positions across the micro-batch.
    pub window_tokens: usize,
    /// Supervised token loss quantiles, when a quantile strategy is active.
    pub quantiles: Option<LossQuantiles>,
}

/// Reduces token losses to the training objective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossReducer {
    reduce: ReduceLoss,
    strategy: LossMaskingStrategy,
    batch_size: usize,
    max_seq_length: usize,
}

impl LossReducer {
    /// Create a reducer.
    pub fn new(
        reduce: ReduceLoss,
        strategy: LossMaskingStrategy,
        batch_size: usize,
        max_seq_length: usize,
    ) -> Self {
        Self {
            reduce,
            strategy,
            batch_size,
            max_seq_length,
        }
    }

    /// Reducer configured by a training config.
    pub fn from_training_config(config: &TrainingConfig) -> Self {
        Self::new(
            config.reduce_loss,
            config.loss_masking,
            config.per_device_train_batch_size,
            config.max_seq_length,
        )
    }

    /// Active masking strategy.
    pub fn strategy(&self) -> LossMaskingStrategy {
        self.strategy
    }

    /// Reduce one micro-batch.
    ///
    /// `scales[i]` is the gradient scale of `signals[i]`; segments without a
    /// signal keep scale 1.
    ///
    /// # Errors
    ///
    /// Returns [`SftPackError::ShapeMismatch`] when the token losses do not
    /// cover every window position.
    pub fn reduce(
        &self,
        windows: &[MaskedWindow],
        token_losses: &[Vec<f32>],
        signals: &[SegmentSignal],
        scales: &[f64],
    ) -> Result<ReducedLoss> {
        if token_losses.len() != windows.len() {
            return Err(SftPackError::ShapeMismatch {
                expected: vec![windows.len()],
                actual: vec![token_losses.len()],
            });
        }
        for (window, losses) in windows.iter().zip(token_losses) {
            if losses.len() != window.batch.window_len {
                return Err(SftPackError::ShapeMismatch {
                    expected: vec![window.batch.window_len],
                    actual: vec![losses.len()],
                });
            }
        }

        let supervised: Vec<f32> = windows
            .iter()
            .zip(token_losses)
            .flat_map(|(window, losses)| {
                losses
                    .iter()
                    .enumerate()
                    .filter(|(t, _)| window.mask.is_supervised(*t))
                    .map(|(_, &loss)| loss)
            })
            .collect();
        let window_tokens = windows.iter().map(|w| w.batch.window_len).sum();

        let (selection, quantiles) = match self.strategy.threshold() {
            Some((q, factor)) => {
                let mut sorted = supervised.clone();
                sorted.sort_by(f32::total_cmp);
                (Some((quantile(&sorted, q), factor)), loss_quantiles(&supervised))
            }
            None => (None, None),
        };

        let normaliser = match self.reduce {
            ReduceLoss::Mean => supervised.len() as f64,
            ReduceLoss::Sum => (self.batch_size * self.max_seq_length) as f64,
        };

        let mut segment_scales: Vec<Vec<f32>> =
            windows.iter().map(|w| vec![1.0; w.batch.window_len]).collect();
        for (signal, &scale) in signals.iter().zip(scales) {
            let Some(segment) = windows
                .get(signal.window)
                .and_then(|w| w.batch.segments.get(signal.segment))
            else {
                continue;
            };
            let row = &mut segment_scales[signal.window];
            let end = segment.end().min(row.len());
            row[segment.start..end].fill(scale as f32);
        }

        let mut loss = 0.0f64;
        let mut token_weights = Vec::with_capacity(windows.len());
        for ((window, losses), seg_scales) in windows.iter().zip(token_losses).zip(&segment_scales) {
            let weights: Vec<f32> = losses
                .iter()
                .enumerate()
                .map(|(t, &token_loss)| {
                    if normaliser == 0.0 || !window.mask.is_supervised(t) {
                        return 0.0;
                    }
                    let select = match selection {
                        Some((threshold, factor)) if f64::from(token_loss) > threshold => factor,
                        Some(_) => 0.0,
                        None => 1.0,
                    };
                    (select * f64::from(seg_scales[t]) / normaliser) as f32
                })
                .collect();
            loss += weights
                .iter()
                .zip(losses)
                .map(|(&w, &l)| f64::from(w) * f64::from(l))
                .sum::<f64>();
            token_weights.push(weights);
        }

        Ok(ReducedLoss {
            loss,
            token_weights,
            supervised_tokens: supervised.len(),
            window_tokens,
            quantiles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sftpack_data::{Example, LossMaskBuilder, PackerConfig, Role, SequencePacker, Turn};

    fn window() -> MaskedWindow {
        // [u a a a | u a a | pad]: two examples in one window of 8
        let examples = vec![
            Example::new(
                0,
                vec![Turn::new(Role::User, vec![1]), Turn::new(Role::Assistant, vec![2, 3, 4])],
            ),
            Example::new(
                1,
                vec![Turn::new(Role::User, vec![5]), Turn::new(Role::Assistant, vec![6, 7])],
            ),
        ];
        let batch = SequencePacker::new(PackerConfig::with_max_seq_length(8))
            .unwrap()
            .pack(&examples)
            .unwrap()
            .remove(0);
        let mask = LossMaskBuilder::new(true).build(&batch);
        MaskedWindow { batch, mask }
    }

    fn losses() -> Vec<Vec<f32>> {
        vec![vec![9.0, 1.0, 2.0, 3.0, 9.0, 4.0, 6.0, 9.0]]
    }

    #[test]
    fn test_segment_signals() {
        let signals = segment_signals(&[window()], &losses());
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].signal.example_id, 0);
        assert!((signals[0].signal.loss - 2.0).abs() < 1e-12);
        assert_eq!(signals[0].signal.num_tokens, 3);
        assert!((signals[1].signal.loss - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_mean_reduction_ignores_unsupervised() {
        let reducer = LossReducer::new(ReduceLoss::Mean, LossMaskingStrategy::Default, 1, 8);
        let reduced = reducer.reduce(&[window()], &losses(), &[], &[]).unwrap();
        // supervised: 1, 2, 3, 4, 6
        assert!((reduced.loss - 16.0 / 5.0).abs() < 1e-6);
        assert_eq!(reduced.supervised_tokens, 5);
        assert_eq!(reduced.window_tokens, 8);
        assert_eq!(reduced.token_weights[0][0], 0.0);
        assert!((reduced.token_weights[0][1] - 0.2).abs() < 1e-7);
        assert!(reduced.quantiles.is_none());
    }

    #[test]
    fn test_sum_reduction_normalises_by_capacity() {
        let reducer = LossReducer::new(ReduceLoss::Sum, LossMaskingStrategy::Default, 2, 8);
        let reduced = reducer.reduce(&[window()], &losses(), &[], &[]).unwrap();
        assert!((reduced.loss - 16.0 / 16.0).abs() < 1e-6);
    }

    #[test]
    fn test_quantile_strategy_keeps_high_losses() {
        let reducer = LossReducer::new(ReduceLoss::Sum, LossMaskingStrategy::BelowMedianMultiple, 1, 8);
        let reduced = reducer.reduce(&[window()], &losses(), &[], &[]).unwrap();
        // median of [1, 2, 3, 4, 6] is 3: tokens 4 and 6 survive, scaled by 2
        assert!((reduced.loss - 2.0 * (4.0 + 6.0) / 8.0).abs() < 1e-6);
        let q = reduced.quantiles.unwrap();
        assert!((q.q50 - 3.0).abs() < 1e-9);
        assert!((q.q25 - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_segment_scales_apply() {
        let reducer = LossReducer::new(ReduceLoss::Mean, LossMaskingStrategy::Default, 1, 8);
        let w = [window()];
        let signals = segment_signals(&w, &losses());
        let reduced = reducer.reduce(&w, &losses(), &signals, &[0.5, 1.5]).unwrap();
        let expected = (0.5 * (1.0 + 2.0 + 3.0) + 1.5 * (4.0 + 6.0)) / 5.0;
        assert!((reduced.loss - expected).abs() < 1e-6);
    }

    #[test]
    fn test_loss_length_checked() {
        let reducer = LossReducer::new(ReduceLoss::Mean, LossMaskingStrategy::Default, 1, 8);
        let err = reducer.reduce(&[window()], &[vec![0.0; 7]], &[], &[]).unwrap_err();
        assert!(matches!(err, SftPackError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_quantile_interpolates() {
        assert_eq!(quantile(&[], 0.5), 0.0);
        assert_eq!(quantile(&[1.0, 3.0], 0.5), 2.0);
        assert!((quantile(&[1.0, 2.0, 3.0, 4.0, 5.0], 0.9) - 4.6).abs() < 1e-9);
    }
}
