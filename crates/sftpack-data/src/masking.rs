//! Per-token supervision masks for packed windows.
//!
//! A position is supervised iff it is an assistant content token (or any
//! content token when user masking is off). Separators and padding are never
//! supervised. The mask is a pure function of the window structure.

use crate::{PackedBatch, Role, TokenKind};

/// Label value ignored by the loss.
pub const IGNORE_INDEX: i64 = -100;

/// 0/1 weight for every position of a window.
#[derive(Debug, Clone, PartialEq)]
pub struct LossMask {
    /// Supervision weight per position.
    pub weights: Vec<f32>,
}

impl LossMask {
    /// Number of positions.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// Whether the mask covers no positions.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Number of supervised positions.
    pub fn supervised_count(&self) -> usize {
        self.weights.iter().filter(|&&w| w > 0.0).count()
    }

    /// Whether position `index` is supervised.
    pub fn is_supervised(&self, index: usize) -> bool {
        self.weights.get(index).is_some_and(|&w| w > 0.0)
    }

    /// Labels for a cross-entropy loss: the token id where supervised,
    /// `ignore_index` elsewhere.
    pub fn to_labels(&self, input_ids: &[u32], ignore_index: i64) -> Vec<i64> {
        input_ids
            .iter()
            .zip(&self.weights)
            .map(|(&id, &w)| if w > 0.0 { i64::from(id) } else { ignore_index })
            .collect()
    }
}

/// Builds [`LossMask`] values from packed windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossMaskBuilder {
    mask_users: bool,
    mask_segment_starts: bool,
}

impl Default for LossMaskBuilder {
    fn default() -> Self {
        Self::new(true)
    }
}

impl LossMaskBuilder {
    /// Create a builder; `mask_users` restricts supervision to assistant turns.
    pub fn new(mask_users: bool) -> Self {
        Self {
            mask_users,
            mask_segment_starts: false,
        }
    }

    /// Also exclude the first token of every segment after the first.
    ///
    /// That token would otherwise be predicted from the previous
    /// conversation's last token.
    pub fn with_mask_segment_starts(mut self, enabled: bool) -> Self {
        self.mask_segment_starts = enabled;
        self
    }

    /// Build the mask for `batch`.
    pub fn build(&self, batch: &PackedBatch) -> LossMask {
        let mut weights: Vec<f32> = batch
            .token_kinds
            .iter()
            .map(|kind| match kind {
                TokenKind::Content(Role::Assistant) => 1.0,
                TokenKind::Content(_) if !self.mask_users => 1.0,
                _ => 0.0,
            })
            .collect();

        if self.mask_segment_starts {
            for segment in batch.segments.iter().skip(1) {
                if let Some(w) = weights.get_mut(segment.start) {
                    *w = 0.0;
                }
            }
        }

        LossMask { weights }
    }
}
