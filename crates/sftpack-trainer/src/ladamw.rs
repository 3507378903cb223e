//! LAdamW: AdamW with a rank-compressed second moment.
//!
//! The first moment is kept at full size. For a parameter of shape
//! `rows x cols` whose smaller side exceeds the configured rank, the second
//! moment is stored as a pair of factors:
//!
//! - `C` (`rows x rank`), the second moment projected onto a column basis
//! - `P` (`cols x rank`), an orthonormal column basis
//!
//! with the estimate recovered as `V = max(C P^T, 0)`. Each step updates
//! `C <- beta2 C + (1 - beta2) (G o G) P`. Every `reproject_interval` steps
//! (and on the first one) the basis is re-fitted by one subspace iteration
//! against `T = beta0 V + (1 - beta0) (G o G)`, and `C` is rotated into the
//! new basis. Smaller parameters keep a dense second moment.
//!
//! # Memory
//!
//! Per compressed parameter the second moment costs `rank * (rows + cols)`
//! floats instead of `rows * cols`. With rank 256 a `4096 x 4096` projection
//! stores 2M floats instead of 16.8M.
//!
//! # Fused and reference paths
//!
//! The fused path walks each parameter once per pass without materialising
//! `rows x cols` intermediates. The reference path (`no_fused`) performs the
//! same math with whole-matrix operations. Both agree up to floating-point
//! associativity.
//!
//! # Example
//!
//! ```ignore
//! use sftpack_trainer::{LAdamWBuilder, ParameterSet};
//!
//! let mut optimizer = LAdamWBuilder::new(2e-5)
//!     .with_rank(256)
//!     .with_betas((0.9, 0.9, 0.999))
//!     .with_weight_decay(0.01)
//!     .build(&params)?;
//! ```

use ndarray::{Array1, Array2, ArrayView2, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sftpack_core::{
    Optimizer, OptimizerType, Result, SftPackError, StepOutcome, TrainingConfig, MAX_LADAMW_RANK,
};
use tracing::{debug, warn};

use crate::params::{create_parameter_groups, weight_decay_by_id, ParamId, ParameterSet};

/// Upper bound on the RMS of a compressed-slot update direction.
const UPDATE_RMS_CAP: f64 = 1.0;

/// Relative norm below which a basis direction is considered degenerate.
const ORTHO_TOLERANCE: f32 = 1e-4;

/// Error type for LAdamW construction.
#[derive(Debug, thiserror::Error)]
pub enum LAdamWError {
    /// Rank outside `1..=MAX_LADAMW_RANK`.
    #[error("rank {rank} must be in 1..={max}")]
    InvalidRank {
        /// Requested rank.
        rank: usize,
        /// Largest supported rank.
        max: usize,
    },
    /// A decay rate outside `[0, 1)`.
    #[error("{name} must be in [0, 1), got {value}")]
    InvalidBeta {
        /// Which beta.
        name: &'static str,
        /// Offending value.
        value: f64,
    },
    /// A non-positive or non-finite hyperparameter.
    #[error("{name} is invalid: {value}")]
    InvalidValue {
        /// Which hyperparameter.
        name: &'static str,
        /// Offending value.
        value: f64,
    },
    /// Reprojection interval of zero.
    #[error("reproject_interval must be > 0")]
    InvalidInterval,
}

impl From<LAdamWError> for SftPackError {
    fn from(err: LAdamWError) -> Self {
        SftPackError::Config(format!("LAdamW: {err}"))
    }
}

/// LAdamW configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LAdamWConfig {
    /// Learning rate.
    pub lr: f64,
    /// Decay of the history estimate when re-fitting the basis.
    pub beta0: f64,
    /// First moment decay.
    pub beta1: f64,
    /// Compressed second moment decay.
    pub beta2: f64,
    /// Epsilon for numerical stability.
    pub eps: f64,
    /// Decoupled weight decay for parameters outside the no-decay group.
    pub weight_decay: f64,
    /// Rank of the compressed second moment.
    pub rank: usize,
    /// Steps between basis re-fits.
    pub reproject_interval: usize,
    /// Global gradient norm ceiling (0 disables clipping).
    pub clip_grad_norm: f64,
    /// Use the fused update path.
    pub fused: bool,
    /// Store every second moment densely (plain AdamW).
    pub dense_second_moment: bool,
    /// Seed for basis initialisation.
    pub seed: u64,
}

impl Default for LAdamWConfig {
    fn default() -> Self {
        Self {
            lr: 2e-5,
            beta0: 0.9,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            rank: 256,
            reproject_interval: 200,
            clip_grad_norm: 1.0,
            fused: true,
            dense_second_moment: false,
            seed: 42,
        }
    }
}

impl LAdamWConfig {
    /// Optimizer settings of a training config.
    pub fn from_training_config(config: &TrainingConfig) -> Self {
        Self {
            lr: config.learning_rate,
            beta0: config.beta0,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.adam_epsilon,
            weight_decay: config.weight_decay,
            rank: config.ladamw_rank,
            reproject_interval: config.reproject_interval,
            clip_grad_norm: config.clip_grad_norm,
            fused: !config.no_fused,
            dense_second_moment: config.optimizer == OptimizerType::AdamW,
            seed: config.seed,
        }
    }

    /// Check hyperparameter ranges.
    pub fn validate(&self) -> std::result::Result<(), LAdamWError> {
        if self.rank == 0 || self.rank > MAX_LADAMW_RANK {
            return Err(LAdamWError::InvalidRank {
                rank: self.rank,
                max: MAX_LADAMW_RANK,
            });
        }
        for (name, value) in [("beta0", self.beta0), ("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&value) {
                return Err(LAdamWError::InvalidBeta { name, value });
            }
        }
        if !(self.eps > 0.0 && self.eps.is_finite()) {
            return Err(LAdamWError::InvalidValue {
                name: "eps",
                value: self.eps,
            });
        }
        for (name, value) in [
            ("lr", self.lr),
            ("weight_decay", self.weight_decay),
            ("clip_grad_norm", self.clip_grad_norm),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(LAdamWError::InvalidValue { name, value });
            }
        }
        if self.reproject_interval == 0 {
            return Err(LAdamWError::InvalidInterval);
        }
        Ok(())
    }
}

/// Second moment storage of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SecondMoment {
    /// Full `rows x cols` estimate.
    Dense {
        /// Second moment.
        v: Array2<f32>,
    },
    /// `V = max(C P^T, 0)`.
    LowRank {
        /// Projected second moment, `rows x rank`.
        c: Array2<f32>,
        /// Orthonormal column basis, `cols x rank`.
        basis: Array2<f32>,
    },
}

impl SecondMoment {
    /// Floats held by this estimate.
    pub fn num_floats(&self) -> usize {
        match self {
            Self::Dense { v } => v.len(),
            Self::LowRank { c, basis } => c.len() + basis.len(),
        }
    }

    /// Whether the estimate is compressed.
    pub fn is_low_rank(&self) -> bool {
        matches!(self, Self::LowRank { .. })
    }

    /// The current estimate as a dense matrix.
    pub fn estimate(&self) -> Array2<f32> {
        match self {
            Self::Dense { v } => v.clone(),
            Self::LowRank { c, basis } => c.dot(&basis.t()).mapv(|x| x.max(0.0)),
        }
    }
}

/// Optimizer state of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentSlot {
    /// Decoupled weight decay applied to this parameter.
    pub weight_decay: f64,
    /// First moment.
    pub m: Array2<f32>,
    /// Second moment.
    pub second: SecondMoment,
}

impl MomentSlot {
    /// Shape of the parameter this slot belongs to.
    pub fn shape(&self) -> (usize, usize) {
        self.m.dim()
    }
}

/// Fixed-size moment buffers indexed by [`ParamId`].
///
/// Slots are allocated once at registration and never resized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MomentArena {
    slots: Vec<MomentSlot>,
}

impl MomentArena {
    /// Allocate a slot for a `rows x cols` parameter.
    pub fn register(
        &mut self,
        shape: (usize, usize),
        rank: usize,
        dense: bool,
        weight_decay: f64,
        rng: &mut StdRng,
    ) -> ParamId {
        let (rows, cols) = shape;
        let second = if dense || rows.min(cols) <= rank {
            SecondMoment::Dense {
                v: Array2::zeros(shape),
            }
        } else {
            SecondMoment::LowRank {
                c: Array2::zeros((rows, rank)),
                basis: initial_basis(cols, rank, rng),
            }
        };
        self.slots.push(MomentSlot {
            weight_decay,
            m: Array2::zeros(shape),
            second,
        });
        ParamId(self.slots.len() - 1)
    }

    /// Slot of a parameter.
    pub fn slot(&self, id: ParamId) -> Option<&MomentSlot> {
        self.slots.get(id.0)
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot is allocated.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots in id order.
    pub fn slots(&self) -> &[MomentSlot] {
        &self.slots
    }

    fn check_layout(&self, other: &MomentArena) -> Result<()> {
        if self.slots.len() != other.slots.len() {
            return Err(SftPackError::ShapeMismatch {
                expected: vec![self.slots.len()],
                actual: vec![other.slots.len()],
            });
        }
        for (mine, theirs) in self.slots.iter().zip(&other.slots) {
            let same_kind = mine.second.is_low_rank() == theirs.second.is_low_rank();
            if mine.shape() != theirs.shape() || !same_kind {
                return Err(SftPackError::ShapeMismatch {
                    expected: vec![mine.shape().0, mine.shape().1],
                    actual: vec![theirs.shape().0, theirs.shape().1],
                });
            }
        }
        Ok(())
    }
}

/// Checkpointable optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LAdamWState {
    /// Updates applied so far.
    pub step: usize,
    /// Learning rate at snapshot time.
    pub learning_rate: f64,
    /// Moment buffers.
    pub arena: MomentArena,
}

/// Memory usage statistics for LAdamW.
#[derive(Debug, Clone, PartialEq)]
pub struct LAdamWMemoryStats {
    /// Total number of parameter elements tracked.
    pub total_params: usize,
    /// Slots with a compressed second moment.
    pub compressed_slots: usize,
    /// Slots with a dense second moment.
    pub dense_slots: usize,
    /// Floats held by the arena (both moments, factors included).
    pub state_floats: usize,
    /// Floats a dense AdamW would hold.
    pub dense_equivalent_floats: usize,
    /// Fraction of state memory saved (0.0 - 1.0).
    pub memory_saved: f64,
}

impl LAdamWMemoryStats {
    /// State size in megabytes.
    pub fn state_mb(&self) -> f64 {
        (self.state_floats * 4) as f64 / 1_000_000.0
    }

    /// Dense-equivalent state size in megabytes.
    pub fn dense_equivalent_mb(&self) -> f64 {
        (self.dense_equivalent_floats * 4) as f64 / 1_000_000.0
    }
}

/// Per-step scalars shared by every slot update.
#[derive(Debug, Clone, Copy)]
struct StepScalars {
    lr: f32,
    beta0: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    bias_correction1: f32,
    bias_correction2: f32,
    grad_scale: f32,
}

/// AdamW with a rank-compressed second moment.
#[derive(Debug, Clone)]
pub struct LAdamW {
    config: LAdamWConfig,
    arena: MomentArena,
    step: usize,
    lr: f64,
}

impl LAdamW {
    /// Create an optimizer with one slot per parameter of `params`.
    ///
    /// Parameters matching the no-decay patterns get zero weight decay.
    pub fn new(config: LAdamWConfig, params: &ParameterSet) -> Result<Self> {
        config.validate()?;
        let groups = create_parameter_groups(params, config.weight_decay);
        let decay = weight_decay_by_id(&groups, params.len());

        let mut arena = MomentArena::default();
        for (id, name, tensor) in params.iter() {
            let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(id.0 as u64));
            arena.register(
                tensor.dim(),
                config.rank,
                config.dense_second_moment,
                decay[id.0],
                &mut rng,
            );
            debug!(
                param = name,
                rows = tensor.nrows(),
                cols = tensor.ncols(),
                low_rank = arena.slots[id.0].second.is_low_rank(),
                "Registered optimizer slot"
            );
        }

        Ok(Self {
            lr: config.lr,
            config,
            arena,
            step: 0,
        })
    }

    /// Optimizer configuration.
    pub fn config(&self) -> &LAdamWConfig {
        &self.config
    }

    /// Moment buffers.
    pub fn arena(&self) -> &MomentArena {
        &self.arena
    }

    /// Switch between the fused and reference update paths.
    pub fn set_fused(&mut self, fused: bool) {
        self.config.fused = fused;
    }

    /// Whether the basis is re-fitted before update number `step` (1-based).
    pub fn reprojection_due(&self, step: usize) -> bool {
        step > 0 && (step - 1) % self.config.reproject_interval == 0
    }

    /// Snapshot for checkpointing.
    pub fn state_snapshot(&self) -> LAdamWState {
        LAdamWState {
            step: self.step,
            learning_rate: self.lr,
            arena: self.arena.clone(),
        }
    }

    /// Restore a snapshot taken from an optimizer over the same parameters.
    pub fn restore(&mut self, state: LAdamWState) -> Result<()> {
        self.arena.check_layout(&state.arena)?;
        self.step = state.step;
        self.lr = state.learning_rate;
        self.arena = state.arena;
        Ok(())
    }

    /// Report arena memory compared to dense AdamW.
    pub fn memory_usage(&self) -> LAdamWMemoryStats {
        let mut stats = LAdamWMemoryStats {
            total_params: 0,
            compressed_slots: 0,
            dense_slots: 0,
            state_floats: 0,
            dense_equivalent_floats: 0,
            memory_saved: 0.0,
        };
        for slot in &self.arena.slots {
            let numel = slot.m.len();
            stats.total_params += numel;
            stats.state_floats += numel + slot.second.num_floats();
            stats.dense_equivalent_floats += 2 * numel;
            if slot.second.is_low_rank() {
                stats.compressed_slots += 1;
            } else {
                stats.dense_slots += 1;
            }
        }
        if stats.dense_equivalent_floats > 0 {
            stats.memory_saved =
                1.0 - stats.state_floats as f64 / stats.dense_equivalent_floats as f64;
        }
        stats
    }

    fn check_shapes(&self, params: &[Array2<f32>], grads: &[Array2<f32>]) -> Result<()> {
        if params.len() != self.arena.len() || grads.len() != self.arena.len() {
            return Err(SftPackError::ShapeMismatch {
                expected: vec![self.arena.len()],
                actual: vec![params.len(), grads.len()],
            });
        }
        for ((slot, param), grad) in self.arena.slots.iter().zip(params).zip(grads) {
            let expected = slot.shape();
            for actual in [param.dim(), grad.dim()] {
                if actual != expected {
                    return Err(SftPackError::ShapeMismatch {
                        expected: vec![expected.0, expected.1],
                        actual: vec![actual.0, actual.1],
                    });
                }
            }
        }
        Ok(())
    }
}

impl Optimizer for LAdamW {
    type Tensor = Array2<f32>;

    fn step(&mut self, params: &mut [Array2<f32>], grads: &[Array2<f32>]) -> Result<StepOutcome> {
        self.check_shapes(params, grads)?;

        let grad_norm = global_grad_norm(grads);
        if !grad_norm.is_finite() {
            warn!(
                step = self.step + 1,
                grad_norm, "Non-finite gradient, skipping optimizer step"
            );
            return Ok(StepOutcome::Skipped {
                reason: format!("non-finite gradient norm ({grad_norm})"),
            });
        }

        let clip = self.config.clip_grad_norm;
        let clipped = clip > 0.0 && grad_norm > clip;
        let grad_scale = if clipped { clip / (grad_norm + 1e-6) } else { 1.0 };

        self.step += 1;
        let t = i32::try_from(self.step).unwrap_or(i32::MAX);
        let (beta1, beta2) = (self.config.beta1 as f32, self.config.beta2 as f32);
        let scalars = StepScalars {
            lr: self.lr as f32,
            beta0: self.config.beta0 as f32,
            beta1,
            beta2,
            eps: self.config.eps as f32,
            bias_correction1: 1.0 - beta1.powi(t),
            bias_correction2: 1.0 - beta2.powi(t),
            grad_scale: grad_scale as f32,
        };
        let reproject = self.reprojection_due(self.step);
        let fused = self.config.fused;

        for ((slot, param), grad) in self.arena.slots.iter_mut().zip(params.iter_mut()).zip(grads) {
            if reproject {
                reproject_slot(slot, grad, &scalars);
            }
            let decay = 1.0 - scalars.lr * slot.weight_decay as f32;
            if fused {
                fused_update(slot, param, grad, decay, &scalars);
            } else {
                reference_update(slot, param, grad, decay, &scalars);
            }
        }

        Ok(StepOutcome::Applied { grad_norm, clipped })
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn step_count(&self) -> usize {
        self.step
    }
}

/// L2 norm over all gradients, accumulated in `f64`.
pub fn global_grad_norm(grads: &[Array2<f32>]) -> f64 {
    grads
        .iter()
        .flat_map(|g| g.iter())
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt()
}

fn adam_direction(m: f32, v: f32, s: &StepScalars) -> f32 {
    (m / s.bias_correction1) / ((v / s.bias_correction2).sqrt() + s.eps)
}

fn rms_factor(sum_sq: f64, len: usize) -> f32 {
    let rms = (sum_sq / len.max(1) as f64).sqrt();
    if rms > UPDATE_RMS_CAP {
        (UPDATE_RMS_CAP / rms) as f32
    } else {
        1.0
    }
}

/// Re-fit the column basis of a compressed slot and rotate `C` into it.
fn reproject_slot(slot: &mut MomentSlot, grad: &Array2<f32>, s: &StepScalars) {
    let SecondMoment::LowRank { c, basis } = &mut slot.second else {
        return;
    };
    let history = c.dot(&basis.t()).mapv(|x| x.max(0.0));
    let fresh = grad.mapv(|g| {
        let g = g * s.grad_scale;
        g * g
    });
    let target = history * s.beta0 + fresh * (1.0 - s.beta0);

    let range = target.dot(&*basis);
    let refit = orthonormalize(target.t().dot(&range), Some(basis.view()));
    let rotation = basis.t().dot(&refit);
    *c = c.dot(&rotation);
    *basis = refit;
}

fn reference_update(
    slot: &mut MomentSlot,
    param: &mut Array2<f32>,
    grad: &Array2<f32>,
    decay: f32,
    s: &StepScalars,
) {
    let g = grad * s.grad_scale;
    let g2 = g.mapv(|x| x * x);
    slot.m = &slot.m * s.beta1 + &g * (1.0 - s.beta1);

    let (v, low_rank) = match &mut slot.second {
        SecondMoment::Dense { v } => {
            *v = &*v * s.beta2 + &g2 * (1.0 - s.beta2);
            (v.clone(), false)
        }
        SecondMoment::LowRank { c, basis } => {
            *c = &*c * s.beta2 + &g2.dot(&*basis) * (1.0 - s.beta2);
            (c.dot(&basis.t()).mapv(|x| x.max(0.0)), true)
        }
    };

    let m_hat = &slot.m / s.bias_correction1;
    let denom = v.mapv(|x| (x / s.bias_correction2).sqrt() + s.eps);
    let mut update = m_hat / denom;
    if low_rank {
        let sum_sq = update.iter().map(|&u| f64::from(u * u)).sum::<f64>();
        update *= rms_factor(sum_sq, update.len());
    }

    param.mapv_inplace(|p| p * decay);
    param.scaled_add(-s.lr, &update);
}

fn fused_update(
    slot: &mut MomentSlot,
    param: &mut Array2<f32>,
    grad: &Array2<f32>,
    decay: f32,
    s: &StepScalars,
) {
    match &mut slot.second {
        SecondMoment::Dense { v } => {
            Zip::from(param)
                .and(grad)
                .and(&mut slot.m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    let g = g * s.grad_scale;
                    *m = *m * s.beta1 + g * (1.0 - s.beta1);
                    *v = *v * s.beta2 + (g * g) * (1.0 - s.beta2);
                    *p = *p * decay - s.lr * adam_direction(*m, *v, s);
                });
        }
        SecondMoment::LowRank { c, basis } => {
            let (rows, cols) = grad.dim();
            let rank = basis.ncols();
            let mut projected = vec![0.0f32; rank];
            let mut sum_sq = 0.0f64;

            // pass 1: moments, plus the RMS of the update direction
            for i in 0..rows {
                projected.fill(0.0);
                for j in 0..cols {
                    let g = grad[[i, j]] * s.grad_scale;
                    let g2 = g * g;
                    for (k, acc) in projected.iter_mut().enumerate() {
                        *acc += g2 * basis[[j, k]];
                    }
                    slot.m[[i, j]] = slot.m[[i, j]] * s.beta1 + g * (1.0 - s.beta1);
                }
                for (k, &proj) in projected.iter().enumerate() {
                    c[[i, k]] = c[[i, k]] * s.beta2 + proj * (1.0 - s.beta2);
                }
                for j in 0..cols {
                    let u = adam_direction(slot.m[[i, j]], low_rank_entry(c, basis, i, j), s);
                    sum_sq += f64::from(u * u);
                }
            }

            // pass 2: apply
            let factor = rms_factor(sum_sq, rows * cols);
            for i in 0..rows {
                for j in 0..cols {
                    let u = adam_direction(slot.m[[i, j]], low_rank_entry(c, basis, i, j), s);
                    param[[i, j]] = param[[i, j]] * decay - s.lr * (u * factor);
                }
            }
        }
    }
}

fn low_rank_entry(c: &Array2<f32>, basis: &Array2<f32>, i: usize, j: usize) -> f32 {
    c.row(i).dot(&basis.row(j)).max(0.0)
}

/// Deterministic starting basis: a normalised ones column followed by
/// seeded random directions, orthonormalised.
fn initial_basis(dim: usize, rank: usize, rng: &mut StdRng) -> Array2<f32> {
    let mut basis = Array2::from_shape_fn((dim, rank), |_| rng.gen_range(-1.0f32..1.0));
    basis.column_mut(0).fill(1.0);
    orthonormalize(basis, None)
}

/// Modified Gram-Schmidt over the columns of `basis`.
///
/// A column that collapses after orthogonalisation is replaced by the same
/// column of `fallback`, then by the first standard basis vector that is
/// still independent. Requires `rank < dim` for the replacement to exist.
pub fn orthonormalize(mut basis: Array2<f32>, fallback: Option<ArrayView2<'_, f32>>) -> Array2<f32> {
    let (dim, rank) = basis.dim();
    for j in 0..rank {
        let mut v = basis.column(j).to_owned();
        if !orthogonalize_against(&mut v, &basis, j) {
            let candidates = fallback
                .map(|f| f.column(j).to_owned())
                .into_iter()
                .chain((0..dim).map(|k| {
                    let mut e = Array1::zeros(dim);
                    e[k] = 1.0;
                    e
                }));
            for mut candidate in candidates {
                if orthogonalize_against(&mut candidate, &basis, j) {
                    v = candidate;
                    break;
                }
            }
        }
        basis.column_mut(j).assign(&v);
    }
    basis
}

/// Remove the components of `v` along the first `upto` columns of `basis`
/// and normalise. Returns false when nothing independent is left.
fn orthogonalize_against(v: &mut Array1<f32>, basis: &Array2<f32>, upto: usize) -> bool {
    let scale = v.dot(v).sqrt();
    if !(scale > 0.0 && scale.is_finite()) {
        return false;
    }
    for i in 0..upto {
        let q = basis.column(i);
        let proj = q.dot(v);
        v.scaled_add(-proj, &q);
    }
    let norm = v.dot(v).sqrt();
    if !(norm > ORTHO_TOLERANCE * scale && norm.is_finite()) {
        return false;
    }
    *v /= norm;
    true
}

/// Builder for [`LAdamW`].
#[derive(Debug, Clone)]
pub struct LAdamWBuilder {
    config: LAdamWConfig,
}

impl LAdamWBuilder {
    /// Create a new builder with the given learning rate.
    pub fn new(lr: f64) -> Self {
        Self {
            config: LAdamWConfig {
                lr,
                ..Default::default()
            },
        }
    }

    /// Set the second moment rank.
    pub fn with_rank(mut self, rank: usize) -> Self {
        self.config.rank = rank;
        self
    }

    /// Set betas `(beta0, beta1, beta2)`.
    pub fn with_betas(mut self, betas: (f64, f64, f64)) -> Self {
        self.config.beta0 = betas.0;
        self.config.beta1 = betas.1;
        self.config.beta2 = betas.2;
        self
    }

    /// Set epsilon for numerical stability.
    pub fn with_eps(mut self, eps: f64) -> Self {
        self.config.eps = eps;
        self
    }

    /// Set weight decay (AdamW-style decoupled).
    pub fn with_weight_decay(mut self, wd: f64) -> Self {
        self.config.weight_decay = wd;
        self
    }

    /// Set the basis re-fit interval.
    pub fn with_reproject_interval(mut self, interval: usize) -> Self {
        self.config.reproject_interval = interval;
        self
    }

    /// Set the global gradient norm ceiling.
    pub fn with_clip_grad_norm(mut self, max_norm: f64) -> Self {
        self.config.clip_grad_norm = max_norm;
        self
    }

    /// Choose the fused or reference path.
    pub fn with_fused(mut self, fused: bool) -> Self {
        self.config.fused = fused;
        self
    }

    /// Keep every second moment dense.
    pub fn with_dense_second_moment(mut self, dense: bool) -> Self {
        self.config.dense_second_moment = dense;
        self
    }

    /// Set the basis initialisation seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Build the optimizer for `params`.
    pub fn build(self, params: &ParameterSet) -> Result<LAdamW> {
        LAdamW::new(self.config, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0f32..1.0))
    }

    fn params() -> ParameterSet {
        ParameterSet::new()
            .with("layers.0.proj.weight", random_matrix(12, 10, 1))
            .unwrap()
            .with("layers.0.proj.bias", random_matrix(1, 10, 2))
            .unwrap()
    }

    fn grads(seed: u64) -> Vec<Array2<f32>> {
        vec![random_matrix(12, 10, seed), random_matrix(1, 10, seed + 100)]
    }

    fn assert_orthonormal(basis: &Array2<f32>) {
        let gram = basis.t().dot(basis);
        for ((i, j), &value) in gram.indexed_iter() {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert!((value - expected).abs() < 1e-4, "gram[{i},{j}] = {value}");
        }
    }

    #[test]
    fn test_slot_layout() {
        let optimizer = LAdamWBuilder::new(1e-3).with_rank(4).build(&params()).unwrap();
        let slots = optimizer.arena().slots();
        assert!(slots[0].second.is_low_rank());
        assert!(!slots[1].second.is_low_rank());
        assert_eq!(slots[1].weight_decay, 0.0);

        let stats = optimizer.memory_usage();
        assert_eq!(stats.compressed_slots, 1);
        assert_eq!(stats.dense_slots, 1);
        // m: 120 + 10, C: 12x4, P: 10x4, v: 10
        assert_eq!(stats.state_floats, 130 + 48 + 40 + 10);
        assert_eq!(stats.dense_equivalent_floats, 260);
        assert!(stats.memory_saved > 0.0);
    }

    #[test]
    fn test_dense_mode_matches_rank_bound() {
        let optimizer = LAdamWBuilder::new(1e-3)
            .with_rank(4)
            .with_dense_second_moment(true)
            .build(&params())
            .unwrap();
        assert!(optimizer.arena().slots().iter().all(|s| !s.second.is_low_rank()));
    }

    #[test]
    fn test_invalid_config_is_config_error() {
        for builder in [
            LAdamWBuilder::new(1e-3).with_rank(0),
            LAdamWBuilder::new(1e-3).with_rank(MAX_LADAMW_RANK + 1),
            LAdamWBuilder::new(1e-3).with_betas((1.0, 0.9, 0.999)),
            LAdamWBuilder::new(1e-3).with_eps(0.0),
            LAdamWBuilder::new(-1.0),
            LAdamWBuilder::new(1e-3).with_reproject_interval(0),
        ] {
            let err = builder.build(&params()).unwrap_err();
            assert!(matches!(err, SftPackError::Config(_)), "{err}");
        }
    }

    #[test]
    fn test_dense_step_matches_adamw() {
        let mut set = ParameterSet::new()
            .with("w", Array2::from_elem((1, 1), 1.0))
            .unwrap();
        let mut optimizer = LAdamWBuilder::new(0.1)
            .with_weight_decay(0.01)
            .with_clip_grad_norm(0.0)
            .build(&set)
            .unwrap();
        let grad = vec![Array2::from_elem((1, 1), 0.5f32)];
        let outcome = optimizer.step(set.tensors_mut(), &grad).unwrap();
        assert_eq!(outcome.grad_norm(), Some(0.5));

        // first step: m_hat = g, v_hat = g^2, direction = g / (|g| + eps) ~ 1
        let expected = 1.0 * (1.0 - 0.1 * 0.01) - 0.1 * (0.5 / (0.5 + 1e-8));
        assert!((set.tensors()[0][[0, 0]] - expected as f32).abs() < 1e-6);
    }

    #[test]
    fn test_clipping_reports_pre_clip_norm() {
        let mut set = params();
        let mut optimizer = LAdamWBuilder::new(1e-3)
            .with_rank(4)
            .with_clip_grad_norm(0.5)
            .build(&set)
            .unwrap();
        let g = grads(3);
        let norm = global_grad_norm(&g);
        match optimizer.step(set.tensors_mut(), &g).unwrap() {
            StepOutcome::Applied { grad_norm, clipped } => {
                assert!((grad_norm - norm).abs() < 1e-9);
                assert!(clipped);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_non_finite_gradient_skips_without_touching_state() {
        let mut set = params();
        let mut optimizer = LAdamWBuilder::new(1e-3).with_rank(4).build(&set).unwrap();
        optimizer.step(set.tensors_mut(), &grads(5)).unwrap();

        let params_before = set.clone();
        let state_before = optimizer.state_snapshot();

        for bad in [f32::NAN, f32::INFINITY] {
            let mut g = grads(6);
            g[0][[3, 4]] = bad;
            let outcome = optimizer.step(set.tensors_mut(), &g).unwrap();
            assert!(outcome.is_skipped());
            assert_eq!(set, params_before);
            assert_eq!(optimizer.state_snapshot(), state_before);
            assert_eq!(optimizer.step_count(), 1);
        }
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut set = params();
        let mut optimizer = LAdamWBuilder::new(1e-3).build(&set).unwrap();
        let bad = vec![random_matrix(12, 10, 1), random_matrix(1, 9, 2)];
        let err = optimizer.step(set.tensors_mut(), &bad).unwrap_err();
        assert!(matches!(err, SftPackError::ShapeMismatch { .. }));
        assert_eq!(optimizer.step_count(), 0);
    }

    #[test]
    fn test_basis_stays_orthonormal_across_reprojections() {
        let mut set = params();
        let mut optimizer = LAdamWBuilder::new(1e-3)
            .with_rank(4)
            .with_reproject_interval(2)
            .build(&set)
            .unwrap();
        if let SecondMoment::LowRank { basis, .. } = &optimizer.arena().slots()[0].second {
            assert_orthonormal(basis);
        }
        for step in 0..7 {
            optimizer.step(set.tensors_mut(), &grads(10 + step)).unwrap();
            let SecondMoment::LowRank { basis, .. } = &optimizer.arena().slots()[0].second else {
                panic!("slot should stay compressed");
            };
            assert_orthonormal(basis);
        }
        assert!(optimizer.reprojection_due(1));
        assert!(!optimizer.reprojection_due(2));
        assert!(optimizer.reprojection_due(3));
    }

    #[test]
    fn test_orthonormalize_replaces_degenerate_columns() {
        // second column duplicates the first
        let basis = Array2::from_shape_vec((3, 2), vec![1.0, 1.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        let result = orthonormalize(basis, None);
        assert_orthonormal(&result);
        assert!((result[[0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_low_rank_estimate_tracks_rank_one_moment() {
        // outer-product gradient: G o G has rank one, so a rank-2 basis
        // recovers the second moment exactly after the first re-fit
        let u = Array2::from_shape_fn((6, 1), |(i, _)| 0.1 + i as f32 * 0.1);
        let w = Array2::from_shape_fn((1, 5), |(_, j)| 0.2 + j as f32 * 0.1);
        let grad = u.dot(&w);
        let mut set = ParameterSet::new().with("w", Array2::zeros((6, 5))).unwrap();
        let mut optimizer = LAdamWBuilder::new(1e-3)
            .with_rank(2)
            .with_clip_grad_norm(0.0)
            .build(&set)
            .unwrap();
        optimizer.step(set.tensors_mut(), &[grad.clone()]).unwrap();

        let estimate = optimizer.arena().slots()[0].second.estimate();
        let expected = grad.mapv(|g| g * g * (1.0 - 0.999));
        for (a, b) in estimate.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn test_restore_rejects_foreign_layout() {
        let set = params();
        let mut optimizer = LAdamWBuilder::new(1e-3).with_rank(4).build(&set).unwrap();
        let other = ParameterSet::new().with("w", Array2::zeros((2, 2))).unwrap();
        let foreign = LAdamWBuilder::new(1e-3).build(&other).unwrap().state_snapshot();
        assert!(optimizer.restore(foreign).is_err());

        let own = optimizer.state_snapshot();
        optimizer.restore(own).unwrap();
    }
}
