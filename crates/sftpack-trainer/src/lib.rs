//! Optimization and the training loop driver for sftpack.
//!
//! This crate provides:
//! - A named parameter store with decay / no-decay grouping
//! - [`LAdamW`], AdamW with a rank-compressed second moment (fused and
//!   reference update paths)
//! - Loss reduction over masked token losses, including quantile selection
//! - Online per-example reweighting behind the [`ReweightPolicy`] trait
//! - Training callbacks (tracing, JSONL metrics, progress bars)
//! - Checkpoint save/load with rotation
//! - [`TrainingLoop`], which drives a [`TrainableModel`] over packed windows
//!
//! ```ignore
//! use sftpack_trainer::{CheckpointManager, LoggingCallback, TrainingLoop};
//!
//! let mut trainer = TrainingLoop::new(config.clone())?
//!     .with_callback(LoggingCallback::new())
//!     .with_checkpoint_manager(CheckpointManager::from_training_config(&config)?);
//! let outcome = trainer.run(&mut model, &source)?;
//! ```

#![warn(missing_docs)]

pub mod callbacks;
pub mod checkpoint;
pub mod ladamw;
pub mod loss;
pub mod params;
pub mod retry;
pub mod reweight;
pub mod training_loop;

pub use callbacks::*;
pub use checkpoint::*;
pub use ladamw::*;
pub use loss::*;
pub use params::*;
pub use retry::*;
pub use reweight::*;
pub use training_loop::*;

pub use sftpack_core::{Result, SftPackError};
