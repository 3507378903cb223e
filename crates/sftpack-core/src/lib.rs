//! Core types, traits, and configuration for sftpack.
//!
//! This crate provides the foundational abstractions shared by the data and
//! trainer crates:
//!
//! - The flat training configuration and its validation
//! - Error handling infrastructure
//! - Learning rate schedulers, including warmup-stable-decay
//! - Trait definitions for example sources, optimizers and callbacks

#![warn(missing_docs)]

mod config;
mod error;
pub mod scheduler;
mod traits;
mod types;

pub use config::*;
pub use error::*;
pub use scheduler::{
    wsd_boundaries, wsd_rate, LearningRateScheduler, SchedulePhase, ScheduleState,
    SchedulerBuilder,
};
pub use traits::*;
pub use types::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{Result, SftPackError};
    pub use crate::scheduler::{LearningRateScheduler, SchedulerBuilder};
    pub use crate::traits::*;
    pub use crate::types::*;
}
