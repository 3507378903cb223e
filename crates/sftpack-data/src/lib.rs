//! Dataset handling and batch construction for sftpack.
//!
//! This crate provides:
//! - Pre-tokenized conversation examples and restartable example sources (JSONL, in-memory)
//! - Streaming best-fit multipack packing into fixed-length windows
//! - Per-token loss masks that supervise assistant turns only
//! - A prefetching loader that groups masked windows into micro-batches

#![warn(missing_docs)]

pub mod dataloader;
pub mod dataset;
pub mod masking;
pub mod packing;

pub use dataloader::*;
pub use dataset::*;
pub use masking::*;
pub use packing::*;
