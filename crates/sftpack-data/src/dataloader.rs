//! Prefetching loader that yields masked micro-batches of packed windows.
//!
//! Packing and masking run on a scoped producer thread that stays at most
//! `prefetch_depth` windows ahead of the consumer. The consumer callback runs
//! on the calling thread and sees micro-batches strictly in order, so the
//! next micro-batch is only handed out once the previous callback returned.

use std::ops::ControlFlow;

use crossbeam_channel::{bounded, Receiver};
use sftpack_core::{ExampleSource, Result, TrainingConfig};
use tracing::debug;

use crate::{Example, LossMask, LossMaskBuilder, PackedBatch, PackerConfig, PackingStats, SequencePacker};

/// A packed window with its supervision mask.
#[derive(Debug, Clone)]
pub struct MaskedWindow {
    /// The packed window.
    pub batch: PackedBatch,
    /// Supervision mask of the window.
    pub mask: LossMask,
}

/// Windows processed together in one forward/backward pass.
#[derive(Debug, Clone, Default)]
pub struct MicroBatch {
    /// Windows in packing order.
    pub windows: Vec<MaskedWindow>,
}

impl MicroBatch {
    /// Number of windows.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether the micro-batch holds no windows.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Supervised positions across all windows.
    pub fn supervised_tokens(&self) -> usize {
        self.windows.iter().map(|w| w.mask.supervised_count()).sum()
    }

    /// Positions across all windows.
    pub fn window_tokens(&self) -> usize {
        self.windows.iter().map(|w| w.batch.window_len).sum()
    }
}

/// Configuration for the DataLoader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLoaderConfig {
    /// Windows per micro-batch.
    pub batch_size: usize,
    /// Windows packed ahead of the consumer.
    pub prefetch_depth: usize,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            prefetch_depth: 2,
        }
    }
}

/// DataLoader that packs, masks and groups windows from an example source.
#[derive(Debug, Clone)]
pub struct PackedDataLoader {
    packer: SequencePacker,
    masks: LossMaskBuilder,
    config: DataLoaderConfig,
}

impl PackedDataLoader {
    /// Create a new loader.
    pub fn new(packer: SequencePacker, masks: LossMaskBuilder, config: DataLoaderConfig) -> Self {
        Self {
            packer,
            masks,
            config,
        }
    }

    /// Loader with the packing, masking and batching settings of a config.
    pub fn from_training_config(config: &TrainingConfig) -> Result<Self> {
        let packer = SequencePacker::new(PackerConfig::from_training_config(config))?;
        let masks = LossMaskBuilder::new(config.mask_users)
            .with_mask_segment_starts(config.mask_segment_starts);
        Ok(Self::new(
            packer,
            masks,
            DataLoaderConfig {
                batch_size: config.per_device_train_batch_size,
                prefetch_depth: config.prefetch_depth,
            },
        ))
    }

    /// The packer.
    pub fn packer(&self) -> &SequencePacker {
        &self.packer
    }

    /// The loader configuration.
    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    /// Pack one pass without masking or batching.
    pub fn dry_run<S>(&self, source: &S, epoch: usize) -> Result<PackingStats>
    where
        S: ExampleSource<Item = Example> + ?Sized,
    {
        self.dry_run_examples(source.open(epoch)?)
    }

    /// Pack an already opened example stream without masking or batching.
    pub fn dry_run_examples<I>(&self, examples: I) -> Result<PackingStats>
    where
        I: IntoIterator<Item = Result<Example>>,
    {
        let mut stream = self.packer.stream(examples);
        for window in stream.by_ref() {
            window?;
        }
        Ok(stream.stats().clone())
    }

    /// Feed every micro-batch of one pass to `consume`, in order.
    ///
    /// Stops early when `consume` returns `Break` or an error; the producer
    /// thread is released and joined before this returns.
    pub fn for_each_micro_batch<S, F>(
        &self,
        source: &S,
        epoch: usize,
        consume: F,
    ) -> Result<ControlFlow<()>>
    where
        S: ExampleSource<Item = Example> + ?Sized,
        F: FnMut(MicroBatch) -> Result<ControlFlow<()>>,
    {
        self.for_each_micro_batch_in(source.open(epoch)?, consume)
    }

    /// Like [`Self::for_each_micro_batch`], over an already opened stream.
    pub fn for_each_micro_batch_in<I, F>(&self, examples: I, consume: F) -> Result<ControlFlow<()>>
    where
        I: Iterator<Item = Result<Example>> + Send,
        F: FnMut(MicroBatch) -> Result<ControlFlow<()>>,
    {
        let (tx, rx) = bounded::<Result<MaskedWindow>>(self.config.prefetch_depth.max(1));
        let packer = &self.packer;
        let masks = self.masks;

        std::thread::scope(|scope| {
            scope.spawn(move || {
                for window in packer.stream(examples) {
                    let item = window.map(|batch| {
                        let mask = masks.build(&batch);
                        MaskedWindow { batch, mask }
                    });
                    let failed = item.is_err();
                    if tx.send(item).is_err() || failed {
                        return;
                    }
                }
            });
            drain(rx, self.config.batch_size.max(1), consume)
        })
    }
}

/// Group received windows into micro-batches. Owns the receiver so an early
/// return disconnects the producer.
fn drain<F>(rx: Receiver<Result<MaskedWindow>>, batch_size: usize, mut consume: F) -> Result<ControlFlow<()>>
where
    F: FnMut(MicroBatch) -> Result<ControlFlow<()>>,
{
    let mut current = MicroBatch::default();
    for window in rx.iter() {
        current.windows.push(window?);
        if current.len() == batch_size {
            let micro_batch = std::mem::take(&mut current);
            debug!(windows = micro_batch.len(), "Dispatching micro-batch");
            if consume(micro_batch)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
    }
    if !current.is_empty() {
        return consume(current);
    }
    Ok(ControlFlow::Continue(()))
}
