//! Multipack sequence packing into fixed-length training windows.
//!
//! Packing concatenates several conversations into one window of exactly
//! `max_seq_length` tokens so little of each window is spent on padding:
//!
//! ```text
//! [ex1: 5 tokens][ex3: 2 tokens][PAD]      <- one padding position
//! [ex2: 8 tokens]                          <- full, emitted immediately
//! ```
//!
//! # Algorithm
//!
//! The packer is streaming best-fit. A small set of windows stays open; each
//! example goes to the open window whose remaining capacity is the smallest
//! that still holds it, ties going to the window opened first. An example
//! that fits nowhere opens a new window, closing the fullest open window
//! first when the open limit is reached. Examples are never split: one that
//! does not fit the current windows is deferred whole to a later window.
//!
//! Only examples longer than the window itself are cut (or dropped), per
//! [`LongExamplePolicy`].
//!
//! # Key Components
//!
//! - [`PackedBatch`]: one window with per-token kinds and segment origins
//! - [`SequencePacker`] / [`PackedStream`]: lazy best-fit packing
//! - Block diagonal attention masks and position ids reset per segment

use std::collections::VecDeque;

use sftpack_core::{EmptyExamplePolicy, LongExamplePolicy, Result, SftPackError, TrainingConfig};
use tracing::{debug, warn};

use crate::{Example, Role};

/// Error type for packing operations.
#[derive(Debug, thiserror::Error)]
pub enum PackingError {
    /// An example carried no tokens.
    #[error("Example {example_id} has no tokens")]
    EmptyExample {
        /// Offending example.
        example_id: u64,
    },
    /// An example does not fit in a single window.
    #[error("Example {example_id} has {len} tokens but a window holds {max}")]
    ExampleTooLong {
        /// Offending example.
        example_id: u64,
        /// Token count of the example.
        len: usize,
        /// Tokens a window can hold for one example.
        max: usize,
    },
    /// The packer configuration cannot produce valid windows.
    #[error("Invalid packing window: {0}")]
    InvalidWindow(String),
}

impl From<PackingError> for SftPackError {
    fn from(err: PackingError) -> Self {
        SftPackError::Packing(err.to_string())
    }
}

/// What a position of a packed window holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// A token of a conversation turn.
    Content(Role),
    /// Segment separator.
    Separator,
    /// Tail padding.
    Padding,
}

impl TokenKind {
    /// Role of a content token.
    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Content(role) => Some(*role),
            Self::Separator | Self::Padding => None,
        }
    }
}

/// Origin of one packed segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Example the tokens came from.
    pub example_id: u64,
    /// Offset of the first token in the window.
    pub start: usize,
    /// Number of example tokens (separator excluded).
    pub len: usize,
    /// Whether the example was cut to fit.
    pub truncated: bool,
}

impl Segment {
    /// Offset one past the last example token.
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// A packed window of exactly `window_len` tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedBatch {
    /// Token ids, padded at the tail.
    pub input_ids: Vec<u32>,
    /// Position ids (reset for each segment, 0 in padding).
    pub position_ids: Vec<u32>,
    /// Kind of every position.
    pub token_kinds: Vec<TokenKind>,
    /// Segments in placement order.
    pub segments: Vec<Segment>,
    /// Cumulative segment span lengths, separators included
    /// (length: num_sequences + 1).
    pub cu_seqlens: Vec<u32>,
    /// Tokens before the padding tail.
    pub content_len: usize,
    /// Window length.
    pub window_len: usize,
}

impl PackedBatch {
    /// Get the total number of positions in this window.
    pub fn total_tokens(&self) -> usize {
        self.input_ids.len()
    }

    /// Number of segments.
    pub fn num_sequences(&self) -> usize {
        self.segments.len()
    }

    /// Padding positions at the tail.
    pub fn padding_len(&self) -> usize {
        self.window_len - self.content_len
    }

    /// Positions labelled as assistant content.
    pub fn assistant_token_count(&self) -> usize {
        self.token_kinds
            .iter()
            .filter(|k| **k == TokenKind::Content(Role::Assistant))
            .count()
    }

    /// Segment span lengths, separators included.
    pub fn seq_lengths(&self) -> Vec<u32> {
        self.cu_seqlens.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Index of the last position of each segment span.
    pub fn sequence_boundaries(&self) -> Vec<usize> {
        self.cu_seqlens
            .windows(2)
            .filter(|w| w[1] > w[0])
            .map(|w| w[1] as usize - 1)
            .collect()
    }

    /// Build a block diagonal causal attention mask.
    ///
    /// Returns a row-major `window_len x window_len` mask where `mask[i][j]`
    /// is 0.0 if token i can attend to token j and -inf otherwise. Each
    /// segment attends causally within itself; padding positions attend
    /// only to themselves.
    pub fn build_attention_mask(&self) -> Vec<f32> {
        let n = self.total_tokens();
        let mut mask = vec![f32::NEG_INFINITY; n * n];

        let mut offset = 0usize;
        for len in self.seq_lengths() {
            let len = len as usize;
            for i in 0..len {
                let row_start = (offset + i) * n + offset;
                mask[row_start..row_start + i + 1].fill(0.0);
            }
            offset += len;
        }
        for i in self.content_len..n {
            mask[i * n + i] = 0.0;
        }

        mask
    }
}

/// Sequence packer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PackerConfig {
    /// Length of every window.
    pub max_seq_length: usize,
    /// Windows kept open at once.
    pub max_open_windows: usize,
    /// Token appended after every segment.
    pub separator_token: Option<u32>,
    /// Token written into padding positions.
    pub pad_token_id: u32,
    /// Handling of examples longer than a window.
    pub long_example_policy: LongExamplePolicy,
    /// Handling of examples with no tokens.
    pub empty_example_policy: EmptyExamplePolicy,
    /// Emit one example per window (packing disabled).
    pub one_example_per_window: bool,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            max_seq_length: 2048,
            max_open_windows: 4,
            separator_token: None,
            pad_token_id: 0,
            long_example_policy: LongExamplePolicy::Truncate,
            empty_example_policy: EmptyExamplePolicy::Fail,
            one_example_per_window: false,
        }
    }
}

impl PackerConfig {
    /// Create a config with the given window length.
    pub fn with_max_seq_length(max_seq_length: usize) -> Self {
        Self {
            max_seq_length,
            ..Default::default()
        }
    }

    /// Packer settings carried by a training config.
    pub fn from_training_config(config: &TrainingConfig) -> Self {
        Self {
            max_seq_length: config.max_seq_length,
            max_open_windows: config.max_open_windows,
            separator_token: config.separator_token,
            pad_token_id: config.pad_token_id,
            long_example_policy: config.long_example_policy,
            empty_example_policy: config.empty_example_policy,
            one_example_per_window: !config.use_multipack,
        }
    }

    /// Append `token` after every segment.
    pub fn with_separator(mut self, token: u32) -> Self {
        self.separator_token = Some(token);
        self
    }

    /// Set the padding token.
    pub fn with_pad_token_id(mut self, token: u32) -> Self {
        self.pad_token_id = token;
        self
    }

    /// Set how many windows stay open.
    pub fn with_max_open_windows(mut self, n: usize) -> Self {
        self.max_open_windows = n;
        self
    }

    /// Set the long-example policy.
    pub fn with_long_example_policy(mut self, policy: LongExamplePolicy) -> Self {
        self.long_example_policy = policy;
        self
    }

    /// Set the empty-example policy.
    pub fn with_empty_example_policy(mut self, policy: EmptyExamplePolicy) -> Self {
        self.empty_example_policy = policy;
        self
    }

    /// Disable multipack.
    pub fn one_example_per_window(mut self, enabled: bool) -> Self {
        self.one_example_per_window = enabled;
        self
    }

    fn separator_len(&self) -> usize {
        usize::from(self.separator_token.is_some())
    }

    /// Most example tokens one window can hold.
    pub fn example_capacity(&self) -> usize {
        self.max_seq_length - self.separator_len()
    }

    fn validate(&self) -> std::result::Result<(), PackingError> {
        if self.max_seq_length <= self.separator_len() {
            return Err(PackingError::InvalidWindow(format!(
                "max_seq_length {} leaves no room for example tokens",
                self.max_seq_length
            )));
        }
        if self.max_open_windows == 0 {
            return Err(PackingError::InvalidWindow(
                "max_open_windows must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Statistics about packing efficiency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackingStats {
    /// Content tokens (separators included) across all windows.
    pub total_tokens: usize,
    /// Total capacity (windows * max_seq_length).
    pub total_capacity: usize,
    /// Number of windows created.
    pub num_windows: usize,
    /// Number of segments packed.
    pub num_sequences: usize,
    /// Packing efficiency (tokens / capacity).
    pub efficiency: f64,
    /// Average segments per window.
    pub avg_sequences_per_window: f64,
    /// Maximum segments in a single window.
    pub max_sequences_per_window: usize,
    /// Over-long examples dropped.
    pub dropped: usize,
    /// Over-long examples truncated.
    pub truncated: usize,
    /// Empty examples skipped.
    pub skipped_empty: usize,
}

impl PackingStats {
    /// Calculate stats from windows.
    pub fn from_batches(batches: &[PackedBatch]) -> Self {
        let mut stats = Self::default();
        for batch in batches {
            stats.record(batch);
        }
        stats
    }

    /// Account for one emitted window.
    pub fn record(&mut self, batch: &PackedBatch) {
        self.total_tokens += batch.content_len;
        self.total_capacity += batch.window_len;
        self.num_windows += 1;
        self.num_sequences += batch.num_sequences();
        self.max_sequences_per_window = self.max_sequences_per_window.max(batch.num_sequences());
        self.efficiency = self.total_tokens as f64 / self.total_capacity.max(1) as f64;
        self.avg_sequences_per_window = self.num_sequences as f64 / self.num_windows as f64;
    }

    /// Pretty print stats.
    pub fn summary(&self) -> String {
        format!(
            "Packing: {} seqs → {} windows, {:.1}% efficiency, avg {:.1} seqs/window \
             ({} truncated, {} dropped, {} empty skipped)",
            self.num_sequences,
            self.num_windows,
            self.efficiency * 100.0,
            self.avg_sequences_per_window,
            self.truncated,
            self.dropped,
            self.skipped_empty
        )
    }
}

/// A window still accepting examples (internal use).
#[derive(Default)]
struct OpenWindow {
    examples: Vec<(Example, bool)>,
    used: usize,
}

impl OpenWindow {
    fn add(&mut self, example: Example, truncated: bool, cost: usize) {
        self.used += cost;
        self.examples.push((example, truncated));
    }
}

/// Sequence packer for creating packed windows.
#[derive(Debug, Clone)]
pub struct SequencePacker {
    config: PackerConfig,
}

impl SequencePacker {
    /// Create a new sequence packer.
    ///
    /// # Errors
    ///
    /// Returns [`SftPackError::Packing`] if the window cannot hold a token.
    pub fn new(config: PackerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Get the configuration.
    pub fn config(&self) -> &PackerConfig {
        &self.config
    }

    /// Pack a stream of examples lazily.
    pub fn stream<I>(&self, examples: I) -> PackedStream<I::IntoIter>
    where
        I: IntoIterator<Item = Result<Example>>,
    {
        PackedStream {
            config: self.config.clone(),
            examples: examples.into_iter(),
            open: Vec::new(),
            ready: VecDeque::new(),
            stats: PackingStats::default(),
            exhausted: false,
        }
    }

    /// Pack examples into windows.
    pub fn pack(&self, examples: &[Example]) -> Result<Vec<PackedBatch>> {
        Ok(self.pack_with_stats(examples)?.0)
    }

    /// Pack examples into windows and return stats.
    pub fn pack_with_stats(&self, examples: &[Example]) -> Result<(Vec<PackedBatch>, PackingStats)> {
        let mut stream = self.stream(examples.iter().cloned().map(Ok));
        let batches = stream.by_ref().collect::<Result<Vec<_>>>()?;
        Ok((batches, stream.stats().clone()))
    }
}

/// Lazy best-fit packing over an example stream.
pub struct PackedStream<I> {
    config: PackerConfig,
    examples: I,
    /// Open windows in opening order.
    open: Vec<OpenWindow>,
    ready: VecDeque<PackedBatch>,
    stats: PackingStats,
    exhausted: bool,
}

impl<I> PackedStream<I> {
    /// Statistics of the windows emitted so far.
    pub fn stats(&self) -> &PackingStats {
        &self.stats
    }

    fn place(&mut self, example: Example) -> std::result::Result<(), PackingError> {
        let window_len = self.config.max_seq_length;

        if example.is_empty() {
            return match self.config.empty_example_policy {
                EmptyExamplePolicy::Fail => Err(PackingError::EmptyExample {
                    example_id: example.id,
                }),
                EmptyExamplePolicy::Skip => {
                    warn!(example_id = example.id, "Skipping example with no tokens");
                    self.stats.skipped_empty += 1;
                    Ok(())
                }
            };
        }

        let capacity = self.config.example_capacity();
        let len = example.total_tokens();
        let (example, truncated) = if len > capacity {
            match self.config.long_example_policy {
                LongExamplePolicy::Truncate => {
                    debug!(example_id = example.id, len, capacity, "Truncating example");
                    self.stats.truncated += 1;
                    (example.truncated(capacity), true)
                }
                LongExamplePolicy::Drop => {
                    let err = PackingError::ExampleTooLong {
                        example_id: example.id,
                        len,
                        max: capacity,
                    };
                    warn!("Dropping example: {err}");
                    self.stats.dropped += 1;
                    return Ok(());
                }
            }
        } else {
            (example, false)
        };
        let cost = example.total_tokens() + self.config.separator_len();

        if self.config.one_example_per_window {
            let mut window = OpenWindow::default();
            window.add(example, truncated, cost);
            self.emit(window);
            return Ok(());
        }

        // Best fit: smallest sufficient remaining capacity, earliest on ties.
        let best = self
            .open
            .iter()
            .enumerate()
            .filter(|(_, w)| window_len - w.used >= cost)
            .min_by_key(|(_, w)| window_len - w.used)
            .map(|(i, _)| i);

        let index = match best {
            Some(index) => index,
            None => {
                if self.open.len() >= self.config.max_open_windows {
                    let fullest = self
                        .open
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, w)| window_len - w.used)
                        .map(|(i, _)| i);
                    if let Some(i) = fullest {
                        let window = self.open.remove(i);
                        self.emit(window);
                    }
                }
                self.open.push(OpenWindow::default());
                self.open.len() - 1
            }
        };

        self.open[index].add(example, truncated, cost);
        if self.open[index].used == window_len {
            let window = self.open.remove(index);
            self.emit(window);
        }
        Ok(())
    }

    fn emit(&mut self, window: OpenWindow) {
        let batch = build_window(&self.config, window);
        debug!(
            segments = batch.num_sequences(),
            content = batch.content_len,
            padding = batch.padding_len(),
            "Emitting packed window"
        );
        self.stats.record(&batch);
        self.ready.push_back(batch);
    }
}

impl<I> Iterator for PackedStream<I>
where
    I: Iterator<Item = Result<Example>>,
{
    type Item = Result<PackedBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(batch) = self.ready.pop_front() {
                return Some(Ok(batch));
            }
            if self.exhausted {
                if self.open.is_empty() {
                    return None;
                }
                for window in std::mem::take(&mut self.open) {
                    self.emit(window);
                }
                continue;
            }
            match self.examples.next() {
                None => self.exhausted = true,
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(example)) => {
                    if let Err(e) = self.place(example) {
                        return Some(Err(e.into()));
                    }
                }
            }
        }
    }
}

fn build_window(config: &PackerConfig, window: OpenWindow) -> PackedBatch {
    let window_len = config.max_seq_length;
    let mut input_ids = Vec::with_capacity(window_len);
    let mut position_ids = Vec::with_capacity(window_len);
    let mut token_kinds = Vec::with_capacity(window_len);
    let mut segments = Vec::with_capacity(window.examples.len());
    let mut cu_seqlens = Vec::with_capacity(window.examples.len() + 1);
    cu_seqlens.push(0u32);

    for (example, truncated) in window.examples {
        let start = input_ids.len();
        for turn in &example.turns {
            for &token in &turn.tokens {
                position_ids.push((input_ids.len() - start) as u32);
                input_ids.push(token);
                token_kinds.push(TokenKind::Content(turn.role));
            }
        }
        let len = input_ids.len() - start;
        if let Some(separator) = config.separator_token {
            position_ids.push(len as u32);
            input_ids.push(separator);
            token_kinds.push(TokenKind::Separator);
        }
        segments.push(Segment {
            example_id: example.id,
            start,
            len,
            truncated,
        });
        cu_seqlens.push(input_ids.len() as u32);
    }

    let content_len = input_ids.len();
    debug_assert!(content_len <= window_len);
    input_ids.resize(window_len, config.pad_token_id);
    position_ids.resize(window_len, 0);
    token_kinds.resize(window_len, TokenKind::Padding);

    PackedBatch {
        input_ids,
        position_ids,
        token_kinds,
        segments,
        cu_seqlens,
        content_len,
        window_len,
    }
}
