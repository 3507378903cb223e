//! Conversation examples and restartable example sources.
//!
//! Records are pre-tokenized conversations. A JSONL line looks like
//!
//! ```text
//! {"id": 7, "turns": [{"role": "user", "tokens": [1, 2, 3]}, {"role": "assistant", "tokens": [4, 5]}]}
//! ```
//!
//! `id` is optional and defaults to the record ordinal (blank lines skipped).

use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sftpack_core::{ExampleSource, Result, SftPackError};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt.
    System,
    /// User message.
    User,
    /// Assistant response (the supervised role).
    Assistant,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Who produced the turn.
    pub role: Role,
    /// Token ids of the turn.
    pub tokens: Vec<u32>,
}

impl Turn {
    /// Create a turn.
    pub fn new(role: Role, tokens: Vec<u32>) -> Self {
        Self { role, tokens }
    }
}

/// A tokenized conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    /// Stable example identifier.
    pub id: u64,
    /// Ordered turns.
    pub turns: Vec<Turn>,
}

impl Example {
    /// Create an example.
    pub fn new(id: u64, turns: Vec<Turn>) -> Self {
        Self { id, turns }
    }

    /// Total token count across all turns.
    pub fn total_tokens(&self) -> usize {
        self.turns.iter().map(|t| t.tokens.len()).sum()
    }

    /// Whether the example carries no tokens.
    pub fn is_empty(&self) -> bool {
        self.total_tokens() == 0
    }

    /// Token ids in turn order.
    pub fn token_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.turns.iter().flat_map(|t| t.tokens.iter().copied())
    }

    /// Role label of every token, in turn order.
    pub fn token_roles(&self) -> Vec<Role> {
        self.turns
            .iter()
            .flat_map(|t| std::iter::repeat(t.role).take(t.tokens.len()))
            .collect()
    }

    /// Keep only the first `max_tokens` tokens.
    ///
    /// Turn order is preserved; trailing turns are cut or dropped.
    pub fn truncated(&self, max_tokens: usize) -> Self {
        let mut remaining = max_tokens;
        let mut turns = Vec::new();
        for turn in &self.turns {
            if remaining == 0 {
                break;
            }
            let take = turn.tokens.len().min(remaining);
            if take > 0 {
                turns.push(Turn::new(turn.role, turn.tokens[..take].to_vec()));
            }
            remaining -= take;
        }
        Self { id: self.id, turns }
    }
}

/// JSONL record shape.
#[derive(Debug, Deserialize)]
struct ExampleRecord {
    #[serde(default)]
    id: Option<u64>,
    turns: Vec<Turn>,
}

/// Parse one JSONL line; `ordinal` supplies the id when the record has none.
pub fn parse_example_line(line: &str, ordinal: u64) -> serde_json::Result<Example> {
    let record: ExampleRecord = serde_json::from_str(line)?;
    Ok(Example {
        id: record.id.unwrap_or(ordinal),
        turns: record.turns,
    })
}

/// Per-epoch shuffle settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Shuffle {
    seed: u64,
}

fn shuffle_in_place<T>(items: &mut [T], seed: u64, epoch: usize) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
    items.shuffle(&mut rng);
}

/// Example source backed by a JSONL file.
///
/// The file is re-opened on every pass and the handle is released when the
/// pass iterator is dropped.
#[derive(Debug, Clone)]
pub struct JsonlExampleSource {
    name: String,
    path: PathBuf,
    shuffle: Option<Shuffle>,
}

impl JsonlExampleSource {
    /// Create a source for `path`, named after the file stem.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());
        Self {
            name,
            path,
            shuffle: None,
        }
    }

    /// Override the source name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Shuffle each pass with seed `seed + epoch`.
    ///
    /// Shuffled passes read the whole file before yielding.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = Some(Shuffle { seed });
        self
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_reader(&self) -> Result<BufReader<File>> {
        let file = File::open(&self.path).map_err(|e| {
            SftPackError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to open dataset file {}: {}", self.path.display(), e),
            ))
        })?;
        Ok(BufReader::new(file))
    }
}

/// Lazy line-by-line pass over a JSONL file.
struct JsonlPass {
    lines: std::iter::Enumerate<std::io::Lines<BufReader<File>>>,
    ordinal: u64,
}

impl Iterator for JsonlPass {
    type Item = Result<Example>;

    fn next(&mut self) -> Option<Self::Item> {
        for (line_num, line) in self.lines.by_ref() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    return Some(Err(SftPackError::Io(std::io::Error::new(
                        e.kind(),
                        format!("Failed to read line {}: {}", line_num + 1, e),
                    ))))
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let ordinal = self.ordinal;
            self.ordinal += 1;
            return Some(parse_example_line(&line, ordinal).map_err(|e| {
                SftPackError::Serialization(format!("line {}: {}", line_num + 1, e))
            }));
        }
        None
    }
}

impl ExampleSource for JsonlExampleSource {
    type Item = Example;

    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, epoch: usize) -> Result<Box<dyn Iterator<Item = Result<Example>> + Send + '_>> {
        let reader = self.open_reader()?;
        let pass = JsonlPass {
            lines: reader.lines().enumerate(),
            ordinal: 0,
        };
        match self.shuffle {
            None => Ok(Box::new(pass)),
            Some(Shuffle { seed }) => {
                let mut examples = pass.collect::<Result<Vec<_>>>()?;
                shuffle_in_place(&mut examples, seed, epoch);
                Ok(Box::new(examples.into_iter().map(Ok)))
            }
        }
    }
}

/// Example source over examples held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExampleSource {
    name: String,
    examples: Vec<Example>,
    shuffle: Option<Shuffle>,
}

impl InMemoryExampleSource {
    /// Create a source from examples.
    pub fn new(name: impl Into<String>, examples: Vec<Example>) -> Self {
        Self {
            name: name.into(),
            examples,
            shuffle: None,
        }
    }

    /// Shuffle each pass with seed `seed + epoch`.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = Some(Shuffle { seed });
        self
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Whether the source holds no examples.
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Examples in storage order.
    pub fn examples(&self) -> &[Example] {
        &self.examples
    }
}

impl ExampleSource for InMemoryExampleSource {
    type Item = Example;

    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, epoch: usize) -> Result<Box<dyn Iterator<Item = Result<Example>> + Send + '_>> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        if let Some(Shuffle { seed }) = self.shuffle {
            shuffle_in_place(&mut order, seed, epoch);
        }
        Ok(Box::new(
            order.into_iter().map(move |i| Ok(self.examples[i].clone())),
        ))
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.examples.len())
    }
}
