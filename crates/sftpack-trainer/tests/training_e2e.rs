//! End-to-end training integration tests.
//!
//! A small regression model over token embeddings stands in for a language
//! model, so these tests exercise the complete pipeline:
//! - Packing → masking → loss reduction → reweighting
//! - Gradient accumulation and the LAdamW update (low-rank and dense slots)
//! - Checkpoint cadence, stop and resume

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ndarray::Array2;
use sftpack_core::{
    CheckpointCadence, EvalMetrics, ExampleSource, ReweightingType, Result, SchedulePhase,
    SftPackError, StepMetrics, TrainingCallback, TrainingConfig,
};
use sftpack_data::{Example, InMemoryExampleSource, PackedBatch, PackedDataLoader, Role, Turn};
use sftpack_trainer::{
    CheckpointManager, ParameterSet, RetryPolicy, StopSignal, TrainOutcome, TrainableModel,
    TrainingLoop,
};
use tempfile::TempDir;

const VOCAB: usize = 16;
const DIM: usize = 8;

/// Predicts `token_t / VOCAB` from the embedding of the previous token.
struct ToyModel {
    params: ParameterSet,
    backward_calls: usize,
    poison_call: Option<usize>,
}

impl ToyModel {
    fn new() -> Self {
        let embed = Array2::from_shape_fn((VOCAB, DIM), |(i, j)| {
            ((i * 7 + j * 3) % 11) as f32 / 55.0 - 0.1
        });
        let head = Array2::from_shape_fn((DIM, 1), |(j, _)| ((j * 5) % 7) as f32 / 35.0 - 0.1);
        let params = ParameterSet::new()
            .with("embed.weight", embed)
            .unwrap()
            .with("head.weight", head)
            .unwrap();
        Self {
            params,
            backward_calls: 0,
            poison_call: None,
        }
    }

    /// Make the `call`-th backward pass (1-based) return a NaN gradient.
    fn poisoned_at(call: usize) -> Self {
        Self {
            poison_call: Some(call),
            ..Self::new()
        }
    }

    fn predecessor(batch: &PackedBatch, t: usize) -> usize {
        if batch.position_ids[t] == 0 {
            0
        } else {
            batch.input_ids[t - 1] as usize % VOCAB
        }
    }

    fn error(&self, batch: &PackedBatch, t: usize) -> (usize, f32) {
        let prev = Self::predecessor(batch, t);
        let embed = &self.params.tensors()[0];
        let head = &self.params.tensors()[1];
        let prediction = embed.row(prev).dot(&head.column(0));
        let target = batch.input_ids[t] as f32 / VOCAB as f32;
        (prev, prediction - target)
    }
}

impl TrainableModel for ToyModel {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn forward(&mut self, batch: &PackedBatch) -> Result<Vec<f32>> {
        Ok((0..batch.window_len)
            .map(|t| {
                let (_, e) = self.error(batch, t);
                e * e
            })
            .collect())
    }

    fn backward(&mut self, batch: &PackedBatch, token_weights: &[f32]) -> Result<Vec<Array2<f32>>> {
        self.backward_calls += 1;
        let mut grads = self.params.zeros_like();
        for (t, &w) in token_weights.iter().enumerate() {
            if w == 0.0 {
                continue;
            }
            let (prev, e) = self.error(batch, t);
            let d = 2.0 * e * w;
            let embed_row = self.params.tensors()[0].row(prev).to_owned();
            let head_col = self.params.tensors()[1].column(0).to_owned();
            grads[0].row_mut(prev).scaled_add(d, &head_col);
            grads[1].column_mut(0).scaled_add(d, &embed_row);
        }
        if self.poison_call == Some(self.backward_calls) {
            grads[1].fill(f32::NAN);
        }
        Ok(grads)
    }
}

fn dataset(n: usize) -> InMemoryExampleSource {
    let examples = (0..n)
        .map(|i| {
            Example::new(
                i as u64,
                vec![
                    Turn::new(Role::User, vec![1, 2 + (i % 3) as u32]),
                    Turn::new(
                        Role::Assistant,
                        (0..5).map(|j| ((i + j) % 12 + 3) as u32).collect(),
                    ),
                ],
            )
        })
        .collect();
    InMemoryExampleSource::new("train", examples)
}

fn config(output_dir: &Path) -> TrainingConfig {
    TrainingConfig {
        learning_rate: 0.02,
        warmup_ratio: 0.1,
        cooldown_ratio: 0.2,
        max_seq_length: 16,
        per_device_train_batch_size: 1,
        gradient_accumulation_steps: 1,
        num_train_epochs: 2,
        ladamw_rank: 2,
        reproject_interval: 3,
        weight_decay: 0.0,
        logging_steps: 1,
        prefetch_depth: 2,
        io_retries: 1,
        output_dir: output_dir.display().to_string(),
        ..Default::default()
    }
}

#[derive(Clone, Default)]
struct Recorder {
    steps: Arc<Mutex<Vec<StepMetrics>>>,
    evals: Arc<Mutex<Vec<(usize, f64)>>>,
    stop_at: Option<(usize, StopSignal)>,
}

impl TrainingCallback for Recorder {
    fn on_step_end(&mut self, metrics: &StepMetrics) {
        self.steps.lock().unwrap().push(metrics.clone());
        if let Some((step, signal)) = &self.stop_at {
            if metrics.step == *step {
                signal.request_stop();
            }
        }
    }

    fn on_evaluate(&mut self, step: usize, metrics: &EvalMetrics) {
        self.evals.lock().unwrap().push((step, metrics.loss));
    }
}

fn max_abs_diff(a: &ParameterSet, b: &ParameterSet) -> f32 {
    a.tensors()
        .iter()
        .zip(b.tensors())
        .flat_map(|(x, y)| x.iter().zip(y.iter()).map(|(p, q)| (p - q).abs()))
        .fold(0.0, f32::max)
}

#[test]
fn test_training_completes_and_improves_eval_loss() {
    let temp_dir = TempDir::new().unwrap();
    let config = TrainingConfig {
        eval_per_steps: Some(5),
        ..config(temp_dir.path())
    };
    let manager = CheckpointManager::from_training_config(&config).unwrap();
    let recorder = Recorder::default();

    let mut trainer = TrainingLoop::new(config)
        .unwrap()
        .with_callback(recorder.clone())
        .with_checkpoint_manager(manager.clone())
        .with_eval_source(dataset(12));
    let mut model = ToyModel::new();

    let before = trainer.evaluate(&mut model).unwrap();
    let outcome = trainer.run(&mut model, &dataset(12)).unwrap();
    let after = trainer.evaluate(&mut model).unwrap();

    let summary = outcome.summary().clone();
    assert!(matches!(outcome, TrainOutcome::Completed(_)));
    assert!(summary.total_steps > 0);
    assert_eq!(summary.state.step, summary.total_steps);
    assert_eq!(summary.state.epoch, 2);
    assert_eq!(summary.skipped_steps, 0);
    assert!(after.loss < before.loss, "{} !< {}", after.loss, before.loss);
    assert!(after.custom.contains_key("train"));

    let steps: Vec<usize> = recorder.steps.lock().unwrap().iter().map(|m| m.step).collect();
    assert_eq!(steps, (1..=summary.total_steps).collect::<Vec<_>>());
    for metrics in recorder.steps.lock().unwrap().iter() {
        assert!(metrics.loss.is_finite());
        assert!(metrics.effective_tokens_pct > 0.0 && metrics.effective_tokens_pct <= 100.0);
    }

    // every 5 steps, plus the last evaluation at the terminal step
    let evals = recorder.evals.lock().unwrap().clone();
    assert_ne!(summary.total_steps % 5, 0);
    assert_eq!(evals.len(), summary.total_steps / 5 + 1);
    assert_eq!(evals.last().unwrap().0, summary.total_steps);

    let last = manager.load_latest().unwrap().unwrap();
    assert_eq!(last.training.step, summary.total_steps);
    assert!(manager
        .checkpoint_dir()
        .join(format!("step_{}", summary.total_steps))
        .exists());
    assert!(max_abs_diff(&last.parameters, model.parameters()) < 1e-7);
    let best = manager.load_best().unwrap().unwrap();
    assert_eq!(best.metadata.best_eval_loss, trainer.best_eval_loss());
    assert_eq!(summary.best_eval_loss, trainer.best_eval_loss());
}

#[test]
fn test_non_finite_gradient_skips_update_but_advances_schedule() {
    let temp_dir = TempDir::new().unwrap();
    let config = TrainingConfig {
        max_train_steps: Some(6),
        checkpointing_steps: Some(CheckpointCadence::Steps(1)),
        max_checkpoints: None,
        ..config(temp_dir.path())
    };
    let manager = CheckpointManager::from_training_config(&config).unwrap();
    let recorder = Recorder::default();
    let mut trainer = TrainingLoop::new(config)
        .unwrap()
        .with_callback(recorder.clone())
        .with_checkpoint_manager(manager.clone());

    // batch size 1, no accumulation: backward call 5 belongs to step 5
    let mut model = ToyModel::poisoned_at(5);
    let outcome = trainer.run(&mut model, &dataset(12)).unwrap();
    assert_eq!(outcome.summary().skipped_steps, 1);
    assert_eq!(outcome.summary().state.step, 6);

    let load = |step: usize| {
        CheckpointManager::load_checkpoint(manager.checkpoint_dir().join(format!("step_{step}")))
            .unwrap()
    };
    let (s4, s5, s6) = (load(4), load(5), load(6));

    assert_eq!(s5.parameters, s4.parameters);
    assert_eq!(s5.optimizer.step, 4);
    assert_eq!(s5.optimizer.arena, s4.optimizer.arena);
    assert_eq!(s4.schedule.step, 4);
    assert_eq!(s5.schedule.step, 5);
    assert_eq!(s5.training.step, 5);

    assert_eq!(s6.optimizer.step, 5);
    assert_ne!(s6.parameters, s5.parameters);

    let metrics = recorder.steps.lock().unwrap().clone();
    assert_eq!(metrics[4].step, 5);
    assert_eq!(metrics[4].grad_norm, None);
    assert_eq!(metrics[4].skipped_steps, 1);
    assert!(metrics[5].grad_norm.is_some());
}

#[test]
fn test_stop_and_resume_matches_uninterrupted_run() {
    let full_dir = TempDir::new().unwrap();
    let mut full_model = ToyModel::new();
    let full = TrainingLoop::new(config(full_dir.path()))
        .unwrap()
        .run(&mut full_model, &dataset(12))
        .unwrap();

    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let manager = CheckpointManager::from_training_config(&config).unwrap();
    let stop = StopSignal::new();
    let recorder = Recorder {
        stop_at: Some((3, stop.clone())),
        ..Default::default()
    };
    let mut model = ToyModel::new();
    let stopped = TrainingLoop::new(config.clone())
        .unwrap()
        .with_stop_signal(stop)
        .with_callback(recorder)
        .with_checkpoint_manager(manager.clone())
        .run(&mut model, &dataset(12))
        .unwrap();
    assert!(stopped.is_stopped());
    assert_eq!(stopped.summary().state.step, 3);

    let snapshot = manager.load_latest().unwrap().unwrap();
    assert_eq!(snapshot.training.step, 3);
    assert_eq!(snapshot.training.micro_batches_in_epoch, 3);

    let mut resumed_model = ToyModel::new();
    let mut trainer = TrainingLoop::new(config).unwrap();
    trainer.resume(snapshot).unwrap();
    let resumed = trainer.run(&mut resumed_model, &dataset(12)).unwrap();

    assert!(!resumed.is_stopped());
    assert_eq!(resumed.summary().state, full.summary().state);
    let diff = max_abs_diff(resumed_model.parameters(), full_model.parameters());
    assert!(diff < 1e-6, "resumed run diverged by {diff}");
}

#[test]
fn test_resume_from_checkpoint_at_epoch_boundary() {
    let dir = TempDir::new().unwrap();
    let config = TrainingConfig {
        checkpointing_steps: Some(CheckpointCadence::Steps(6)),
        max_checkpoints: None,
        ..config(dir.path())
    };
    let manager = CheckpointManager::from_training_config(&config).unwrap();
    let mut full_model = ToyModel::new();
    let full = TrainingLoop::new(config.clone())
        .unwrap()
        .with_checkpoint_manager(manager.clone())
        .run(&mut full_model, &dataset(12))
        .unwrap();
    assert_eq!(full.summary().total_steps, 12);

    // written by the last micro-batch of epoch 0, before the epoch closed
    let snapshot =
        CheckpointManager::load_checkpoint(manager.checkpoint_dir().join("step_6")).unwrap();
    assert_eq!(snapshot.training.epoch, 0);
    assert_eq!(snapshot.training.micro_batches_in_epoch, 6);

    let mut model = ToyModel::new();
    let mut trainer = TrainingLoop::new(config).unwrap();
    trainer.resume(snapshot).unwrap();
    let resumed = trainer.run(&mut model, &dataset(12)).unwrap();

    assert!(matches!(resumed, TrainOutcome::Completed(_)));
    assert_eq!(resumed.summary().state.step, 12);
    assert_eq!(resumed.summary().state, full.summary().state);
    let diff = max_abs_diff(model.parameters(), full_model.parameters());
    assert!(diff < 1e-6, "resumed run diverged by {diff}");
}

fn mixed_lengths(n: usize) -> Vec<Example> {
    (0..n)
        .map(|i| {
            let assistant = 1 + (i * 5) % 7;
            Example::new(
                i as u64,
                vec![
                    Turn::new(Role::User, vec![1]),
                    Turn::new(
                        Role::Assistant,
                        (0..assistant).map(|j| ((i + j) % 12 + 3) as u32).collect(),
                    ),
                ],
            )
        })
        .collect()
}

#[test]
fn test_shuffled_epochs_with_different_window_counts_reach_terminal_step() {
    let dir = TempDir::new().unwrap();
    let config = TrainingConfig {
        max_seq_length: 10,
        ..config(dir.path())
    };
    let loader = PackedDataLoader::from_training_config(&config).unwrap();
    let windows = |source: &InMemoryExampleSource, epoch: usize| {
        loader.dry_run(source, epoch).unwrap().num_windows
    };

    // find a shuffle whose two epoch orders pack into different window counts
    let source = (0..256)
        .map(|seed| InMemoryExampleSource::new("train", mixed_lengths(16)).with_shuffle(seed))
        .find(|source| windows(source, 0) != windows(source, 1))
        .expect("no seed packs the two epochs differently");
    let expected = windows(&source, 0) + windows(&source, 1);

    let recorder = Recorder::default();
    let mut model = ToyModel::new();
    let outcome = TrainingLoop::new(config)
        .unwrap()
        .with_callback(recorder.clone())
        .run(&mut model, &source)
        .unwrap();

    let summary = outcome.summary();
    assert!(matches!(outcome, TrainOutcome::Completed(_)));
    assert_eq!(summary.total_steps, expected);
    assert_eq!(summary.state.step, summary.total_steps);
    assert_eq!(summary.state.epoch, 2);

    let last = recorder.steps.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.step, expected);
    assert_eq!(last.phase, SchedulePhase::Cooldown);
}

#[test]
fn test_fused_and_reference_paths_agree() {
    let run = |no_fused: bool| {
        let dir = TempDir::new().unwrap();
        let config = TrainingConfig {
            no_fused,
            max_train_steps: Some(8),
            ..config(dir.path())
        };
        let mut model = ToyModel::new();
        TrainingLoop::new(config)
            .unwrap()
            .run(&mut model, &dataset(12))
            .unwrap();
        model.params
    };

    let fused = run(false);
    let reference = run(true);
    let diff = max_abs_diff(&fused, &reference);
    assert!(diff < 1e-5, "fused and reference paths differ by {diff}");
}

#[test]
fn test_reweight_warmup_then_freeze() {
    let dir = TempDir::new().unwrap();
    let config = TrainingConfig {
        reweighting: ReweightingType::Loss,
        reweight_warmup_steps: 3,
        per_device_train_batch_size: 2,
        ..config(dir.path())
    };
    let weight_cap = config.weight_cap;
    let recorder = Recorder::default();
    let mut trainer = TrainingLoop::new(config)
        .unwrap()
        .with_callback(recorder.clone());
    let mut model = ToyModel::new();
    trainer.run(&mut model, &dataset(12)).unwrap();

    let metrics = recorder.steps.lock().unwrap().clone();
    let alphas: Vec<f64> = metrics.iter().map(|m| m.reweight.alpha).collect();
    assert!(alphas.len() > 4);
    for (step, expected) in [0.0, 1.0 / 3.0, 2.0 / 3.0].iter().enumerate() {
        assert!((alphas[step] - expected).abs() < 1e-12, "step {}: {}", step + 1, alphas[step]);
    }
    assert!(alphas[3..].iter().all(|&a| a == 1.0));

    for m in &metrics {
        assert!(m.reweight.min_weight >= 0.0);
        assert!(m.reweight.max_weight <= weight_cap);
    }
    assert!(trainer.reweighter().state().frozen_mean.is_some());
}

#[test]
fn test_epoch_checkpoints_and_latest_marker() {
    let dir = TempDir::new().unwrap();
    let config = TrainingConfig {
        checkpointing_steps: Some(CheckpointCadence::EVERY_EPOCH),
        ..config(dir.path())
    };
    let manager = CheckpointManager::from_training_config(&config).unwrap();
    let mut model = ToyModel::new();
    TrainingLoop::new(config)
        .unwrap()
        .with_checkpoint_manager(manager.clone())
        .run(&mut model, &dataset(12))
        .unwrap();

    assert!(manager.checkpoint_dir().join("epoch_0").exists());
    assert!(manager.checkpoint_dir().join("epoch_1").exists());
    let latest = manager.load_latest().unwrap().unwrap();
    assert_eq!(latest.training.epoch, 2);
    assert!(max_abs_diff(&latest.parameters, model.parameters()) < 1e-7);
}

struct UnavailableSource;

impl ExampleSource for UnavailableSource {
    type Item = Example;

    fn name(&self) -> &str {
        "unavailable"
    }

    fn open(&self, _epoch: usize) -> Result<Box<dyn Iterator<Item = Result<Example>> + Send + '_>> {
        Err(SftPackError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "dataset mount missing",
        )))
    }
}

#[test]
fn test_dataset_open_failure_surfaces_as_resource_error() {
    let dir = TempDir::new().unwrap();
    let mut trainer = TrainingLoop::new(config(dir.path()))
        .unwrap()
        .with_retry_policy(RetryPolicy::new(2).with_backoff(Duration::ZERO));
    let mut model = ToyModel::new();

    match trainer.run(&mut model, &UnavailableSource) {
        Err(SftPackError::Resource {
            operation, attempts, ..
        }) => {
            assert_eq!(operation, "dataset open");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(trainer.state().step, 0);
}
