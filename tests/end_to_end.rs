//! End-to-end integration tests for detect-trainer-rs

use std::cell::Cell;
use std::path::Path;

use detect_trainer_rs::prelude::*;
use tempfile::TempDir;

/// Mock batch implementing the Batch trait for testing.
#[derive(Debug, Clone)]
struct TestBatch {
    size: usize,
    normalize_calls: u32,
}

impl TestBatch {
    fn new(size: usize) -> Self {
        Self {
            size,
            normalize_calls: 0,
        }
    }
}

impl Batch for TestBatch {
    fn batch_size(&self) -> usize {
        self.size
    }

    fn normalize(&mut self) {
        self.normalize_calls += 1;
    }
}

/// Mock dataset adapter yielding a fixed number of batches per epoch.
struct TestLoader {
    batches_per_epoch: usize,
    /// Batches actually yielded per pass; differs from the promise in the
    /// short-epoch test.
    yields: usize,
    batch_size: usize,
    cursor: usize,
}

impl TestLoader {
    fn new(batches_per_epoch: usize, batch_size: usize) -> Self {
        Self {
            batches_per_epoch,
            yields: batches_per_epoch,
            batch_size,
            cursor: 0,
        }
    }

    fn short(batches_per_epoch: usize, yields: usize, batch_size: usize) -> Self {
        Self {
            batches_per_epoch,
            yields,
            batch_size,
            cursor: 0,
        }
    }
}

impl DataLoader for TestLoader {
    type Batch = TestBatch;
    type Targets = Vec<[f32; 5]>;

    fn batches_per_epoch(&self) -> usize {
        self.batches_per_epoch
    }

    fn next_batch(&mut self) -> TrainResult<Option<(TestBatch, Self::Targets)>> {
        if self.cursor >= self.yields {
            return Ok(None);
        }
        self.cursor += 1;
        Ok(Some((TestBatch::new(self.batch_size), vec![[0.0; 5]])))
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// Mock detector with a synthetic decaying loss.
struct TestDetector {
    forward_calls: u32,
    zero_grad_calls: u32,
    saw_bad_normalize: bool,
    /// Backward call indices (0-based) that report a non-finite norm.
    overflow_at: Vec<u32>,
    backward_calls: u32,
}

impl TestDetector {
    fn new() -> Self {
        Self {
            forward_calls: 0,
            zero_grad_calls: 0,
            saw_bad_normalize: false,
            overflow_at: Vec::new(),
            backward_calls: 0,
        }
    }

    fn with_overflow_at(overflow_at: Vec<u32>) -> Self {
        Self {
            overflow_at,
            ..Self::new()
        }
    }
}

impl Detector for TestDetector {
    type Batch = TestBatch;
    type Predictions = f32;
    type Loss = f32;

    fn forward(&mut self, batch: &TestBatch, _precision: Precision) -> TrainResult<f32> {
        if batch.normalize_calls != 1 {
            self.saw_bad_normalize = true;
        }
        let iter = self.forward_calls as f32;
        self.forward_calls += 1;
        // Simulate decreasing loss
        Ok(2.5 * (-(iter * 0.001)).exp() + 0.1)
    }

    fn backward(&mut self, loss: f32, loss_scale: f32) -> TrainResult<GradientInfo> {
        let call = self.backward_calls;
        self.backward_calls += 1;
        let norm = if self.overflow_at.contains(&call) {
            f32::NAN
        } else {
            loss * loss_scale * 0.5
        };
        Ok(GradientInfo {
            loss,
            gradient_norm: norm,
        })
    }

    fn scale_gradients(&mut self, _factor: f32) {}

    fn zero_grad(&mut self) {
        self.zero_grad_calls += 1;
    }

    fn state_snapshot(&self) -> TrainResult<Vec<u8>> {
        Ok(self.forward_calls.to_le_bytes().to_vec())
    }
}

/// Mock loss adapter splitting the prediction scalar into components.
struct TestLoss;

impl DetectionLoss for TestLoss {
    type Predictions = f32;
    type Targets = Vec<[f32; 5]>;
    type Loss = f32;

    fn compute(
        &self,
        predictions: &f32,
        _targets: &Self::Targets,
        _anchors: &AnchorGeometry,
    ) -> TrainResult<(f32, LossComponents)> {
        let p = *predictions;
        Ok((p, LossComponents::new(p * 0.5, p * 0.3, p * 0.2)))
    }
}

/// Loss adapter that fails on a chosen call.
struct FailingLoss {
    fail_at: u32,
    calls: Cell<u32>,
}

impl DetectionLoss for FailingLoss {
    type Predictions = f32;
    type Targets = Vec<[f32; 5]>;
    type Loss = f32;

    fn compute(
        &self,
        predictions: &f32,
        _targets: &Self::Targets,
        _anchors: &AnchorGeometry,
    ) -> TrainResult<(f32, LossComponents)> {
        let call = self.calls.get();
        self.calls.set(call + 1);
        if call == self.fail_at {
            return Err(TrainingError::adapter(
                AdapterStage::Loss,
                u64::from(call),
                "nan in objectness term",
            ));
        }
        let p = *predictions;
        Ok((p, LossComponents::new(p * 0.5, p * 0.3, p * 0.2)))
    }
}

/// Mock optimizer with role-tagged parameter groups.
struct TestOptimizer {
    groups: Vec<ParamGroup>,
    steps: u32,
}

impl TestOptimizer {
    fn new(base_lr: f32, momentum: f32) -> Self {
        Self {
            groups: vec![
                ParamGroup::new(ParamGroupRole::Weight, base_lr, Some(momentum)),
                ParamGroup::new(ParamGroupRole::Bias, base_lr, Some(momentum)),
                ParamGroup::new(ParamGroupRole::BatchNormScale, base_lr, Some(momentum)),
            ],
            steps: 0,
        }
    }
}

impl Optimizer<TestDetector> for TestOptimizer {
    fn step(&mut self, _model: &mut TestDetector, _gradients: &GradientInfo) -> TrainResult<()> {
        self.steps += 1;
        Ok(())
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn state_snapshot(&self) -> TrainResult<Vec<u8>> {
        Ok(self.steps.to_le_bytes().to_vec())
    }
}

fn test_config(save_path: &Path, total_epochs: u32, batch_size: u32) -> TrainerConfig {
    let mut config = TrainerConfig::default();
    config.io.save_path = save_path.to_path_buf();
    config.train.total_epochs = total_epochs;
    config.train.batch_size = batch_size;
    config.train.precision = Precision::Fp32;
    config
}

fn checkpoint_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("epoch_"))
        .collect();
    names.sort();
    names
}

#[test]
fn test_single_epoch_run_writes_exactly_one_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 1, 32);
    let mut trainer = Trainer::new(
        TestDetector::new(),
        TestLoader::new(8, 32),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    )
    .unwrap();

    let summary = trainer.run().unwrap();
    assert_eq!(summary.epochs_completed, 1);
    assert_eq!(checkpoint_files(dir.path()), vec!["epoch_0.json"]);

    // single-epoch run: epoch 0 is the final epoch, no optimizer state
    let checkpoint = trainer.store().load(0).unwrap();
    assert!(checkpoint.optimizer_state.is_none());
    assert!(!checkpoint.model_state.is_empty());
}

#[test]
fn test_final_epoch_alone_omits_optimizer_state() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 3, 32);
    let mut trainer = Trainer::new(
        TestDetector::new(),
        TestLoader::new(4, 32),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    )
    .unwrap();
    trainer.run().unwrap();

    assert_eq!(
        checkpoint_files(dir.path()),
        vec!["epoch_0.json", "epoch_1.json", "epoch_2.json"]
    );
    assert!(trainer.store().load(0).unwrap().optimizer_state.is_some());
    assert!(trainer.store().load(1).unwrap().optimizer_state.is_some());
    assert!(trainer.store().load(2).unwrap().optimizer_state.is_none());
}

#[test]
fn test_loss_failure_aborts_before_any_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 1, 32);
    let mut trainer = Trainer::new(
        TestDetector::new(),
        TestLoader::new(8, 32),
        FailingLoss {
            fail_at: 3,
            calls: Cell::new(0),
        },
        TestOptimizer::new(0.01, 0.937),
        config,
    )
    .unwrap();

    let err = trainer.run().unwrap_err();
    assert!(matches!(
        err,
        TrainingError::Adapter {
            stage: AdapterStage::Loss,
            ..
        }
    ));
    assert!(checkpoint_files(dir.path()).is_empty());
}

#[test]
fn test_short_epoch_is_an_error() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 1, 32);
    let mut trainer = Trainer::new(
        TestDetector::new(),
        TestLoader::short(10, 5, 32),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    )
    .unwrap();

    let err = trainer.run().unwrap_err();
    assert!(matches!(
        err,
        TrainingError::DataExhausted {
            got: 5,
            expected: 10
        }
    ));
    assert!(checkpoint_files(dir.path()).is_empty());
}

#[test]
fn test_every_batch_normalized_exactly_once() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 2, 32);
    let mut trainer = Trainer::new(
        TestDetector::new(),
        TestLoader::new(6, 32),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    )
    .unwrap();
    trainer.run().unwrap();

    assert!(!trainer.model().saw_bad_normalize);
    assert_eq!(trainer.model().forward_calls, 12);
}

#[test]
fn test_nominal_batch_gates_every_iteration() {
    // batch_size == nominal batch: accumulation interval is constant 1,
    // so the optimizer steps on every batch of the run.
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 2, 64);
    let mut trainer = Trainer::new(
        TestDetector::new(),
        TestLoader::new(5, 64),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    )
    .unwrap();
    trainer.run().unwrap();

    assert_eq!(trainer.optimizer().steps, 10);
    // one zero_grad per gated iteration plus one at each epoch start
    assert_eq!(trainer.model().zero_grad_calls, 12);
}

#[test]
fn test_overflow_skips_optimizer_step_but_not_gate() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), 1, 64);
    config.train.precision = Precision::Fp16;
    let mut trainer = Trainer::new(
        TestDetector::with_overflow_at(vec![2]),
        TestLoader::new(5, 64),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    )
    .unwrap();
    trainer.run().unwrap();

    // gate fired 5 times (plus the epoch-start reset), one step was
    // skipped by the scaler
    assert_eq!(trainer.model().zero_grad_calls, 6);
    assert_eq!(trainer.optimizer().steps, 4);
}

#[test]
fn test_epoch_rates_captured_before_schedule_advances() {
    use detect_trainer_rs::schedule::cosine_factor;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 4, 64);
    let base_lr = config.train.base_lr;
    let mut trainer = Trainer::new(
        TestDetector::new(),
        TestLoader::new(400, 64),
        TestLoss,
        TestOptimizer::new(base_lr, 0.937),
        config,
    )
    .unwrap();
    trainer.run().unwrap();

    let epochs = trainer.metrics().epochs();
    assert_eq!(epochs.len(), 4);
    // epoch 0 ends mid-warmup (step 399 of 1200): the recorded rate is the
    // warmup ramp value the epoch trained with, not the post-step schedule
    // output
    let expected0 = (399.0 / 1200.0) * base_lr * cosine_factor(0, 4);
    assert!((epochs[0].learning_rates[0] - expected0).abs() < 1e-6);
    // epoch 3 runs past warmup with the rate warmup finalized at step 1200
    let expected3 = base_lr * cosine_factor(3, 4);
    assert!((epochs[3].learning_rates[0] - expected3).abs() < 1e-6);
}

#[test]
fn test_warmup_moves_momentum_from_cold_start() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 1, 32);
    let mut trainer = Trainer::new(
        TestDetector::new(),
        TestLoader::new(8, 32),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    )
    .unwrap();
    trainer.run().unwrap();

    // the whole run sits inside warmup (8 batches, 1000-step floor), so
    // momentum is still near its 0.9 cold start, not the 0.937 target
    let momentum = trainer.optimizer().param_groups()[0].momentum.unwrap();
    assert!(momentum >= 0.9);
    assert!(momentum < 0.91);
}

#[test]
fn test_running_mean_folds_only_gated_iterations() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 1, 64);
    let mut trainer = Trainer::new(
        TestDetector::new(),
        TestLoader::new(3, 64),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    )
    .unwrap();
    trainer.run().unwrap();

    // every iteration gated: mean equals the arithmetic mean of the three
    // synthetic losses
    let expected: f32 = (0..3)
        .map(|i| 2.5 * (-(i as f32 * 0.001)).exp() + 0.1)
        .sum::<f32>()
        / 3.0;
    let mean = trainer.metrics().latest().unwrap().mean_loss.total;
    assert!((mean - expected).abs() < 1e-4);
}

#[test]
fn test_resume_continues_from_next_epoch() {
    let dir = TempDir::new().unwrap();

    let config = test_config(dir.path(), 2, 32);
    let mut first = Trainer::new(
        TestDetector::new(),
        TestLoader::new(4, 32),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    )
    .unwrap();
    first.run().unwrap();

    let config = test_config(dir.path(), 5, 32);
    let mut resumed = Trainer::new(
        TestDetector::new(),
        TestLoader::new(4, 32),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    )
    .unwrap();
    let checkpoint = resumed.resume_latest().unwrap();
    assert_eq!(checkpoint.epoch, 1);

    let summary = resumed.run().unwrap();
    assert_eq!(summary.epochs_completed, 3);
    assert_eq!(
        checkpoint_files(dir.path()),
        vec![
            "epoch_0.json",
            "epoch_1.json",
            "epoch_2.json",
            "epoch_3.json",
            "epoch_4.json"
        ]
    );
}

#[test]
fn test_resume_past_warmup_keeps_nominal_accumulation() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();
    store
        .save(&Checkpoint::new(4, vec![1], Some(vec![2])))
        .unwrap();

    let config = test_config(dir.path(), 6, 32);
    let mut trainer = Trainer::new(
        TestDetector::new(),
        TestLoader::new(400, 32),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    )
    .unwrap();
    let checkpoint = trainer.resume_latest().unwrap();
    assert_eq!(checkpoint.epoch, 4);
    trainer.run().unwrap();

    // the resumed epoch sits entirely past warmup (steps 2000..2400 with a
    // 1200-step warmup), so the warmup branch never runs: the interval must
    // already be round(64 / 32) = 2, gating every second batch
    assert_eq!(trainer.optimizer().steps, 200);
}

#[test]
fn test_resume_beyond_total_epochs_rejected() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();
    store.save(&Checkpoint::new(4, vec![], None)).unwrap();

    let config = test_config(dir.path(), 2, 32);
    let mut trainer = Trainer::new(
        TestDetector::new(),
        TestLoader::new(4, 32),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    )
    .unwrap();
    let err = trainer.resume_latest().unwrap_err();
    assert!(matches!(err, TrainingError::Config { .. }));
}

#[test]
fn test_resume_at_exact_end_runs_zero_epochs() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();
    store.save(&Checkpoint::new(1, vec![], None)).unwrap();

    let config = test_config(dir.path(), 2, 32);
    let mut trainer = Trainer::new(
        TestDetector::new(),
        TestLoader::new(4, 32),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    )
    .unwrap();
    trainer.resume_latest().unwrap();

    let summary = trainer.run().unwrap();
    assert_eq!(summary.epochs_completed, 0);
    assert_eq!(checkpoint_files(dir.path()), vec!["epoch_1.json"]);
}

#[test]
fn test_epoch_boundary_discards_tail_gradients() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 2, 32);
    let mut trainer = Trainer::new(
        TestDetector::new(),
        TestLoader::new(400, 32),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    )
    .unwrap();
    trainer.run().unwrap();

    // 1200-step warmup: the interval reaches 2 at step 600, so epoch 0
    // gates all 400 batches, epoch 1 gates 200 + 100 and ends on the
    // non-gated step 799 whose gradients must be dropped at the boundary
    assert_eq!(trainer.optimizer().steps, 700);
    // one zero_grad per gated iteration plus one at each epoch start
    assert_eq!(trainer.model().zero_grad_calls, 702);
}

#[test]
fn test_resume_on_empty_store_is_not_found() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 1, 32);
    let mut trainer = Trainer::new(
        TestDetector::new(),
        TestLoader::new(4, 32),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    )
    .unwrap();
    let err = trainer.resume_latest().unwrap_err();
    assert!(matches!(err, TrainingError::CheckpointNotFound { .. }));
}

#[test]
fn test_zero_batch_loader_rejected_at_construction() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 1, 32);
    let result = Trainer::new(
        TestDetector::new(),
        TestLoader::new(0, 32),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    );
    assert!(matches!(result, Err(TrainingError::Config { .. })));
}

#[test]
fn test_invalid_config_rejected_at_construction() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), 1, 32);
    config.train.total_epochs = 0;
    let result = Trainer::new(
        TestDetector::new(),
        TestLoader::new(4, 32),
        TestLoss,
        TestOptimizer::new(0.01, 0.937),
        config,
    );
    assert!(matches!(result, Err(TrainingError::Config { .. })));
}
