//! # detect-trainer-rs
//!
//! Training-loop orchestration for single-stage anchor-based object
//! detectors.
//!
//! The crate owns everything a supervised detection run needs *around* the
//! network: learning-rate and momentum schedules, warmup, gradient
//! accumulation, dynamic loss scaling, running loss bookkeeping, and
//! per-epoch checkpoint persistence. The network itself, the dataset
//! pipeline, and the detection loss are opaque adapters behind traits, so
//! any tensor backend can plug in.
//!
//! # Architecture
//!
//! - [`Detector`], [`DataLoader`], [`DetectionLoss`], [`Optimizer`]: the
//!   adapter seams. Associated types tie a detector's batch, prediction,
//!   and loss types to the loader and loss adapters at compile time.
//! - [`Trainer`]: the epoch/iteration controller. Owns all adapters
//!   exclusively and runs single-threaded; batch-level parallelism lives
//!   inside the adapters.
//! - [`schedule`]: cosine epoch decay, step-indexed warmup, and the
//!   gradient accumulation ramp, as pure functions over parameter groups.
//! - [`checkpoint`]: one atomic `epoch_{e}.json` per completed epoch.
//!
//! # Control flow
//!
//! Per batch: normalize, forward under the configured precision, loss,
//! scaled backward. During warmup the accumulation interval and per-group
//! rates are re-derived every step. When the global step hits an
//! accumulation boundary the scaler unscales gradients and steps the
//! optimizer, the running loss folds the batch's components, and gradients
//! are cleared. Per epoch: the cosine schedule advances once and a
//! checkpoint is written; the final epoch's checkpoint omits optimizer
//! state.
//!
//! Any adapter failure aborts the run immediately; no checkpoint is written
//! for an epoch that did not complete.
//!
//! # Example
//!
//! ```rust,ignore
//! use detect_trainer_rs::prelude::*;
//!
//! let config = TrainerConfig::from_file("train.toml")?;
//! let mut trainer = Trainer::new(model, loader, loss, optimizer, config)?;
//! let summary = trainer.run()?;
//! println!("finished {} epochs", summary.epochs_completed);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc
)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod gradient_accumulation;
pub mod metrics;
pub mod mixed_precision;
pub mod schedule;

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::{AnchorGeometry, TrainerConfig, NOMINAL_BATCH};
use crate::error::{TrainResult, TrainingError};
use crate::gradient_accumulation::AccumulationState;
use crate::metrics::{EpochMetrics, LossComponents, MetricsRecorder, RunningLoss};
use crate::mixed_precision::{GradScaler, Precision};
use crate::schedule::{
    accumulation_steps, apply_warmup, warmup_steps, CosineEpochSchedule, ParamGroup,
};

/// A batch of images ready for a forward pass.
pub trait Batch: Send {
    /// Number of images in the batch.
    fn batch_size(&self) -> usize;

    /// Scales raw pixel values into `[0, 1]`.
    ///
    /// The trainer calls this exactly once per batch, before the forward
    /// pass.
    fn normalize(&mut self);
}

/// Gradient summary reported by a backward pass.
#[derive(Debug, Clone, Copy)]
pub struct GradientInfo {
    /// Scalar loss value the gradients were computed from (unscaled).
    pub loss: f32,
    /// Global gradient norm; non-finite values signal overflow under
    /// reduced precision.
    pub gradient_norm: f32,
}

/// The detection network adapter.
///
/// Gradients accumulate across [`backward`] calls until [`zero_grad`];
/// the trainer decides when an accumulation window closes.
///
/// [`backward`]: Detector::backward
/// [`zero_grad`]: Detector::zero_grad
pub trait Detector: Send {
    /// Batch type this detector consumes.
    type Batch: Batch;
    /// Raw multi-scale prediction output.
    type Predictions;
    /// Backend loss value carrying whatever backward needs.
    type Loss;

    /// Runs a forward pass under the given precision.
    fn forward(
        &mut self,
        batch: &Self::Batch,
        precision: Precision,
    ) -> TrainResult<Self::Predictions>;

    /// Computes gradients of `loss * loss_scale`, accumulating into any
    /// existing gradients.
    fn backward(&mut self, loss: Self::Loss, loss_scale: f32) -> TrainResult<GradientInfo>;

    /// Multiplies all accumulated gradients by `factor` (used to unscale
    /// before an optimizer step).
    fn scale_gradients(&mut self, factor: f32);

    /// Clears accumulated gradients.
    fn zero_grad(&mut self);

    /// Serializes the model parameters into a fresh, self-contained blob.
    fn state_snapshot(&self) -> TrainResult<Vec<u8>>;
}

/// The detection loss adapter.
pub trait DetectionLoss: Send {
    /// Prediction type consumed, matching the detector's output.
    type Predictions;
    /// Ground-truth target type, matching the loader's output.
    type Targets;
    /// Backend loss value handed back to the detector for backward.
    type Loss;

    /// Computes the loss and its components for one batch.
    fn compute(
        &self,
        predictions: &Self::Predictions,
        targets: &Self::Targets,
        anchors: &AnchorGeometry,
    ) -> TrainResult<(Self::Loss, LossComponents)>;
}

/// The dataset adapter: yields `(batch, targets)` pairs.
///
/// A loader must yield exactly [`batches_per_epoch`] batches between
/// [`reset`] calls; the trainer treats any other count as an error.
///
/// [`batches_per_epoch`]: DataLoader::batches_per_epoch
/// [`reset`]: DataLoader::reset
pub trait DataLoader: Send {
    /// Batch type produced.
    type Batch: Batch;
    /// Ground-truth target type produced alongside each batch.
    type Targets: Send;

    /// Number of batches one epoch pass yields.
    fn batches_per_epoch(&self) -> usize;

    /// Produces the next batch, or `None` when the epoch is exhausted.
    fn next_batch(&mut self) -> TrainResult<Option<(Self::Batch, Self::Targets)>>;

    /// Starts a fresh epoch pass (reshuffle, rewind).
    fn reset(&mut self);
}

/// The optimizer adapter.
///
/// Parameter groups are tagged with [`ParamGroupRole`] so the warmup and
/// epoch schedules can write rates and momenta without knowing group order.
///
/// [`ParamGroupRole`]: crate::schedule::ParamGroupRole
pub trait Optimizer<M: Detector>: Send {
    /// Applies one update from the model's accumulated gradients.
    fn step(&mut self, model: &mut M, gradients: &GradientInfo) -> TrainResult<()>;

    /// The optimizer's parameter groups.
    fn param_groups(&self) -> &[ParamGroup];

    /// Mutable access for the schedules.
    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    /// Serializes optimizer state into a fresh, self-contained blob.
    fn state_snapshot(&self) -> TrainResult<Vec<u8>>;
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    /// Epochs executed by this run (excludes epochs skipped via resume).
    pub epochs_completed: u32,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    /// Mean loss of the final epoch.
    pub final_mean_loss: LossComponents,
}

/// The epoch/iteration training controller.
///
/// Owns the model, loader, loss, and optimizer adapters exclusively for the
/// duration of the run.
pub struct Trainer<M, D, L, O> {
    model: M,
    loader: D,
    loss_fn: L,
    optimizer: O,
    config: TrainerConfig,
    store: CheckpointStore,
    schedule: CosineEpochSchedule,
    scaler: GradScaler,
    accumulation: AccumulationState,
    running_loss: RunningLoss,
    recorder: MetricsRecorder,
    warmup_steps: u64,
    batches_per_epoch: u64,
    start_epoch: u32,
    global_step: u64,
}

impl<M, D, L, O> Trainer<M, D, L, O>
where
    M: Detector,
    D: DataLoader<Batch = M::Batch>,
    L: DetectionLoss<Predictions = M::Predictions, Targets = D::Targets, Loss = M::Loss>,
    O: Optimizer<M>,
{
    /// Creates a trainer from adapters and a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::Config`] if validation fails or the loader
    /// reports zero batches per epoch, and storage errors if the checkpoint
    /// directory cannot be created.
    pub fn new(
        model: M,
        loader: D,
        loss_fn: L,
        optimizer: O,
        config: TrainerConfig,
    ) -> TrainResult<Self> {
        config.validate()?;

        let batches_per_epoch = loader.batches_per_epoch() as u64;
        if batches_per_epoch == 0 {
            return Err(TrainingError::config(
                "dataset adapter reports zero batches per epoch",
            ));
        }

        let store = CheckpointStore::new(&config.io.save_path)?;
        let schedule = CosineEpochSchedule::new(config.train.total_epochs, 0);
        let scaler = GradScaler::for_precision(config.train.precision);

        Ok(Self {
            model,
            loader,
            loss_fn,
            optimizer,
            store,
            schedule,
            scaler,
            // warmup re-derives the interval from step 0 on a fresh run; a
            // resume landing past warmup keeps this nominal value
            accumulation: AccumulationState::new(config.nominal_accumulation()),
            running_loss: RunningLoss::new(),
            recorder: MetricsRecorder::new(),
            warmup_steps: warmup_steps(batches_per_epoch),
            batches_per_epoch,
            start_epoch: 0,
            global_step: 0,
            config,
        })
    }

    /// Resumes from the most recent checkpoint in the save directory.
    ///
    /// Sets the start epoch to the checkpoint's epoch plus one and realigns
    /// the epoch schedule. The checkpoint is returned so the caller can
    /// restore its adapters from the opaque state blobs; the trainer never
    /// interprets them.
    ///
    /// # Errors
    ///
    /// [`TrainingError::CheckpointNotFound`] when the store is empty,
    /// [`TrainingError::Config`] when the checkpoint belongs to a longer
    /// run than this configuration describes, plus the usual load taxonomy.
    pub fn resume_latest(&mut self) -> TrainResult<Checkpoint> {
        let checkpoint = self.store.load_latest()?;
        if checkpoint.epoch + 1 > self.config.train.total_epochs {
            return Err(TrainingError::config(format!(
                "checkpoint epoch {} is beyond total_epochs {}",
                checkpoint.epoch, self.config.train.total_epochs
            )));
        }
        self.start_epoch = checkpoint.epoch + 1;
        self.schedule = CosineEpochSchedule::new(self.config.train.total_epochs, self.start_epoch);
        info!(
            resume_epoch = self.start_epoch,
            "resuming from checkpoint epoch {}", checkpoint.epoch
        );
        Ok(checkpoint)
    }

    /// Runs training from the start epoch through the final epoch.
    ///
    /// # Errors
    ///
    /// The first adapter or storage failure aborts the run and propagates
    /// unchanged.
    pub fn run(&mut self) -> TrainResult<TrainingSummary> {
        let run_start = Instant::now();
        let total_epochs = self.config.train.total_epochs;

        info!(
            total_epochs,
            start_epoch = self.start_epoch,
            batches_per_epoch = self.batches_per_epoch,
            warmup_steps = self.warmup_steps,
            "training started"
        );

        for epoch in self.start_epoch..total_epochs {
            self.train_epoch(epoch)?;
        }

        let elapsed = run_start.elapsed();
        let epochs_completed = total_epochs - self.start_epoch;
        info!(
            "{} epochs completed in {:.3} minutes",
            epochs_completed,
            elapsed.as_secs_f64() / 60.0
        );

        Ok(TrainingSummary {
            epochs_completed,
            elapsed,
            final_mean_loss: self.recorder.latest().map(|m| m.mean_loss).unwrap_or_default(),
        })
    }

    fn train_epoch(&mut self, epoch: u32) -> TrainResult<()> {
        let epoch_start = Instant::now();
        let total_epochs = self.config.train.total_epochs;

        self.loader.reset();
        self.running_loss.reset();
        // gradients from a trailing non-gated batch never cross the boundary
        self.model.zero_grad();
        let mut batches: u64 = 0;

        while let Some((mut batch, targets)) = self.loader.next_batch()? {
            if batches >= self.batches_per_epoch {
                return Err(TrainingError::DataExhausted {
                    got: (batches + 1) as usize,
                    expected: self.batches_per_epoch as usize,
                });
            }

            let global_step = batches + self.batches_per_epoch * u64::from(epoch);
            self.global_step = global_step;

            batch.normalize();

            if global_step <= self.warmup_steps {
                let interval = accumulation_steps(
                    global_step,
                    self.warmup_steps,
                    NOMINAL_BATCH,
                    self.config.train.batch_size,
                );
                self.accumulation.set_accumulate_every(interval);
                apply_warmup(
                    self.optimizer.param_groups_mut(),
                    global_step,
                    self.warmup_steps,
                    epoch,
                    total_epochs,
                    self.config.train.momentum,
                );
            }

            let predictions = self.model.forward(&batch, self.config.train.precision)?;
            let (loss, components) =
                self.loss_fn
                    .compute(&predictions, &targets, &self.config.io.anchors)?;
            let gradients = self.model.backward(loss, self.scaler.scale())?;
            self.scaler.observe(&gradients);

            let gated = self.accumulation.should_step(global_step);
            if gated {
                let stepped =
                    self.scaler
                        .step(&mut self.model, &mut self.optimizer, &gradients)?;
                self.scaler.update();
                self.model.zero_grad();
                self.running_loss.fold(components);

                debug!(
                    step = global_step,
                    epoch,
                    loss = components.total,
                    mean_loss = self.running_loss.mean().total,
                    stepped,
                    "optimizer gate"
                );
            } else {
                debug!(step = global_step, epoch, loss = components.total, "batch");
            }
            self.accumulation.record(gated);
            batches += 1;
        }

        if batches != self.batches_per_epoch {
            return Err(TrainingError::DataExhausted {
                got: batches as usize,
                expected: self.batches_per_epoch as usize,
            });
        }

        // capture the rates the epoch actually trained with, then advance
        let learning_rates: Vec<f32> =
            self.optimizer.param_groups().iter().map(|g| g.lr).collect();
        self.schedule.step(self.optimizer.param_groups_mut());

        let mean_loss = self.running_loss.mean();
        self.recorder.record(EpochMetrics {
            epoch,
            mean_loss,
            learning_rates,
            duration_secs: epoch_start.elapsed().as_secs_f64(),
        });
        info!(
            epoch,
            total_epochs,
            mean_loss = mean_loss.total,
            "epoch complete"
        );

        // Snapshot both adapters before touching storage; blobs are
        // self-contained copies, never views into live state.
        let model_state = self.model.state_snapshot()?;
        let optimizer_state = if epoch + 1 == total_epochs {
            None
        } else {
            Some(self.optimizer.state_snapshot()?)
        };
        self.store
            .save(&Checkpoint::new(epoch, model_state, optimizer_state))?;

        Ok(())
    }

    /// Current global step (last executed batch).
    #[must_use]
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Number of warmup steps for this run's dataset size.
    #[must_use]
    pub fn warmup_steps(&self) -> u64 {
        self.warmup_steps
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Per-epoch metrics recorded so far.
    #[must_use]
    pub fn metrics(&self) -> &MetricsRecorder {
        &self.recorder
    }

    /// The checkpoint store backing this run.
    #[must_use]
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// The model adapter.
    #[must_use]
    pub fn model(&self) -> &M {
        &self.model
    }

    /// The optimizer adapter.
    #[must_use]
    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }
}

/// Initializes a `tracing` subscriber reading `RUST_LOG`, defaulting to
/// `info`. Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Common imports for downstream adapter crates.
pub mod prelude {
    pub use crate::checkpoint::{Checkpoint, CheckpointStore};
    pub use crate::config::{AnchorGeometry, RunOptions, TrainerConfig, NOMINAL_BATCH};
    pub use crate::error::{AdapterStage, TrainResult, TrainingError};
    pub use crate::metrics::{EpochMetrics, LossComponents, RunningLoss};
    pub use crate::mixed_precision::{GradScaler, Precision};
    pub use crate::schedule::{CosineEpochSchedule, ParamGroup, ParamGroupRole};
    pub use crate::{
        Batch, DataLoader, DetectionLoss, Detector, GradientInfo, Optimizer, Trainer,
        TrainingSummary,
    };
}
