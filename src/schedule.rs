//! Learning-rate and accumulation schedule math.
//!
//! Three schedules interact during a run:
//!
//! 1. A cosine epoch schedule shapes the per-epoch learning rate from the
//!    base rate at epoch 0 down to 20% of it at the final epoch.
//! 2. A step-indexed warmup ramps each parameter group's rate from a
//!    cold-start value to its scheduled rate, and its momentum from 0.9 to
//!    the configured target, over the first `warmup_steps` global steps.
//! 3. Gradient accumulation grows from 1 to its nominal value over the same
//!    warmup window, so early updates stay frequent while the effective
//!    batch ramps up.
//!
//! Everything here is pure arithmetic over [`ParamGroup`] slices; the
//! optimizer adapter owns the groups and applies the written rates.

use serde::{Deserialize, Serialize};

/// Role a parameter group plays in the network.
///
/// Warmup behavior differs per role (bias groups ramp down from a high
/// cold-start rate, everything else ramps up from zero), so groups are
/// tagged explicitly rather than identified by their position in the
/// optimizer's group list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamGroupRole {
    /// Convolution and linear weights (weight decay applies).
    Weight,
    /// Bias vectors.
    Bias,
    /// Batch-norm scale parameters (no weight decay).
    BatchNormScale,
}

impl ParamGroupRole {
    /// Learning rate the warmup ramp starts from for this role.
    #[must_use]
    pub fn cold_start_lr(self) -> f32 {
        match self {
            Self::Bias => 0.1,
            Self::Weight | Self::BatchNormScale => 0.0,
        }
    }
}

/// One optimizer parameter group as seen by the schedules.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    /// The group's role, driving warmup dispatch.
    pub role: ParamGroupRole,
    /// Current learning rate.
    pub lr: f32,
    /// Learning rate the cosine schedule scales from.
    pub initial_lr: f32,
    /// Current momentum, if the optimizer uses one.
    pub momentum: Option<f32>,
}

impl ParamGroup {
    /// Creates a group with `initial_lr` pinned to the starting rate.
    #[must_use]
    pub fn new(role: ParamGroupRole, lr: f32, momentum: Option<f32>) -> Self {
        Self {
            role,
            lr,
            initial_lr: lr,
            momentum,
        }
    }
}

/// Cosine decay factor for one epoch.
///
/// `((1 + cos(epoch * PI / total_epochs)) / 2) * 0.8 + 0.2`: exactly 1.0 at
/// epoch 0, exactly 0.2 at `total_epochs`, strictly decreasing between.
#[must_use]
pub fn cosine_factor(epoch: u32, total_epochs: u32) -> f32 {
    let phase = f64::from(epoch) * std::f64::consts::PI / f64::from(total_epochs);
    (((1.0 + phase.cos()) / 2.0) * 0.8 + 0.2) as f32
}

/// Scheduled learning rate for one epoch.
#[must_use]
pub fn learning_rate(epoch: u32, total_epochs: u32, base_lr: f32) -> f32 {
    base_lr * cosine_factor(epoch, total_epochs)
}

/// Number of warmup steps for a dataset of the given size.
///
/// Three epochs' worth of batches, but never fewer than 1000 steps so short
/// epochs still get a meaningful ramp.
#[must_use]
pub fn warmup_steps(batches_per_epoch: u64) -> u64 {
    (3 * batches_per_epoch).max(1000)
}

/// Warmup progress in [0, 1] at a global step.
#[must_use]
pub fn warmup_progress(global_step: u64, warmup_steps: u64) -> f32 {
    if warmup_steps == 0 {
        return 1.0;
    }
    (global_step as f64 / warmup_steps as f64).clamp(0.0, 1.0) as f32
}

/// Gradient accumulation interval at a global step.
///
/// Interpolates from 1 at step 0 to `round(nominal_batch / batch_size)` at
/// the end of warmup and holds there; never below 1. Non-decreasing in
/// `global_step`.
#[must_use]
pub fn accumulation_steps(
    global_step: u64,
    warmup_steps: u64,
    nominal_batch: u32,
    batch_size: u32,
) -> u64 {
    let target = f64::from(nominal_batch) / f64::from(batch_size);
    let progress = f64::from(warmup_progress(global_step, warmup_steps));
    let interpolated = 1.0 + (target - 1.0) * progress;
    (interpolated.round() as u64).max(1)
}

/// Applies the per-group warmup interpolation in place.
///
/// Each group's learning rate moves linearly from its role's cold-start
/// value to `initial_lr * cosine_factor(epoch)`; momentum (where present)
/// moves from 0.9 to `target_momentum`. Call while
/// `global_step <= warmup_steps`.
pub fn apply_warmup(
    groups: &mut [ParamGroup],
    global_step: u64,
    warmup_steps: u64,
    epoch: u32,
    total_epochs: u32,
    target_momentum: f32,
) {
    let progress = warmup_progress(global_step, warmup_steps);
    let factor = cosine_factor(epoch, total_epochs);
    for group in groups {
        let cold = group.role.cold_start_lr();
        let hot = group.initial_lr * factor;
        group.lr = cold + (hot - cold) * progress;
        if let Some(momentum) = group.momentum.as_mut() {
            *momentum = 0.9 + (target_momentum - 0.9) * progress;
        }
    }
}

/// Per-epoch cosine schedule with an explicit epoch cursor.
///
/// The cursor starts at `start_epoch - 1` so the first [`step`] call lands
/// on `start_epoch`; rates set at optimizer construction hold until then.
/// Stepped exactly once per epoch, at epoch end.
///
/// [`step`]: CosineEpochSchedule::step
#[derive(Debug, Clone)]
pub struct CosineEpochSchedule {
    total_epochs: u32,
    last_epoch: i64,
}

impl CosineEpochSchedule {
    /// Creates a schedule resuming at `start_epoch`.
    #[must_use]
    pub fn new(total_epochs: u32, start_epoch: u32) -> Self {
        Self {
            total_epochs,
            last_epoch: i64::from(start_epoch) - 1,
        }
    }

    /// The epoch the schedule last applied, or `start_epoch - 1` before the
    /// first step.
    #[must_use]
    pub fn last_epoch(&self) -> i64 {
        self.last_epoch
    }

    /// Advances the cursor one epoch and writes the scheduled rate into
    /// every group.
    pub fn step(&mut self, groups: &mut [ParamGroup]) {
        self.last_epoch += 1;
        let epoch = u32::try_from(self.last_epoch.max(0)).unwrap_or(self.total_epochs);
        let factor = cosine_factor(epoch, self.total_epochs);
        for group in groups {
            group.lr = group.initial_lr * factor;
        }
    }
}
