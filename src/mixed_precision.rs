//! Numeric precision selection and dynamic loss scaling.
//!
//! Forward passes run under a configured [`Precision`]; under reduced
//! precision, gradients small enough to underflow fp16 are protected by
//! scaling the loss up before backward and unscaling gradients before the
//! optimizer step. The scale adapts: it backs off when non-finite gradients
//! appear and grows again after a long clean streak.
//!
//! The controller drives the scaler in three beats per gated iteration:
//! [`GradScaler::observe`] after every backward pass,
//! [`GradScaler::step`] at the optimizer gate, and
//! [`GradScaler::update`] immediately after.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TrainResult;
use crate::{Detector, GradientInfo, Optimizer};

/// Numeric precision for forward passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// IEEE 754 single precision.
    Fp32,
    /// IEEE 754 half precision.
    Fp16,
}

impl Precision {
    /// Bytes per scalar value.
    #[must_use]
    pub fn bytes_per_value(self) -> usize {
        match self {
            Self::Fp32 => 4,
            Self::Fp16 => 2,
        }
    }

    /// Whether this precision needs loss scaling.
    #[must_use]
    pub fn is_reduced(self) -> bool {
        matches!(self, Self::Fp16)
    }
}

const INITIAL_SCALE: f32 = 65536.0;
const GROWTH_FACTOR: f32 = 2.0;
const BACKOFF_FACTOR: f32 = 0.5;
const GROWTH_INTERVAL: u64 = 2000;

/// Dynamic loss scaler for reduced-precision training.
///
/// When disabled (fp32) the scale is pinned at 1.0 and the optimizer step is
/// never skipped.
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: u64,
    clean_steps: u64,
    found_overflow: bool,
    enabled: bool,
}

impl GradScaler {
    /// Creates a scaler appropriate for the given precision.
    #[must_use]
    pub fn for_precision(precision: Precision) -> Self {
        Self::with_params(
            INITIAL_SCALE,
            GROWTH_FACTOR,
            BACKOFF_FACTOR,
            GROWTH_INTERVAL,
            precision.is_reduced(),
        )
    }

    /// Creates a scaler with explicit parameters.
    #[must_use]
    pub fn with_params(
        initial_scale: f32,
        growth_factor: f32,
        backoff_factor: f32,
        growth_interval: u64,
        enabled: bool,
    ) -> Self {
        Self {
            scale: if enabled { initial_scale } else { 1.0 },
            growth_factor,
            backoff_factor,
            growth_interval,
            clean_steps: 0,
            found_overflow: false,
            enabled,
        }
    }

    /// Factor the model adapter multiplies the loss by before backward.
    #[must_use]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Whether an overflow has been latched since the last [`update`].
    ///
    /// [`update`]: GradScaler::update
    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.found_overflow
    }

    /// Latches overflow if the backward pass reported a non-finite norm.
    pub fn observe(&mut self, gradients: &GradientInfo) {
        if self.enabled && !gradients.gradient_norm.is_finite() {
            self.found_overflow = true;
        }
    }

    /// Unscales gradients and steps the optimizer, unless an overflow was
    /// latched, in which case the step is skipped.
    ///
    /// Returns whether the optimizer actually stepped.
    ///
    /// # Errors
    ///
    /// Propagates optimizer adapter failures.
    pub fn step<M, O>(
        &mut self,
        model: &mut M,
        optimizer: &mut O,
        gradients: &GradientInfo,
    ) -> TrainResult<bool>
    where
        M: Detector,
        O: Optimizer<M>,
    {
        if self.found_overflow {
            return Ok(false);
        }
        if self.enabled {
            model.scale_gradients(1.0 / self.scale);
        }
        optimizer.step(model, gradients)?;
        Ok(true)
    }

    /// Adjusts the scale after a gate: backoff on overflow, growth after a
    /// clean streak. Clears the overflow latch.
    pub fn update(&mut self) {
        if !self.enabled {
            return;
        }
        if self.found_overflow {
            self.scale *= self.backoff_factor;
            self.clean_steps = 0;
            warn!(scale = self.scale, "gradient overflow, loss scale reduced");
        } else {
            self.clean_steps += 1;
            if self.clean_steps >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.clean_steps = 0;
            }
        }
        self.found_overflow = false;
    }
}
