//! Loss bookkeeping and per-epoch metrics.
//!
//! The loss adapter reports a fixed set of components per batch; the trainer
//! folds them into a running mean that resets at every epoch boundary. Only
//! gated iterations (those where the optimizer stepped) are folded, and the
//! mean carries its own fold counter, so after `k` folds it is exactly the
//! arithmetic mean of those `k` component vectors.

use serde::{Deserialize, Serialize};

/// Detection loss split into its components.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LossComponents {
    /// Bounding-box regression term.
    pub bbox: f32,
    /// Objectness term.
    pub objectness: f32,
    /// Classification term.
    pub classification: f32,
    /// Sum of the three, as reported by the loss adapter.
    pub total: f32,
}

impl LossComponents {
    /// Creates components from the three terms, deriving the total.
    #[must_use]
    pub fn new(bbox: f32, objectness: f32, classification: f32) -> Self {
        Self {
            bbox,
            objectness,
            classification,
            total: bbox + objectness + classification,
        }
    }

    fn as_array(self) -> [f32; 4] {
        [self.bbox, self.objectness, self.classification, self.total]
    }

    fn from_array(values: [f32; 4]) -> Self {
        Self {
            bbox: values[0],
            objectness: values[1],
            classification: values[2],
            total: values[3],
        }
    }
}

/// Running mean of loss components within one epoch.
///
/// Update rule: `mean_t = (mean_{t-1} * t + new) / (t + 1)` with `t` the
/// number of folds already applied.
#[derive(Debug, Clone, Default)]
pub struct RunningLoss {
    mean: [f32; 4],
    folds: u64,
}

impl RunningLoss {
    /// Creates an empty running mean.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one component vector into the mean.
    pub fn fold(&mut self, components: LossComponents) {
        let t = self.folds as f32;
        let new = components.as_array();
        for (mean, value) in self.mean.iter_mut().zip(new) {
            *mean = (*mean * t + value) / (t + 1.0);
        }
        self.folds += 1;
    }

    /// The current mean; zeros before the first fold.
    #[must_use]
    pub fn mean(&self) -> LossComponents {
        LossComponents::from_array(self.mean)
    }

    /// Number of vectors folded so far this epoch.
    #[must_use]
    pub fn folds(&self) -> u64 {
        self.folds
    }

    /// Clears the mean at an epoch boundary.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Summary of one completed epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// Zero-based epoch index.
    pub epoch: u32,
    /// Mean loss over the epoch's gated iterations.
    pub mean_loss: LossComponents,
    /// Learning rate of each parameter group over the epoch's final
    /// iterations, captured before the schedule advances.
    pub learning_rates: Vec<f32>,
    /// Wall-clock duration of the epoch.
    pub duration_secs: f64,
}

/// Collects one [`EpochMetrics`] entry per completed epoch.
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder {
    epochs: Vec<EpochMetrics>,
}

impl MetricsRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a completed epoch's summary.
    pub fn record(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    /// All recorded epochs, oldest first.
    #[must_use]
    pub fn epochs(&self) -> &[EpochMetrics] {
        &self.epochs
    }

    /// The most recent epoch summary, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }
}
