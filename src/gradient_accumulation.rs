//! Gradient accumulation gating.
//!
//! Small per-pass batches are compensated by accumulating gradients across
//! several backward passes and stepping the optimizer only at interval
//! boundaries, so each update reflects roughly [`NOMINAL_BATCH`] images.
//! During warmup the interval itself ramps from 1 to its nominal value
//! (see [`accumulation_steps`]), keeping early updates frequent.
//!
//! The gate is modulo-based on the global step, so it fires on step 0.
//!
//! [`NOMINAL_BATCH`]: crate::config::NOMINAL_BATCH
//! [`accumulation_steps`]: crate::schedule::accumulation_steps

/// Tracks the optimizer gate interval and passes since the last update.
#[derive(Debug, Clone)]
pub struct AccumulationState {
    accumulate_every: u64,
    steps_since_update: u64,
}

impl AccumulationState {
    /// Creates a gate with the given initial interval (clamped to >= 1).
    #[must_use]
    pub fn new(accumulate_every: u64) -> Self {
        Self {
            accumulate_every: accumulate_every.max(1),
            steps_since_update: 0,
        }
    }

    /// Current interval between optimizer steps.
    #[must_use]
    pub fn accumulate_every(&self) -> u64 {
        self.accumulate_every
    }

    /// Backward passes folded since the last optimizer step.
    #[must_use]
    pub fn steps_since_update(&self) -> u64 {
        self.steps_since_update
    }

    /// Re-derives the interval; values below 1 are clamped.
    pub fn set_accumulate_every(&mut self, accumulate_every: u64) {
        self.accumulate_every = accumulate_every.max(1);
    }

    /// Whether the optimizer should step on this global step.
    #[must_use]
    pub fn should_step(&self, global_step: u64) -> bool {
        global_step % self.accumulate_every == 0
    }

    /// Records one backward pass; `stepped` marks a gated iteration.
    pub fn record(&mut self, stepped: bool) {
        if stepped {
            self.steps_since_update = 0;
        } else {
            self.steps_since_update += 1;
        }
    }
}
