//! Error types for detection training.
//!
//! The trainer treats every failure as fatal: an adapter error aborts the run
//! before any further checkpoint is written, and the error propagates to the
//! caller unchanged. Variants carry enough context to diagnose the failure
//! from the log line alone.
//!
//! # Error Categories
//!
//! - **Configuration errors**: invalid or inconsistent hyperparameters,
//!   rejected before the loop starts
//! - **Adapter errors**: failures surfaced by the model, dataset, loss, or
//!   optimizer adapters, tagged with the pipeline stage they came from
//! - **Storage errors**: checkpoint persistence failures, with a missing
//!   checkpoint kept distinct from a corrupt one

use std::path::PathBuf;

use thiserror::Error;

/// Pipeline stage an adapter error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStage {
    /// Fetching the next batch from the dataset adapter.
    Data,
    /// Model forward pass.
    Forward,
    /// Detection loss computation.
    Loss,
    /// Model backward pass.
    Backward,
    /// Optimizer parameter update.
    OptimizerStep,
    /// Serializing model or optimizer state for a checkpoint.
    Snapshot,
}

impl std::fmt::Display for AdapterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Data => "data",
            Self::Forward => "forward",
            Self::Loss => "loss",
            Self::Backward => "backward",
            Self::OptimizerStep => "optimizer step",
            Self::Snapshot => "snapshot",
        };
        f.write_str(name)
    }
}

/// The main error type for detection training.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// Configuration error (invalid parameters or incompatible settings).
    #[error("configuration error: {detail}")]
    Config {
        /// Description of the configuration issue.
        detail: String,
    },

    /// An adapter (model, dataset, loss, or optimizer) reported a failure.
    #[error("adapter error during {stage} at step {step}: {detail}")]
    Adapter {
        /// Which pipeline stage failed.
        stage: AdapterStage,
        /// Global step at which the failure occurred.
        step: u64,
        /// Description of the failure as reported by the adapter.
        detail: String,
    },

    /// No checkpoint exists at the requested location.
    #[error("checkpoint not found: {path}")]
    CheckpointNotFound {
        /// The path that was probed.
        path: PathBuf,
    },

    /// A checkpoint file exists but its contents cannot be trusted.
    #[error("corrupt checkpoint {path}: {detail}")]
    CorruptCheckpoint {
        /// The offending file.
        path: PathBuf,
        /// What failed while decoding it.
        detail: String,
    },

    /// An I/O failure while reading or writing checkpoint storage.
    #[error("checkpoint I/O failure at {path}: {source}")]
    CheckpointIo {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The dataset adapter yielded a different number of batches than it
    /// promised via `batches_per_epoch`.
    #[error("dataset yielded {got} batches in one epoch, expected {expected}")]
    DataExhausted {
        /// Batches actually produced this epoch.
        got: usize,
        /// Batches the loader promised per epoch.
        expected: usize,
    },
}

impl TrainingError {
    /// Convenience constructor for adapter failures.
    #[must_use]
    pub fn adapter(stage: AdapterStage, step: u64, detail: impl Into<String>) -> Self {
        Self::Adapter {
            stage,
            step,
            detail: detail.into(),
        }
    }

    /// Convenience constructor for configuration failures.
    #[must_use]
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config {
            detail: detail.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type TrainResult<T> = Result<T, TrainingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_display_includes_stage_and_step() {
        let err = TrainingError::adapter(AdapterStage::Loss, 42, "nan in objectness term");
        let msg = err.to_string();
        assert!(msg.contains("loss"));
        assert!(msg.contains("42"));
        assert!(msg.contains("nan in objectness term"));
    }

    #[test]
    fn test_not_found_and_corrupt_are_distinct() {
        let missing = TrainingError::CheckpointNotFound {
            path: PathBuf::from("out/epoch_3.json"),
        };
        let corrupt = TrainingError::CorruptCheckpoint {
            path: PathBuf::from("out/epoch_3.json"),
            detail: "truncated".to_string(),
        };
        assert!(matches!(missing, TrainingError::CheckpointNotFound { .. }));
        assert!(matches!(corrupt, TrainingError::CorruptCheckpoint { .. }));
    }
}
