//! Training configuration.
//!
//! Configuration is loaded once, validated once, and immutable afterwards.
//! Every field is required in the TOML source: a missing field fails
//! deserialization instead of silently picking up a default, so a run never
//! trains with hyperparameters the operator did not write down. `Default` is
//! provided for tests and for generating a starter config file.
//!
//! The structure mirrors the three concerns a detection run configures:
//! I/O and geometry ([`IoConfig`]), dataset augmentation ([`AugmentConfig`],
//! consumed by the dataset adapter but validated here), and optimization
//! ([`TrainParams`]).
//!
//! # Example
//!
//! ```rust
//! use detect_trainer_rs::config::TrainerConfig;
//!
//! let config = TrainerConfig::default();
//! assert!(config.validate().is_ok());
//! assert_eq!(config.train.batch_size, 32);
//! ```

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{TrainResult, TrainingError};
use crate::mixed_precision::Precision;

/// Reference batch size the accumulation schedule targets.
///
/// With `batch_size` images per forward pass, gradients are accumulated for
/// `round(NOMINAL_BATCH / batch_size)` passes before each optimizer step, so
/// every update sees roughly this many images regardless of memory budget.
pub const NOMINAL_BATCH: u32 = 64;

/// Per-scale anchor box geometry.
///
/// Each scale owns a list of `[width, height]` anchor boxes in pixels at the
/// network input resolution. The trainer never interprets the boxes; it only
/// validates them and hands them to the loss adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnchorGeometry {
    scales: Vec<Vec<[f32; 2]>>,
}

impl AnchorGeometry {
    /// Creates anchor geometry from per-scale box lists.
    #[must_use]
    pub fn new(scales: Vec<Vec<[f32; 2]>>) -> Self {
        Self { scales }
    }

    /// Number of detection scales.
    #[must_use]
    pub fn num_scales(&self) -> usize {
        self.scales.len()
    }

    /// Anchor boxes for one scale.
    #[must_use]
    pub fn scale(&self, index: usize) -> &[[f32; 2]] {
        &self.scales[index]
    }

    /// All scales, outermost first.
    #[must_use]
    pub fn scales(&self) -> &[Vec<[f32; 2]>] {
        &self.scales
    }

    fn validate(&self) -> TrainResult<()> {
        if self.scales.is_empty() {
            return Err(TrainingError::config("anchor geometry has no scales"));
        }
        for (i, scale) in self.scales.iter().enumerate() {
            if scale.is_empty() {
                return Err(TrainingError::config(format!(
                    "anchor scale {i} has no boxes"
                )));
            }
            for [w, h] in scale {
                if *w <= 0.0 || *h <= 0.0 {
                    return Err(TrainingError::config(format!(
                        "anchor scale {i} contains non-positive box [{w}, {h}]"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Paths, input geometry, and class count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoConfig {
    /// Directory checkpoints are written to.
    pub save_path: PathBuf,

    /// Dataset manifest consumed by the dataset adapter.
    pub train_path: PathBuf,

    /// Square network input resolution in pixels.
    pub input_size: u32,

    /// Number of object classes.
    pub num_classes: u32,

    /// Anchor boxes per detection scale.
    pub anchors: AnchorGeometry,
}

/// Augmentation knobs, consumed by the dataset adapter.
///
/// The trainer validates ranges but applies none of these itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AugmentConfig {
    /// HSV hue jitter fraction.
    pub hsv_h: f32,
    /// HSV saturation jitter fraction.
    pub hsv_s: f32,
    /// HSV value jitter fraction.
    pub hsv_v: f32,
    /// Rotation range in degrees.
    pub degrees: f32,
    /// Translation fraction.
    pub translate: f32,
    /// Scale jitter fraction.
    pub scale: f32,
    /// Shear range in degrees.
    pub shear: f32,
    /// Perspective distortion coefficient.
    pub perspective: f32,
    /// Probability of a vertical flip.
    pub flipud: f32,
    /// Probability of a horizontal flip.
    pub fliplr: f32,
    /// Probability of mixup blending.
    pub mixup: f32,
}

/// Optimization hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainParams {
    /// Total number of epochs to run.
    pub total_epochs: u32,

    /// Images per forward pass.
    pub batch_size: u32,

    /// Base learning rate before cosine scaling.
    pub base_lr: f32,

    /// Target momentum reached at the end of warmup.
    pub momentum: f32,

    /// L2 weight decay applied by the optimizer adapter.
    pub weight_decay: f32,

    /// Numeric precision for forward passes.
    pub precision: Precision,
}

/// Complete, validated training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Paths, geometry, and anchors.
    pub io: IoConfig,
    /// Augmentation ranges for the dataset adapter.
    pub augment: AugmentConfig,
    /// Optimization hyperparameters.
    pub train: TrainParams,
}

impl TrainerConfig {
    /// Loads and validates a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::Config`] if the file cannot be read, a field
    /// is missing or malformed, or validation fails.
    pub fn from_file(path: impl AsRef<Path>) -> TrainResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            TrainingError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| {
            TrainingError::config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::Config`] if serialization or the write fails.
    pub fn to_file(&self, path: impl AsRef<Path>) -> TrainResult<()> {
        let path = path.as_ref();
        let text = toml::to_string_pretty(self)
            .map_err(|e| TrainingError::config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, text).map_err(|e| {
            TrainingError::config(format!("failed to write {}: {e}", path.display()))
        })
    }

    /// Validates all fields, returning the first violation found.
    ///
    /// # Errors
    ///
    /// Returns [`TrainingError::Config`] describing the offending field.
    pub fn validate(&self) -> TrainResult<()> {
        let t = &self.train;
        if t.total_epochs == 0 {
            return Err(TrainingError::config("total_epochs must be at least 1"));
        }
        if t.batch_size == 0 {
            return Err(TrainingError::config("batch_size must be at least 1"));
        }
        if t.batch_size > NOMINAL_BATCH {
            return Err(TrainingError::config(format!(
                "batch_size {} exceeds the nominal batch {NOMINAL_BATCH}",
                t.batch_size
            )));
        }
        if !t.base_lr.is_finite() || t.base_lr <= 0.0 {
            return Err(TrainingError::config(format!(
                "base_lr must be positive, got {}",
                t.base_lr
            )));
        }
        if !(0.0..1.0).contains(&t.momentum) {
            return Err(TrainingError::config(format!(
                "momentum must be in [0, 1), got {}",
                t.momentum
            )));
        }
        if !t.weight_decay.is_finite() || t.weight_decay < 0.0 {
            return Err(TrainingError::config(format!(
                "weight_decay must be non-negative, got {}",
                t.weight_decay
            )));
        }
        if self.io.input_size == 0 {
            return Err(TrainingError::config("input_size must be at least 1"));
        }
        if self.io.num_classes == 0 {
            return Err(TrainingError::config("num_classes must be at least 1"));
        }
        self.io.anchors.validate()?;
        self.augment.validate()
    }

    /// Gradient accumulation target once warmup completes.
    ///
    /// `round(NOMINAL_BATCH / batch_size)`, never below 1.
    #[must_use]
    pub fn nominal_accumulation(&self) -> u64 {
        let ratio = f64::from(NOMINAL_BATCH) / f64::from(self.train.batch_size);
        (ratio.round() as u64).max(1)
    }
}

impl AugmentConfig {
    fn validate(&self) -> TrainResult<()> {
        for (name, value) in [
            ("flipud", self.flipud),
            ("fliplr", self.fliplr),
            ("mixup", self.mixup),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TrainingError::config(format!(
                    "{name} must be a probability in [0, 1], got {value}"
                )));
            }
        }
        for (name, value) in [
            ("hsv_h", self.hsv_h),
            ("hsv_s", self.hsv_s),
            ("hsv_v", self.hsv_v),
            ("degrees", self.degrees),
            ("translate", self.translate),
            ("scale", self.scale),
            ("shear", self.shear),
            ("perspective", self.perspective),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(TrainingError::config(format!(
                    "{name} must be non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            io: IoConfig {
                save_path: PathBuf::from("output"),
                train_path: PathBuf::from("data/train.txt"),
                input_size: 640,
                num_classes: 1,
                anchors: AnchorGeometry::new(vec![
                    vec![[12.0, 18.0], [37.0, 49.0], [52.0, 132.0]],
                    vec![[115.0, 73.0], [119.0, 199.0], [242.0, 238.0]],
                ]),
            },
            augment: AugmentConfig {
                hsv_h: 0.015,
                hsv_s: 0.7,
                hsv_v: 0.4,
                degrees: 0.0,
                translate: 0.1,
                scale: 0.5,
                shear: 0.0,
                perspective: 0.0,
                flipud: 0.0,
                fliplr: 0.5,
                mixup: 0.0,
            },
            train: TrainParams {
                total_epochs: 100,
                batch_size: 32,
                base_lr: 0.01,
                momentum: 0.937,
                weight_decay: 0.0005,
                precision: Precision::Fp16,
            },
        }
    }
}

/// Command-line options for a training process.
///
/// Placeholder switches the original surface exposes are modeled as plain
/// data here: the controller reads `resume`, logs the rest at startup, and
/// leaves their interpretation to the adapters that care.
#[derive(Debug, Clone, Parser)]
#[command(name = "detect-train", about = "Train a single-stage object detector")]
pub struct RunOptions {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "train.toml")]
    pub config: PathBuf,

    /// Resume from the most recent checkpoint in the save directory.
    #[arg(long)]
    pub resume: bool,

    /// Compute device, e.g. "cuda:0" or "cpu".
    #[arg(long, default_value = "cuda:0")]
    pub device: String,

    /// Use rectangular (non-square) training batches.
    #[arg(long)]
    pub rect: bool,

    /// Skip the automatic anchor fit check.
    #[arg(long)]
    pub no_autoanchor: bool,

    /// Evolve hyperparameters instead of training.
    #[arg(long)]
    pub evolve: bool,

    /// Vary input resolution between batches.
    #[arg(long)]
    pub multi_scale: bool,

    /// Use the Adam optimizer instead of SGD.
    #[arg(long)]
    pub adam: bool,
}
