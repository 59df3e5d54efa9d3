//! Tunable parameters for calibration, indexing and prediction.
//!
//! Configuration is plain data: construct it in code, or load it from a JSON
//! file where every field is optional and falls back to its default.
//!
//! ```no_run
//! use chromacal_core::ChromacalConfig;
//! use std::path::Path;
//!
//! let config = ChromacalConfig::from_json_file(Path::new("chromacal.json"))?;
//! assert!(config.prediction.percentile <= 100.0);
//! # Ok::<(), chromacal_core::ChromacalError>(())
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ChromacalError, Result};

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChromacalConfig {
    pub calibration: CalibrationConfig,
    pub index: IndexConfig,
    pub prediction: PredictionConfig,
}

/// Significance thresholds for the assignment refiner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Alpha a pixel starts at (and returns to after a rejection).
    pub initial_alpha: f64,
    /// Multiplier applied to alpha after each session, in `(0, 1]`.
    pub decay_factor: f64,
    /// Alpha never decays below this; reaching it unconverged is `Unresolved`.
    pub alpha_floor: f64,
    /// Consecutive sessions above `1 - alpha` needed to converge.
    pub convergence_rounds: u32,
    /// Candidates whose p-values differ by less than this many decades are
    /// indistinguishable.
    pub tie_tolerance: f64,
    /// Worker threads for per-pixel evaluation. 0 uses available parallelism.
    pub workers: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            initial_alpha: 0.05,
            decay_factor: 0.8,
            alpha_floor: 1e-6,
            convergence_rounds: 2,
            tie_tolerance: 0.5,
            workers: 0,
        }
    }
}

/// Spatial index shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Maximum samples per leaf before it is split.
    pub capacity: usize,
    /// Depth at which leaves stop splitting (guards against duplicate points).
    pub max_depth: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            max_depth: 24,
        }
    }
}

/// Density prediction and aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// Upper bound on neighbours used for the density estimate.
    pub k: usize,
    /// The effective k never exceeds `samples / max_fraction` (minimum 1).
    pub max_fraction: usize,
    /// Nearest-rank percentile used to collapse per-pixel confidences.
    pub percentile: f64,
    /// Reservoir-sample tiles with more pixels than this.
    pub max_pixels_per_tile: Option<usize>,
    /// Seed for reservoir sampling.
    pub seed: u64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            k: 10,
            max_fraction: 8,
            percentile: 80.0,
            max_pixels_per_tile: None,
            seed: 0x5EED,
        }
    }
}

impl ChromacalConfig {
    /// Load configuration from a JSON file and validate it.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration as pretty JSON.
    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let c = &self.calibration;
        if !(c.initial_alpha > 0.0 && c.initial_alpha < 1.0) {
            return Err(invalid(format!(
                "initial_alpha must be in (0, 1), got {}",
                c.initial_alpha
            )));
        }
        if !(c.decay_factor > 0.0 && c.decay_factor <= 1.0) {
            return Err(invalid(format!(
                "decay_factor must be in (0, 1], got {}",
                c.decay_factor
            )));
        }
        if !(c.alpha_floor > 0.0 && c.alpha_floor <= c.initial_alpha) {
            return Err(invalid(format!(
                "alpha_floor must be in (0, initial_alpha], got {}",
                c.alpha_floor
            )));
        }
        if c.convergence_rounds == 0 {
            return Err(invalid("convergence_rounds must be at least 1".into()));
        }
        if !(c.tie_tolerance >= 0.0) {
            return Err(invalid(format!(
                "tie_tolerance must be non-negative, got {}",
                c.tie_tolerance
            )));
        }
        if self.index.capacity == 0 {
            return Err(invalid("index capacity must be at least 1".into()));
        }
        let p = &self.prediction;
        if p.k == 0 || p.max_fraction == 0 {
            return Err(invalid("k and max_fraction must be at least 1".into()));
        }
        if !(0.0..=100.0).contains(&p.percentile) {
            return Err(invalid(format!(
                "percentile must be in [0, 100], got {}",
                p.percentile
            )));
        }
        if p.max_pixels_per_tile == Some(0) {
            return Err(invalid("max_pixels_per_tile must be at least 1".into()));
        }
        Ok(())
    }

    /// Number of evaluation workers after resolving `0` to the machine's
    /// available parallelism.
    pub fn worker_count(&self) -> usize {
        match self.calibration.workers {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        }
    }
}

fn invalid(msg: String) -> ChromacalError {
    ChromacalError::InvalidConfig(msg)
}
