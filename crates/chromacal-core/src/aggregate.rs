//! Percentile aggregation of per-pixel confidences into one tile score.

use crate::config::PredictionConfig;
use crate::error::{ChromacalError, Result};
use crate::types::{ColorLabel, TileId};

/// Value at percentile `p` (0..=100) by the nearest-rank method:
/// `sorted[ceil(p/100 * n) - 1]`, index clamped to `[0, n-1]`.
///
/// Returns `None` for an empty slice.
pub fn nearest_rank(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    // p * n before dividing keeps integer products exact.
    let rank = (p * n as f64 / 100.0).ceil();
    let idx = (rank as isize - 1).clamp(0, n as isize - 1) as usize;
    Some(sorted[idx])
}

/// Collapses per-pixel confidences for a (tile, label) pair.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceAggregator {
    percentile: f64,
}

impl ConfidenceAggregator {
    pub fn new(percentile: f64) -> Self {
        Self {
            percentile: percentile.clamp(0.0, 100.0),
        }
    }

    pub fn from_config(config: &PredictionConfig) -> Self {
        Self::new(config.percentile)
    }

    pub fn percentile(&self) -> f64 {
        self.percentile
    }

    pub fn aggregate(&self, tile: TileId, label: &ColorLabel, confidences: &[f64]) -> Result<f64> {
        nearest_rank(confidences, self.percentile).ok_or_else(|| ChromacalError::EmptyPixelSet {
            tile,
            label: label.clone(),
        })
    }
}

impl Default for ConfidenceAggregator {
    fn default() -> Self {
        Self::from_config(&PredictionConfig::default())
    }
}
