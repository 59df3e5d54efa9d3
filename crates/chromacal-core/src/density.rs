//! kNN density estimates as colour-match confidence.
//!
//! For a live pixel colour and each candidate label, the predictor looks up
//! the label's samples for the pixel's tile and estimates local density from
//! the distance to the k-th nearest neighbour:
//!
//! ```text
//! density = k / (n * V_d * r_k^d)
//! ```
//!
//! where `V_d` is the unit-ball volume. Densities are then scaled by the
//! largest one across labels, so the best-supported label scores 1.0.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::PredictionConfig;
use crate::spatial::SpatialIndex;
use crate::types::{ColorLabel, ColorVector, TileId};

/// Optional transform applied to a colour before lookup (white balance,
/// colourspace projection, ...). Any `Fn(ColorVector) -> ColorVector` works.
pub trait ColorCorrection: Send + Sync {
    fn correct(&self, color: ColorVector) -> ColorVector;
}

/// Leaves colours untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl ColorCorrection for Identity {
    fn correct(&self, color: ColorVector) -> ColorVector {
        color
    }
}

impl<F> ColorCorrection for F
where
    F: Fn(ColorVector) -> ColorVector + Send + Sync,
{
    fn correct(&self, color: ColorVector) -> ColorVector {
        self(color)
    }
}

/// Volume of the unit ball in `d` dimensions.
pub fn unit_ball_volume(d: usize) -> f64 {
    match d {
        0 => 1.0,
        1 => 2.0,
        _ => unit_ball_volume(d - 2) * 2.0 * std::f64::consts::PI / d as f64,
    }
}

/// Per-label colour-match confidence for live pixels.
#[derive(Debug, Clone)]
pub struct DensityPredictor<C = Identity> {
    k: usize,
    max_fraction: usize,
    correction: C,
}

impl DensityPredictor<Identity> {
    pub fn new(config: &PredictionConfig) -> Self {
        Self::with_correction(config, Identity)
    }
}

impl<C: ColorCorrection> DensityPredictor<C> {
    pub fn with_correction(config: &PredictionConfig, correction: C) -> Self {
        Self {
            k: config.k.max(1),
            max_fraction: config.max_fraction.max(1),
            correction,
        }
    }

    pub fn correct(&self, color: ColorVector) -> ColorVector {
        self.correction.correct(color)
    }

    /// Neighbours used for an index of `n` samples: `min(k, max(1, n / max_fraction))`.
    pub fn effective_k(&self, n: usize) -> usize {
        self.k.min((n / self.max_fraction).max(1))
    }

    /// Unnormalised kNN density at `point`. `None` for an empty index,
    /// `f64::INFINITY` when the k-th neighbour sits exactly on the point.
    pub fn density<const D: usize>(
        &self,
        index: &SpatialIndex<D>,
        point: &[f64; D],
    ) -> Option<f64> {
        let n = index.len();
        let k = self.effective_k(n);
        let kth = index.query(point, k).last()?.distance;
        let volume = unit_ball_volume(D) * kth.powi(D as i32);
        Some(k as f64 / n as f64 / volume)
    }

    /// Confidence for each label in `labels`, in the same order.
    ///
    /// Labels without an index (or with an empty one) score 0.0. The rest are
    /// divided by the largest density; if any density is infinite, those
    /// labels score 1.0 and all others 0.0.
    pub fn confidences(
        &self,
        labels: &[ColorLabel],
        indexes: &BTreeMap<ColorLabel, SpatialIndex<3>>,
        color: ColorVector,
    ) -> Vec<f64> {
        let point = self.correction.correct(color);
        let densities: Vec<Option<f64>> = labels
            .iter()
            .map(|label| indexes.get(label).and_then(|idx| self.density(idx, &point)))
            .collect();
        normalize(&densities)
    }
}

fn normalize(densities: &[Option<f64>]) -> Vec<f64> {
    if densities.iter().flatten().any(|d| d.is_infinite()) {
        return densities
            .iter()
            .map(|d| if d.is_some_and(f64::is_infinite) { 1.0 } else { 0.0 })
            .collect();
    }
    let max = densities.iter().flatten().copied().fold(0.0, f64::max);
    densities
        .iter()
        .map(|d| match d {
            Some(d) if max > 0.0 => (d / max).clamp(0.0, 1.0),
            _ => 0.0,
        })
        .collect()
}

/// Reservoir seed for one tile, so tiles are sampled independently but
/// reproducibly.
pub fn tile_seed(seed: u64, tile: TileId) -> u64 {
    seed ^ u64::from(tile.0).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Keep at most `limit` items, chosen by seeded reservoir sampling. Kept items
/// retain their original relative order. `None` keeps everything.
pub fn subsample<T: Clone>(items: &[T], limit: Option<usize>, seed: u64) -> Vec<T> {
    let Some(limit) = limit.filter(|&l| l < items.len()) else {
        return items.to_vec();
    };
    let mut rng = StdRng::seed_from_u64(seed);
    let mut reservoir: Vec<usize> = (0..limit).collect();
    for i in limit..items.len() {
        let j = rng.random_range(0..=i);
        if j < limit {
            reservoir[j] = i;
        }
    }
    reservoir.sort_unstable();
    reservoir.into_iter().map(|i| items[i].clone()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
