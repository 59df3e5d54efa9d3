//! Per-pixel significance scoring of candidate tile assignments.
//!
//! For each candidate tile, the pixel's observations under that candidate are
//! grouped by the colour the tile showed in each frame. If the pixel really
//! belongs to the tile, group membership explains most of the colour variance
//! and the one-way ANOVA rejects "no relationship" with a small p-value.
//! The candidate with the lowest p-value is the current best match.

use std::collections::{BTreeMap, BTreeSet};

use chromacal_stats::{evidence_decades, one_way_anova};

use crate::config::CalibrationConfig;
use crate::store::{Observation, SampleStore};
use crate::types::{ColorLabel, ColorVector, PixelId, TileId};

/// Relative F-statistic difference under which two underflowed p-values are
/// considered equal.
const F_TIE_RELATIVE: f64 = 1e-9;

/// Test outcome for one candidate tile.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScore {
    pub tile: TileId,
    pub p_value: f64,
    pub f_statistic: f64,
    /// `1 - p_value`, clamped to `[0, 1]`.
    pub confidence: f64,
    /// Distinct reference colours seen under this candidate.
    pub groups: usize,
    pub observations: usize,
    /// Whether an F test could be run (at least two colour groups and
    /// residual degrees of freedom).
    pub tested: bool,
}

/// Result of evaluating one pixel.
#[derive(Debug, Clone, PartialEq)]
pub enum Significance {
    /// Fewer than two sessions, or no candidate with two colour groups yet.
    InsufficientData,
    /// The leading candidates cannot be told apart.
    Ambiguous {
        candidates: Vec<TileId>,
        scores: Vec<CandidateScore>,
    },
    /// A single strongest candidate. `scores` is sorted best first.
    Best {
        best: CandidateScore,
        scores: Vec<CandidateScore>,
    },
}

impl Significance {
    pub fn best(&self) -> Option<&CandidateScore> {
        match self {
            Self::Best { best, .. } => Some(best),
            _ => None,
        }
    }

    pub fn scores(&self) -> &[CandidateScore] {
        match self {
            Self::InsufficientData => &[],
            Self::Ambiguous { scores, .. } | Self::Best { scores, .. } => scores,
        }
    }
}

/// Scores candidate tiles for a pixel from its accumulated observations.
#[derive(Debug, Clone)]
pub struct SignificanceEngine {
    tie_tolerance: f64,
}

impl SignificanceEngine {
    /// `tie_tolerance` is measured in decades of p-value.
    pub fn new(tie_tolerance: f64) -> Self {
        Self { tie_tolerance }
    }

    pub fn from_config(config: &CalibrationConfig) -> Self {
        Self::new(config.tie_tolerance)
    }

    /// Evaluate a pixel straight from the store.
    pub fn evaluate_pixel(&self, store: &SampleStore, pixel: PixelId) -> Significance {
        self.evaluate(&store.query_by_pixel(pixel))
    }

    /// Evaluate one pixel's observations (all must share the same pixel id).
    pub fn evaluate(&self, observations: &[&Observation]) -> Significance {
        let sessions: BTreeSet<_> = observations.iter().map(|o| o.session_id).collect();
        if sessions.len() < 2 {
            return Significance::InsufficientData;
        }

        let mut by_candidate: BTreeMap<TileId, BTreeMap<&ColorLabel, Vec<ColorVector>>> =
            BTreeMap::new();
        for obs in observations {
            by_candidate
                .entry(obs.tile_candidate_id)
                .or_default()
                .entry(&obs.reference_label)
                .or_default()
                .push(obs.color_vector);
        }

        // Only one tile was ever declared: nothing to discriminate against.
        let declared: Vec<_> = by_candidate.iter().collect();
        if let &[(&tile, groups)] = declared.as_slice() {
            let best = CandidateScore {
                tile,
                p_value: 0.0,
                f_statistic: f64::INFINITY,
                confidence: 1.0,
                groups: groups.len(),
                observations: groups.values().map(Vec::len).sum(),
                tested: false,
            };
            return Significance::Best {
                scores: vec![best.clone()],
                best,
            };
        }

        let mut scores: Vec<CandidateScore> = by_candidate
            .into_iter()
            .map(|(tile, groups)| {
                let observations = groups.values().map(Vec::len).sum();
                let groups: Vec<Vec<ColorVector>> = groups.into_values().collect();
                match one_way_anova(&groups) {
                    Some(test) => CandidateScore {
                        tile,
                        p_value: test.p_value,
                        f_statistic: test.f_statistic,
                        confidence: test.confidence(),
                        groups: groups.len(),
                        observations,
                        tested: true,
                    },
                    None => CandidateScore {
                        tile,
                        p_value: 1.0,
                        f_statistic: 0.0,
                        confidence: 0.0,
                        groups: groups.len(),
                        observations,
                        tested: false,
                    },
                }
            })
            .collect();

        if scores.iter().all(|s| !s.tested) {
            return Significance::InsufficientData;
        }

        scores.sort_by(|a, b| {
            a.p_value
                .total_cmp(&b.p_value)
                .then(b.f_statistic.total_cmp(&a.f_statistic))
                .then(a.tile.cmp(&b.tile))
        });

        let tied: Vec<TileId> = scores
            .iter()
            .skip(1)
            .take_while(|s| self.indistinguishable(&scores[0], s))
            .map(|s| s.tile)
            .collect();

        if tied.is_empty() {
            Significance::Best {
                best: scores[0].clone(),
                scores,
            }
        } else {
            let mut candidates = vec![scores[0].tile];
            candidates.extend(tied);
            Significance::Ambiguous { candidates, scores }
        }
    }

    fn indistinguishable(&self, a: &CandidateScore, b: &CandidateScore) -> bool {
        let floored = |p: f64| p < f64::MIN_POSITIVE;
        if floored(a.p_value) && floored(b.p_value) {
            if a.f_statistic.is_infinite() || b.f_statistic.is_infinite() {
                return a.f_statistic == b.f_statistic;
            }
            let scale = a.f_statistic.abs().max(b.f_statistic.abs()).max(1.0);
            return (a.f_statistic - b.f_statistic).abs() / scale < F_TIE_RELATIVE;
        }
        (evidence_decades(a.p_value) - evidence_decades(b.p_value)).abs() < self.tie_tolerance
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
