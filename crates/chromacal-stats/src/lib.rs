//! Significance tests used during pixel calibration.
//!
//! Provides a multichannel one-way analysis of variance over colour samples.
//! Every test returns an [`FTestResult`] with the F statistic, its degrees of
//! freedom and a p-value from the F distribution. Degenerate input (fewer than
//! two groups, no residual degrees of freedom) yields `None` rather than an
//! error, so callers can treat it as "not enough data yet".

use statrs::distribution::{ContinuousCDF, FisherSnedecor};

// ═══════════════════════════════════════════════════════════════════════════════
// Core types
// ═══════════════════════════════════════════════════════════════════════════════

/// Below this a sum of squares is treated as zero.
const SS_EPSILON: f64 = 1e-12;

/// Result of a one-way ANOVA F test.
#[derive(Debug, Clone, PartialEq)]
pub struct FTestResult {
    pub f_statistic: f64,
    pub p_value: f64,
    /// Between-group degrees of freedom, `(k - 1) * D`.
    pub df_between: f64,
    /// Within-group degrees of freedom, `(n - k) * D`.
    pub df_within: f64,
    pub ss_between: f64,
    pub ss_within: f64,
    /// Number of non-empty groups that entered the test.
    pub groups: usize,
    pub observations: usize,
}

impl FTestResult {
    /// Whether the null hypothesis ("group membership explains nothing") is
    /// rejected at significance level `alpha`.
    pub fn is_significant(&self, alpha: f64) -> bool {
        self.p_value < alpha
    }

    /// `1 - p`, clamped to `[0, 1]`.
    pub fn confidence(&self) -> f64 {
        (1.0 - self.p_value).clamp(0.0, 1.0)
    }

    /// Strength of evidence in decades, see [`evidence_decades`].
    pub fn evidence(&self) -> f64 {
        evidence_decades(self.p_value)
    }
}

/// Per-group mean and size.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSummary<const D: usize> {
    pub n: usize,
    pub mean: [f64; D],
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Componentwise mean of a non-empty slice of vectors.
pub fn mean<const D: usize>(samples: &[[f64; D]]) -> Option<[f64; D]> {
    if samples.is_empty() {
        return None;
    }
    let mut acc = [0.0; D];
    for sample in samples {
        for (a, v) in acc.iter_mut().zip(sample) {
            *a += v;
        }
    }
    let n = samples.len() as f64;
    for a in &mut acc {
        *a /= n;
    }
    Some(acc)
}

/// Summarise each non-empty group.
pub fn summarize<const D: usize, G: AsRef<[[f64; D]]>>(groups: &[G]) -> Vec<GroupSummary<D>> {
    groups
        .iter()
        .filter_map(|g| {
            let g = g.as_ref();
            mean(g).map(|m| GroupSummary { n: g.len(), mean: m })
        })
        .collect()
}

/// `-log10(p)`, with `p` floored at the smallest positive normal `f64` so
/// that underflowed p-values stay finite.
pub fn evidence_decades(p: f64) -> f64 {
    -p.max(f64::MIN_POSITIVE).log10()
}

fn squared_distance<const D: usize>(a: &[f64; D], b: &[f64; D]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

// ═══════════════════════════════════════════════════════════════════════════════
// ANOVA
// ═══════════════════════════════════════════════════════════════════════════════

/// Multichannel one-way ANOVA.
///
/// Sums of squares are pooled across the `D` channels and the degrees of
/// freedom are scaled by `D`, treating each channel as an independent
/// replicate of the same design. Empty groups are ignored.
///
/// Returns `None` when fewer than two non-empty groups remain or when there
/// are no residual degrees of freedom (`n <= k`).
///
/// When the within-group scatter is zero the test is decided exactly: any
/// between-group separation gives `F = inf, p = 0`, none gives `F = 0, p = 1`.
pub fn one_way_anova<const D: usize, G: AsRef<[[f64; D]]>>(groups: &[G]) -> Option<FTestResult> {
    let summaries = summarize(groups);
    let k = summaries.len();
    let n: usize = summaries.iter().map(|s| s.n).sum();
    if k < 2 || n <= k || D == 0 {
        return None;
    }

    let mut grand = [0.0; D];
    for s in &summaries {
        for (g, m) in grand.iter_mut().zip(&s.mean) {
            *g += m * s.n as f64;
        }
    }
    for g in &mut grand {
        *g /= n as f64;
    }

    let ss_between: f64 = summaries
        .iter()
        .map(|s| s.n as f64 * squared_distance(&s.mean, &grand))
        .sum();

    let ss_within: f64 = groups
        .iter()
        .map(|g| g.as_ref())
        .filter(|g| !g.is_empty())
        .zip(&summaries)
        .map(|(g, s)| g.iter().map(|x| squared_distance(x, &s.mean)).sum::<f64>())
        .sum();

    let df_between = ((k - 1) * D) as f64;
    let df_within = ((n - k) * D) as f64;

    let (f_statistic, p_value) = if ss_within <= SS_EPSILON {
        if ss_between > SS_EPSILON {
            (f64::INFINITY, 0.0)
        } else {
            (0.0, 1.0)
        }
    } else {
        let f = (ss_between / df_between) / (ss_within / df_within);
        let dist = FisherSnedecor::new(df_between, df_within).ok()?;
        (f, dist.sf(f).clamp(0.0, 1.0))
    };

    Some(FTestResult {
        f_statistic,
        p_value,
        df_between,
        df_within,
        ss_between,
        ss_within,
        groups: k,
        observations: n,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_empty() {
        let empty: [[f64; 3]; 0] = [];
        assert!(mean(&empty).is_none());
    }

    #[test]
    fn test_mean_componentwise() {
        let m = mean(&[[0.0, 2.0], [2.0, 4.0]]).unwrap();
        assert_eq!(m, [1.0, 3.0]);
    }

    #[test]
    fn test_textbook_anova() {
        // Means 2 and 5, grand mean 3.5: SSB = 13.5, SSW = 4, F(1, 4) = 13.5.
        let groups = vec![vec![[1.0], [2.0], [3.0]], vec![[4.0], [5.0], [6.0]]];
        let r = one_way_anova(&groups).unwrap();
        assert!((r.ss_between - 13.5).abs() < 1e-12);
        assert!((r.ss_within - 4.0).abs() < 1e-12);
        assert!((r.f_statistic - 13.5).abs() < 1e-9);
        assert_eq!(r.df_between, 1.0);
        assert_eq!(r.df_within, 4.0);
        assert!(r.p_value > 0.02 && r.p_value < 0.023, "p = {}", r.p_value);
        assert!(r.is_significant(0.05));
        assert!(!r.is_significant(0.01));
    }

    #[test]
    fn test_single_group_is_none() {
        let groups = vec![vec![[1.0, 1.0, 1.0], [1.1, 0.9, 1.0]]];
        assert!(one_way_anova(&groups).is_none());
    }

    #[test]
    fn test_no_residual_dof_is_none() {
        let groups = vec![vec![[1.0]], vec![[2.0]]];
        assert!(one_way_anova(&groups).is_none());
    }

    #[test]
    fn test_empty_groups_ignored() {
        let groups: Vec<Vec<[f64; 1]>> = vec![vec![], vec![[1.0], [2.0]], vec![[8.0], [9.0]]];
        let r = one_way_anova(&groups).unwrap();
        assert_eq!(r.groups, 2);
        assert_eq!(r.observations, 4);
    }

    #[test]
    fn test_perfect_separation() {
        let groups = vec![vec![[1.0, 0.2, 0.2]; 3], vec![[0.2, 0.5, 1.0]; 2]];
        let r = one_way_anova(&groups).unwrap();
        assert!(r.f_statistic.is_infinite());
        assert_eq!(r.p_value, 0.0);
        assert_eq!(r.confidence(), 1.0);
    }

    #[test]
    fn test_identical_groups() {
        let groups = vec![vec![[0.5; 3]; 3], vec![[0.5; 3]; 3]];
        let r = one_way_anova(&groups).unwrap();
        assert_eq!(r.f_statistic, 0.0);
        assert_eq!(r.p_value, 1.0);
    }

    #[test]
    fn test_channels_scale_dof() {
        let groups = vec![
            vec![[1.0, 1.0, 1.0], [1.2, 0.9, 1.1], [0.9, 1.1, 1.0]],
            vec![[0.1, 0.2, 0.1], [0.2, 0.1, 0.2]],
        ];
        let r = one_way_anova(&groups).unwrap();
        assert_eq!(r.df_between, 3.0);
        assert_eq!(r.df_within, 9.0);
        assert!(r.p_value < 1e-4);
    }

    #[test]
    fn test_overlapping_groups_not_significant() {
        let groups = vec![
            vec![[0.50], [0.55], [0.45], [0.52]],
            vec![[0.48], [0.53], [0.47], [0.51]],
        ];
        let r = one_way_anova(&groups).unwrap();
        assert!(r.p_value > 0.5, "p = {}", r.p_value);
    }

    #[test]
    fn test_evidence_decades() {
        assert!((evidence_decades(0.01) - 2.0).abs() < 1e-12);
        assert!(evidence_decades(0.0).is_finite());
        assert_eq!(evidence_decades(1.0), 0.0);
    }
}
