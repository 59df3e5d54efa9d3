//! Hierarchical spatial partition over colour space with exact kNN queries.
//!
//! `SpatialIndex<D>` splits an axis-aligned box into `2^D` equal orthants
//! (a quadtree for `D = 2`, an octree for `D = 3`) whenever a leaf holds more
//! than `capacity` samples. Queries walk nodes best-first by the distance from
//! the query point to each node's bounding box and stop once no unvisited node
//! can hold anything closer than the current k-th neighbour.
//!
//! Results are ordered by ascending Euclidean distance, ties broken by
//! insertion order, so identical index state and query always give identical
//! output.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::config::IndexConfig;
use crate::types::{ColorLabel, TileId};

/// One indexed colour sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorSample<const D: usize> {
    pub point: [f64; D],
    pub tile: TileId,
    pub label: ColorLabel,
}

/// A query hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor<'a, const D: usize> {
    pub sample: &'a ColorSample<D>,
    pub distance: f64,
    /// Insertion position of the sample in the index.
    pub seq: usize,
}

#[derive(Debug, Clone)]
enum NodeKind {
    /// Sample positions, in insertion order.
    Leaf(Vec<usize>),
    /// Node positions of the `2^D` children, indexed by orthant bits.
    Branch(Vec<usize>),
}

#[derive(Debug, Clone)]
struct Node<const D: usize> {
    lo: [f64; D],
    hi: [f64; D],
    depth: usize,
    kind: NodeKind,
}

impl<const D: usize> Node<D> {
    fn leaf(lo: [f64; D], hi: [f64; D], depth: usize) -> Self {
        Self {
            lo,
            hi,
            depth,
            kind: NodeKind::Leaf(Vec::new()),
        }
    }

    fn contains(&self, p: &[f64; D]) -> bool {
        (0..D).all(|i| p[i] >= self.lo[i] && p[i] <= self.hi[i])
    }

    fn mid(&self) -> [f64; D] {
        std::array::from_fn(|i| 0.5 * (self.lo[i] + self.hi[i]))
    }

    fn orthant(&self, p: &[f64; D]) -> usize {
        let mid = self.mid();
        (0..D).fold(0, |acc, i| if p[i] >= mid[i] { acc | (1 << i) } else { acc })
    }

    /// Squared distance from `p` to the closest point of the box.
    fn min_dist2(&self, p: &[f64; D]) -> f64 {
        (0..D)
            .map(|i| {
                let d = if p[i] < self.lo[i] {
                    self.lo[i] - p[i]
                } else if p[i] > self.hi[i] {
                    p[i] - self.hi[i]
                } else {
                    0.0
                };
                d * d
            })
            .sum()
    }
}

/// Exact kNN index over `D`-dimensional colour samples.
#[derive(Debug, Clone)]
pub struct SpatialIndex<const D: usize> {
    samples: Vec<ColorSample<D>>,
    nodes: Vec<Node<D>>,
    capacity: usize,
    max_depth: usize,
}

impl<const D: usize> SpatialIndex<D> {
    /// An empty index.
    pub fn new(config: &IndexConfig) -> Self {
        Self {
            samples: Vec::new(),
            nodes: vec![Node::leaf([0.0; D], [0.0; D], 0)],
            capacity: config.capacity.max(1),
            max_depth: config.max_depth,
        }
    }

    /// Batch-build an index. Samples with non-finite coordinates are skipped.
    pub fn build(samples: impl IntoIterator<Item = ColorSample<D>>, config: &IndexConfig) -> Self {
        let mut index = Self::new(config);
        let mut skipped = 0usize;
        index.samples = samples
            .into_iter()
            .filter(|s| {
                let ok = finite(&s.point);
                skipped += usize::from(!ok);
                ok
            })
            .collect();
        if skipped > 0 {
            log::warn!("spatial index: skipped {skipped} non-finite samples");
        }
        index.rebuild();
        index
    }

    /// Add one sample. Returns `false` (and indexes nothing) for a non-finite
    /// point. A point outside the current root box triggers a rebuild.
    pub fn insert(&mut self, sample: ColorSample<D>) -> bool {
        if !finite(&sample.point) {
            return false;
        }
        let point = sample.point;
        let seq = self.samples.len();
        self.samples.push(sample);
        if seq > 0 && self.nodes[0].contains(&point) {
            self.place(0, seq);
        } else {
            self.rebuild();
        }
        true
    }

    fn rebuild(&mut self) {
        let (lo, hi) = bounds(&self.samples);
        self.nodes.clear();
        self.nodes.push(Node::leaf(lo, hi, 0));
        for seq in 0..self.samples.len() {
            self.place(0, seq);
        }
    }

    /// Route sample `seq` down from `node` to a leaf, splitting if needed.
    fn place(&mut self, mut node: usize, seq: usize) {
        let point = self.samples[seq].point;
        loop {
            let orthant = self.nodes[node].orthant(&point);
            match &mut self.nodes[node].kind {
                NodeKind::Branch(children) => node = children[orthant],
                NodeKind::Leaf(entries) => {
                    entries.push(seq);
                    let overfull = entries.len() > self.capacity;
                    if overfull && self.nodes[node].depth < self.max_depth {
                        self.split(node);
                    }
                    return;
                }
            }
        }
    }

    fn split(&mut self, node: usize) {
        if !matches!(self.nodes[node].kind, NodeKind::Leaf(_)) {
            return;
        }
        let placeholder = NodeKind::Branch(Vec::new());
        let NodeKind::Leaf(entries) = std::mem::replace(&mut self.nodes[node].kind, placeholder)
        else {
            return;
        };
        let (lo, hi, depth) = {
            let n = &self.nodes[node];
            (n.lo, n.hi, n.depth)
        };
        let mid = self.nodes[node].mid();

        let first = self.nodes.len();
        for orthant in 0..(1usize << D) {
            let mut clo = lo;
            let mut chi = hi;
            for i in 0..D {
                if orthant & (1 << i) != 0 {
                    clo[i] = mid[i];
                } else {
                    chi[i] = mid[i];
                }
            }
            self.nodes.push(Node::leaf(clo, chi, depth + 1));
        }
        let children: Vec<usize> = (first..self.nodes.len()).collect();
        self.nodes[node].kind = NodeKind::Branch(children);

        // Entries are re-placed in insertion order, so leaves stay sorted.
        for seq in entries {
            self.place(node, seq);
        }
    }

    /// The `k` nearest samples to `point`, nearest first.
    pub fn query(&self, point: &[f64; D], k: usize) -> Vec<Neighbor<'_, D>> {
        if k == 0 || self.samples.is_empty() {
            return Vec::new();
        }

        let mut best: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        let mut frontier: BinaryHeap<std::cmp::Reverse<Candidate>> = BinaryHeap::new();
        frontier.push(std::cmp::Reverse(Candidate {
            dist2: self.nodes[0].min_dist2(point),
            seq: 0,
        }));

        while let Some(std::cmp::Reverse(Candidate { dist2, seq: node })) = frontier.pop() {
            if best.len() == k && best.peek().is_some_and(|worst| dist2 > worst.dist2) {
                break;
            }
            match &self.nodes[node].kind {
                NodeKind::Branch(children) => {
                    for &child in children {
                        frontier.push(std::cmp::Reverse(Candidate {
                            dist2: self.nodes[child].min_dist2(point),
                            seq: child,
                        }));
                    }
                }
                NodeKind::Leaf(entries) => {
                    for &seq in entries {
                        let candidate = Candidate {
                            dist2: dist2_between(point, &self.samples[seq].point),
                            seq,
                        };
                        if best.len() < k {
                            best.push(candidate);
                        } else if best.peek().is_some_and(|worst| candidate < *worst) {
                            best.pop();
                            best.push(candidate);
                        }
                    }
                }
            }
        }

        best.into_sorted_vec()
            .into_iter()
            .map(|c| Neighbor {
                sample: &self.samples[c.seq],
                distance: c.dist2.sqrt(),
                seq: c.seq,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples in insertion order.
    pub fn samples(&self) -> &[ColorSample<D>] {
        &self.samples
    }

    /// Deepest node level currently in use.
    pub fn depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Leaf(_)))
            .count()
    }
}

/// `(squared distance, position)` ordered lexicographically. Used both for
/// samples and for frontier nodes.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    dist2: f64,
    seq: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist2
            .total_cmp(&other.dist2)
            .then(self.seq.cmp(&other.seq))
    }
}

fn finite<const D: usize>(p: &[f64; D]) -> bool {
    p.iter().all(|c| c.is_finite())
}

fn dist2_between<const D: usize>(a: &[f64; D], b: &[f64; D]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn bounds<const D: usize>(samples: &[ColorSample<D>]) -> ([f64; D], [f64; D]) {
    let Some(first) = samples.first() else {
        return ([0.0; D], [0.0; D]);
    };
    let mut lo = first.point;
    let mut hi = first.point;
    for s in &samples[1..] {
        for i in 0..D {
            lo[i] = lo[i].min(s.point[i]);
            hi[i] = hi[i].max(s.point[i]);
        }
    }
    (lo, hi)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sample<const D: usize>(point: [f64; D]) -> ColorSample<D> {
        ColorSample {
            point,
            tile: TileId(0),
            label: ColorLabel::from("red"),
        }
    }

    fn brute_force<const D: usize>(
        samples: &[ColorSample<D>],
        q: &[f64; D],
        k: usize,
    ) -> Vec<usize> {
        let mut all: Vec<(f64, usize)> = samples
            .iter()
            .enumerate()
            .map(|(i, s)| (dist2_between(q, &s.point), i))
            .collect();
        all.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        all.into_iter().take(k).map(|(_, i)| i).collect()
    }

    #[test]
    fn test_quadtree_three_nearest() {
        let points = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [5.0, 5.0], [6.0, 6.0]];
        let config = IndexConfig {
            capacity: 1,
            max_depth: 8,
        };
        let index = SpatialIndex::build(points.map(sample), &config);
        let hits: Vec<[f64; 2]> = index
            .query(&[0.5, 0.5], 3)
            .iter()
            .map(|n| n.sample.point)
            .collect();
        // All three are at distance sqrt(0.5); insertion order decides.
        assert_eq!(hits, vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]);
        assert!(index.leaf_count() > 1);
    }

    #[test]
    fn test_octree_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(7);
        let samples: Vec<ColorSample<3>> = (0..500)
            .map(|_| sample([rng.random(), rng.random(), rng.random()]))
            .collect();
        let index = SpatialIndex::build(samples.clone(), &IndexConfig::default());
        for _ in 0..50 {
            let q = [rng.random(), rng.random(), rng.random()];
            for k in [1, 5, 17] {
                let got: Vec<usize> = index.query(&q, k).iter().map(|n| n.seq).collect();
                assert_eq!(got, brute_force(&samples, &q, k));
            }
        }
    }

    #[test]
    fn test_distances_ascending() {
        let mut rng = StdRng::seed_from_u64(11);
        let index = SpatialIndex::build(
            (0..200).map(|_| sample([rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0)])),
            &IndexConfig::default(),
        );
        let hits = index.query(&[0.1, -0.2], 25);
        assert_eq!(hits.len(), 25);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_query_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(3);
        let samples: Vec<_> = (0..300)
            .map(|_| sample([rng.random(), rng.random(), rng.random()]))
            .collect();
        let a = SpatialIndex::build(samples.clone(), &IndexConfig::default());
        let b = SpatialIndex::build(samples, &IndexConfig::default());
        let q = [0.4, 0.4, 0.6];
        assert_eq!(a.query(&q, 10), a.query(&q, 10));
        assert_eq!(a.query(&q, 10), b.query(&q, 10));
    }

    #[test]
    fn test_duplicates_stop_at_max_depth() {
        let config = IndexConfig {
            capacity: 2,
            max_depth: 4,
        };
        let index = SpatialIndex::build((0..50).map(|_| sample([0.3, 0.3, 0.3])), &config);
        assert_eq!(index.len(), 50);
        assert!(index.depth() <= 4);
        let hits = index.query(&[0.3, 0.3, 0.3], 5);
        let seqs: Vec<usize> = hits.iter().map(|n| n.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_k_larger_than_index() {
        let index = SpatialIndex::build(
            [sample([0.0, 0.0]), sample([1.0, 1.0])],
            &IndexConfig::default(),
        );
        assert_eq!(index.query(&[0.0, 0.0], 10).len(), 2);
        assert!(index.query(&[0.0, 0.0], 0).is_empty());
        assert!(SpatialIndex::<2>::new(&IndexConfig::default()).query(&[0.0, 0.0], 3).is_empty());
    }

    #[test]
    fn test_insert_matches_build() {
        let mut rng = StdRng::seed_from_u64(21);
        let samples: Vec<_> = (0..120)
            .map(|_| sample([rng.random(), rng.random(), rng.random()]))
            .collect();
        let config = IndexConfig {
            capacity: 4,
            max_depth: 12,
        };
        let built = SpatialIndex::build(samples.clone(), &config);
        let mut grown = SpatialIndex::new(&config);
        for s in samples.clone() {
            assert!(grown.insert(s));
        }
        // Points outside the root box force a rebuild, inside ones descend.
        assert!(grown.insert(sample([2.0, 2.0, 2.0])));
        assert!(!grown.insert(sample([f64::NAN, 0.0, 0.0])));
        assert_eq!(grown.len(), 121);

        let q = [0.5, 0.5, 0.5];
        let a: Vec<usize> = built.query(&q, 8).iter().map(|n| n.seq).collect();
        let b: Vec<usize> = grown.query(&q, 8).iter().map(|n| n.seq).collect();
        assert_eq!(a, b);
        let far = grown.query(&[2.0, 2.0, 2.0], 1);
        assert_eq!(far[0].seq, 120);
    }

    #[test]
    fn test_build_skips_non_finite() {
        let index = SpatialIndex::build(
            [sample([0.0, 0.0]), sample([f64::INFINITY, 1.0]), sample([1.0, 1.0])],
            &IndexConfig::default(),
        );
        assert_eq!(index.len(), 2);
    }
}
