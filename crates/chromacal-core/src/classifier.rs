//! Per-tile colour indexes built from finalized pixels, and live prediction.
//!
//! The [`Classifier`] keeps one [`TileIndex`] per tile in an [`IndexRegistry`].
//! A tile's index holds one [`SpatialIndex`] per colour label, filled with the
//! calibration colours of every pixel finalized on that tile. Indexes are
//! immutable once published: [`Classifier::sync`] builds replacements off to
//! the side (in parallel across tiles) and swaps them in, so predictions that
//! are already running keep using the previous snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::aggregate::ConfidenceAggregator;
use crate::config::ChromacalConfig;
use crate::density::{ColorCorrection, DensityPredictor, Identity, subsample, tile_seed};
use crate::refiner::Refiner;
use crate::spatial::{ColorSample, SpatialIndex};
use crate::store::SampleStore;
use crate::types::{ColorLabel, ColorVector, PixelId, TileId};

/// Colour samples of one tile, split by label.
#[derive(Debug)]
pub struct TileIndex {
    pub tile: TileId,
    /// Finalized pixels on this tile, ascending.
    pub pixels: Vec<PixelId>,
    indexes: BTreeMap<ColorLabel, SpatialIndex<3>>,
    samples: usize,
}

impl TileIndex {
    pub fn labels(&self) -> impl Iterator<Item = &ColorLabel> {
        self.indexes.keys()
    }

    pub fn index(&self, label: &ColorLabel) -> Option<&SpatialIndex<3>> {
        self.indexes.get(label)
    }

    /// Total samples across labels.
    pub fn sample_count(&self) -> usize {
        self.samples
    }
}

/// Published tile indexes. Readers clone the `Arc` and drop the lock
/// immediately; a rebuild replaces the whole entry.
#[derive(Debug, Default)]
pub struct IndexRegistry {
    tiles: RwLock<HashMap<TileId, Arc<TileIndex>>>,
}

impl IndexRegistry {
    pub fn get(&self, tile: TileId) -> Option<Arc<TileIndex>> {
        let tiles = self.tiles.read().unwrap_or_else(|p| p.into_inner());
        tiles.get(&tile).cloned()
    }

    /// Every published index, ordered by tile.
    pub fn snapshot(&self) -> Vec<Arc<TileIndex>> {
        let tiles = self.tiles.read().unwrap_or_else(|p| p.into_inner());
        let mut all: Vec<Arc<TileIndex>> = tiles.values().cloned().collect();
        drop(tiles);
        all.sort_by_key(|t| t.tile);
        all
    }

    fn publish(&self, index: TileIndex) {
        let mut tiles = self.tiles.write().unwrap_or_else(|p| p.into_inner());
        tiles.insert(index.tile, Arc::new(index));
    }

    fn retain(&self, keep: impl Fn(&TileId) -> bool) {
        let mut tiles = self.tiles.write().unwrap_or_else(|p| p.into_inner());
        tiles.retain(|t, _| keep(t));
    }

    pub fn len(&self) -> usize {
        self.tiles.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a [`Classifier::sync`] call changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub rebuilt: Vec<TileId>,
    pub unchanged: usize,
    pub removed: usize,
}

/// Confidence that one tile shows one colour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub tile_id: TileId,
    pub color_label: ColorLabel,
    /// One entry per pixel considered, in ascending pixel order.
    pub per_pixel_confidences: Vec<f64>,
    pub aggregated_confidence: f64,
    /// The tile has no calibration samples for this label, or no pixels were
    /// available; `aggregated_confidence` is 0.0 and carries no information.
    pub no_evidence: bool,
}

/// All label confidences for one tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileReport {
    pub tile_id: TileId,
    /// Pixels that entered prediction after filtering and subsampling.
    pub pixels: Vec<PixelId>,
    /// One result per known label, in label order.
    pub results: Vec<PredictionResult>,
}

impl TileReport {
    /// `(label, aggregated_confidence)` pairs handed to the matching step.
    pub fn matching_input(&self) -> Vec<(ColorLabel, f64)> {
        self.results
            .iter()
            .map(|r| (r.color_label.clone(), r.aggregated_confidence))
            .collect()
    }

    /// Highest aggregated confidence among labels with evidence.
    pub fn best(&self) -> Option<&PredictionResult> {
        self.results
            .iter()
            .filter(|r| !r.no_evidence)
            .max_by(|a, b| a.aggregated_confidence.total_cmp(&b.aggregated_confidence))
    }
}

/// Finalized-pixel indexes plus the predictor and aggregator that query them.
pub struct Classifier<C = Identity> {
    config: ChromacalConfig,
    registry: IndexRegistry,
    labels: RwLock<Vec<ColorLabel>>,
    predictor: DensityPredictor<C>,
    aggregator: ConfidenceAggregator,
}

impl Classifier<Identity> {
    pub fn new(config: &ChromacalConfig) -> Self {
        Self::with_correction(config, Identity)
    }
}

impl<C: ColorCorrection> Classifier<C> {
    /// Apply `correction` to calibration samples and live colours alike.
    pub fn with_correction(config: &ChromacalConfig, correction: C) -> Self {
        Self {
            config: config.clone(),
            registry: IndexRegistry::default(),
            labels: RwLock::new(Vec::new()),
            predictor: DensityPredictor::with_correction(&config.prediction, correction),
            aggregator: ConfidenceAggregator::from_config(&config.prediction),
        }
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    /// Labels every report covers.
    pub fn labels(&self) -> Vec<ColorLabel> {
        self.labels.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Rebuild the indexes of tiles whose finalized pixels or samples changed
    /// since the last sync. Only `Finalized` assignments are ever indexed.
    pub fn sync(&self, store: &SampleStore, refiner: &Refiner) -> SyncReport {
        {
            let mut labels = self.labels.write().unwrap_or_else(|p| p.into_inner());
            *labels = store.labels().into_iter().collect();
        }

        let finalized = refiner.finalized_by_tile();
        let mut report = SyncReport::default();
        let mut stale: Vec<(TileId, Vec<PixelId>, Vec<ColorSample<3>>)> = Vec::new();

        for (tile, pixels) in &finalized {
            let samples = self.collect_samples(store, *tile, pixels);
            let current = self.registry.get(*tile);
            let unchanged = current
                .as_ref()
                .is_some_and(|c| c.pixels == *pixels && c.samples == samples.len());
            if unchanged {
                report.unchanged += 1;
            } else {
                stale.push((*tile, pixels.clone(), samples));
            }
        }

        let before = self.registry.len();
        self.registry.retain(|t| finalized.contains_key(t));
        report.removed = before - self.registry.len();

        report.rebuilt = stale.iter().map(|(t, _, _)| *t).collect();
        for index in self.build_parallel(stale) {
            log::debug!(
                "published index for {}: {} pixels, {} samples, {} labels",
                index.tile,
                index.pixels.len(),
                index.samples,
                index.indexes.len()
            );
            self.registry.publish(index);
        }

        if !report.rebuilt.is_empty() || report.removed > 0 {
            log::info!(
                "index sync: {} rebuilt, {} unchanged, {} removed",
                report.rebuilt.len(),
                report.unchanged,
                report.removed
            );
        }
        report
    }

    /// A finalized pixel's observations under its own tile, colour-corrected.
    fn collect_samples(
        &self,
        store: &SampleStore,
        tile: TileId,
        pixels: &[PixelId],
    ) -> Vec<ColorSample<3>> {
        pixels
            .iter()
            .flat_map(|&p| store.query_by_pixel(p))
            .filter(|o| o.tile_candidate_id == tile)
            .map(|o| ColorSample {
                point: self.predictor.correct(o.color_vector),
                tile,
                label: o.reference_label.clone(),
            })
            .collect()
    }

    fn build_parallel(
        &self,
        work: Vec<(TileId, Vec<PixelId>, Vec<ColorSample<3>>)>,
    ) -> Vec<TileIndex> {
        let index_config = &self.config.index;
        let build = |(tile, pixels, samples): (TileId, Vec<PixelId>, Vec<ColorSample<3>>)| {
            let count = samples.len();
            let mut by_label: BTreeMap<ColorLabel, Vec<ColorSample<3>>> = BTreeMap::new();
            for sample in samples {
                by_label.entry(sample.label.clone()).or_default().push(sample);
            }
            TileIndex {
                tile,
                pixels,
                indexes: by_label
                    .into_iter()
                    .map(|(label, s)| (label, SpatialIndex::build(s, index_config)))
                    .collect(),
                samples: count,
            }
        };

        let workers = self.config.worker_count();
        if workers <= 1 || work.len() < 2 {
            return work.into_iter().map(build).collect();
        }

        let chunk_size = work.len().div_ceil(workers);
        let mut chunks: Vec<Vec<_>> = Vec::new();
        let mut work = work.into_iter().peekable();
        while work.peek().is_some() {
            chunks.push(work.by_ref().take(chunk_size).collect());
        }

        std::thread::scope(|s| {
            let handles: Vec<_> = chunks
                .into_iter()
                .map(|chunk| s.spawn(move || chunk.into_iter().map(build).collect::<Vec<_>>()))
                .collect();
            handles
                .into_iter()
                .flat_map(|h| match h.join() {
                    Ok(indexes) => indexes,
                    Err(_) => {
                        log::warn!(
                            "index build worker panicked; affected tiles keep their previous index"
                        );
                        Vec::new()
                    }
                })
                .collect()
        })
    }

    // -----------------------------------------------------------------------
    // Prediction
    // -----------------------------------------------------------------------

    /// Confidence vectors for every indexed tile, ordered by tile.
    pub fn predict(&self, image: &[ColorVector]) -> Vec<TileReport> {
        let tiles = self.registry.snapshot();
        let labels = self.labels();
        let workers = self.config.worker_count();

        if workers <= 1 || tiles.len() < 2 {
            return tiles
                .iter()
                .map(|t| self.predict_index(t.tile, Some(t), &labels, image))
                .collect();
        }

        let chunk_size = tiles.len().div_ceil(workers);
        let labels = &labels;
        std::thread::scope(|s| {
            let handles: Vec<_> = tiles
                .chunks(chunk_size)
                .map(|chunk| {
                    s.spawn(move || {
                        chunk
                            .iter()
                            .map(|t| self.predict_index(t.tile, Some(t), labels, image))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }

    /// Confidence vector for one tile. A tile without an index yields a report
    /// in which every label is flagged `no_evidence`.
    pub fn predict_tile(&self, tile: TileId, image: &[ColorVector]) -> TileReport {
        let index = self.registry.get(tile);
        self.predict_index(tile, index.as_ref(), &self.labels(), image)
    }

    fn predict_index(
        &self,
        tile: TileId,
        index: Option<&Arc<TileIndex>>,
        labels: &[ColorLabel],
        image: &[ColorVector],
    ) -> TileReport {
        let empty = BTreeMap::new();
        let indexes = index.map_or(&empty, |i| &i.indexes);
        let all_pixels = index.map_or(&[][..], |i| &i.pixels[..]);

        let usable: Vec<PixelId> = all_pixels
            .iter()
            .copied()
            .filter(|p| {
                let ok = image.get(p.index()).is_some_and(|c| c.iter().all(|v| v.is_finite()));
                if !ok {
                    log::warn!("{tile}: skipping {p}, missing or non-finite in live image");
                }
                ok
            })
            .collect();
        let p = &self.config.prediction;
        let pixels = subsample(&usable, p.max_pixels_per_tile, tile_seed(p.seed, tile));

        let mut per_label: Vec<Vec<f64>> = vec![Vec::with_capacity(pixels.len()); labels.len()];
        for pixel in &pixels {
            let confidences = self.predictor.confidences(labels, indexes, image[pixel.index()]);
            for (column, c) in per_label.iter_mut().zip(confidences) {
                column.push(c);
            }
        }

        let results = labels
            .iter()
            .zip(per_label)
            .map(|(label, per_pixel_confidences)| {
                let has_samples = indexes.get(label).is_some_and(|i| !i.is_empty());
                let (aggregated_confidence, no_evidence) =
                    match self.aggregator.aggregate(tile, label, &per_pixel_confidences) {
                        Ok(v) => (v, !has_samples),
                        Err(e) => {
                            log::warn!("{e}");
                            (0.0, true)
                        }
                    };
                PredictionResult {
                    tile_id: tile,
                    color_label: label.clone(),
                    per_pixel_confidences,
                    aggregated_confidence,
                    no_evidence,
                }
            })
            .collect();

        TileReport {
            tile_id: tile,
            pixels,
            results,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refiner::Confirmation;
    use crate::store::{CalibrationSession, RegionMapping};
    use crate::types::SessionId;

    const RED: ColorVector = [0.9, 0.15, 0.1];
    const BLUE: ColorVector = [0.1, 0.3, 0.85];

    fn config() -> ChromacalConfig {
        let mut c = ChromacalConfig::default();
        c.calibration.workers = 1;
        c
    }

    fn shade(c: ColorVector, i: u64) -> ColorVector {
        let f = 1.0 + ((i * 7 % 5) as f64 - 2.0) * 0.02;
        [c[0] * f, c[1] * f, c[2] * f]
    }

    /// Tile 0 = pixels 0..4, tile 1 = pixels 4..8; each pixel unambiguously
    /// declared. Tiles swap red/blue every session.
    fn calibrated(sessions: u64) -> (SampleStore, Refiner) {
        let mut store = SampleStore::new();
        for s in 0..sessions {
            let (l0, l1, c0, c1) = if s % 2 == 0 {
                ("red", "blue", RED, BLUE)
            } else {
                ("blue", "red", BLUE, RED)
            };
            let session = CalibrationSession {
                session_id: SessionId(s),
                known_reference_sequence: vec![
                    [(TileId(0), ColorLabel::from(l0)), (TileId(1), ColorLabel::from(l1))]
                        .into_iter()
                        .collect(),
                ],
            };
            let image: Vec<ColorVector> = (0..8)
                .map(|p| if p < 4 { shade(c0, s + p) } else { shade(c1, s + p) })
                .collect();
            let mapping: RegionMapping = (0..8u32)
                .map(|p| (PixelId(p), [TileId(p / 4)].into_iter().collect()))
                .collect();
            store.add_session(&session, &[image], &mapping).unwrap();
        }
        let mut refiner = Refiner::new(&config());
        refiner.refine(&store);
        (store, refiner)
    }

    fn accept_all(refiner: &mut Refiner) {
        for request in refiner.pending_reviews() {
            refiner.confirm(request.pixel, Confirmation::Accept).unwrap();
        }
    }

    #[test]
    fn test_only_finalized_pixels_are_indexed() {
        let (store, mut refiner) = calibrated(4);
        let classifier = Classifier::new(&config());
        assert_eq!(classifier.sync(&store, &refiner), SyncReport::default());
        assert!(classifier.registry().is_empty());

        refiner.confirm(PixelId(0), Confirmation::Accept).unwrap();
        let report = classifier.sync(&store, &refiner);
        assert_eq!(report.rebuilt, vec![TileId(0)]);
        let index = classifier.registry().get(TileId(0)).unwrap();
        assert_eq!(index.pixels, vec![PixelId(0)]);
        assert_eq!(index.sample_count(), 4);
    }

    #[test]
    fn test_sync_skips_unchanged_tiles() {
        let (store, mut refiner) = calibrated(4);
        accept_all(&mut refiner);
        let classifier = Classifier::new(&config());
        assert_eq!(classifier.sync(&store, &refiner).rebuilt.len(), 2);
        let again = classifier.sync(&store, &refiner);
        assert!(again.rebuilt.is_empty());
        assert_eq!(again.unchanged, 2);
    }

    #[test]
    fn test_predict_picks_shown_colour() {
        let (store, mut refiner) = calibrated(6);
        accept_all(&mut refiner);
        let classifier = Classifier::new(&config());
        classifier.sync(&store, &refiner);

        let live: Vec<ColorVector> = (0..8).map(|p| if p < 4 { BLUE } else { RED }).collect();
        let reports = classifier.predict(&live);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].best().unwrap().color_label, ColorLabel::from("blue"));
        assert_eq!(reports[1].best().unwrap().color_label, ColorLabel::from("red"));
        for report in &reports {
            assert_eq!(report.pixels.len(), 4);
            for result in &report.results {
                assert_eq!(result.per_pixel_confidences.len(), report.pixels.len());
            }
        }
        let input = reports[0].matching_input();
        assert_eq!(input.len(), 2);
        assert!(input.iter().all(|(_, c)| (0.0..=1.0).contains(c)));
    }

    #[test]
    fn test_unknown_tile_has_no_evidence() {
        let (store, mut refiner) = calibrated(4);
        accept_all(&mut refiner);
        let classifier = Classifier::new(&config());
        classifier.sync(&store, &refiner);
        let report = classifier.predict_tile(TileId(9), &[RED; 8]);
        assert!(report.pixels.is_empty());
        assert!(report.results.iter().all(|r| r.no_evidence && r.aggregated_confidence == 0.0));
        assert!(report.best().is_none());
    }

    #[test]
    fn test_subsampling_caps_pixels() {
        let (store, mut refiner) = calibrated(4);
        accept_all(&mut refiner);
        let mut c = config();
        c.prediction.max_pixels_per_tile = Some(2);
        let classifier = Classifier::new(&c);
        classifier.sync(&store, &refiner);
        let live = [RED; 8];
        let a = classifier.predict(&live);
        let b = classifier.predict(&live);
        assert_eq!(a, b);
        assert!(a.iter().all(|r| r.pixels.len() == 2));
        assert!(a.iter().all(|r| r.results.iter().all(|x| x.per_pixel_confidences.len() == 2)));
    }

    #[test]
    fn test_short_live_image_skips_missing_pixels() {
        let (store, mut refiner) = calibrated(4);
        accept_all(&mut refiner);
        let classifier = Classifier::new(&config());
        classifier.sync(&store, &refiner);
        let report = classifier.predict_tile(TileId(1), &[RED; 6]);
        assert_eq!(report.pixels, vec![PixelId(4), PixelId(5)]);
    }

    #[test]
    fn test_parallel_predict_matches_serial() {
        let (store, mut refiner) = calibrated(6);
        accept_all(&mut refiner);
        let serial = Classifier::new(&config());
        serial.sync(&store, &refiner);
        let mut pc = config();
        pc.calibration.workers = 4;
        let parallel = Classifier::new(&pc);
        parallel.sync(&store, &refiner);
        let live: Vec<ColorVector> = (0..8).map(|p| shade(RED, p)).collect();
        assert_eq!(serial.predict(&live), parallel.predict(&live));
    }

    #[test]
    fn test_poisoned_registry_still_serves_reads() {
        let (store, mut refiner) = calibrated(4);
        accept_all(&mut refiner);
        let classifier = Classifier::new(&config());
        classifier.sync(&store, &refiner);

        let registry = classifier.registry();
        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = registry.tiles.write().unwrap();
            panic!("writer died holding the lock");
        }));
        assert!(poisoned.is_err());
        assert!(registry.tiles.is_poisoned());

        assert!(registry.get(TileId(0)).is_some());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn test_prediction_worker_panic_propagates_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (store, mut refiner) = calibrated(4);
        accept_all(&mut refiner);
        let panics = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&panics);
        let correction = move |c: ColorVector| {
            if c[0] == 42.0 {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("bad live colour");
            }
            c
        };
        let mut c = config();
        c.calibration.workers = 4;
        let classifier = Classifier::with_correction(&c, correction);
        classifier.sync(&store, &refiner);

        let mut live = [RED; 8];
        live[0] = [42.0, 0.0, 0.0];
        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| classifier.predict(&live)));
        assert!(outcome.is_err());
        assert_eq!(panics.load(Ordering::SeqCst), 1, "failed chunk must not be re-run");
    }
}
