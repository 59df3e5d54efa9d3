//! Append-only store of calibration observations.
//!
//! Every calibration session contributes one [`Observation`] per pixel, per
//! image in the batch, per candidate tile the region picker declared for that
//! pixel. Observations are never edited or removed; corrections arrive as new
//! sessions. The store is explicit process state: build it empty, append with
//! [`SampleStore::add_session`], and export/import it through
//! [`crate::persist`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{ChromacalError, Result};
use crate::types::{ColorLabel, ColorVector, PixelId, SessionId, TileId};

/// One colour reading of one pixel under one candidate tile hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub pixel_id: PixelId,
    pub tile_candidate_id: TileId,
    pub color_vector: ColorVector,
    pub session_id: SessionId,
    /// Index of the image inside the session batch.
    pub frame: u32,
    /// Colour the candidate tile showed in this frame.
    pub reference_label: ColorLabel,
    pub timestamp_ms: u64,
}

/// A batch of calibration images with known tile colours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSession {
    pub session_id: SessionId,
    /// One tile → colour map per image in the batch, in batch order.
    pub known_reference_sequence: Vec<HashMap<TileId, ColorLabel>>,
}

/// Region-picker output: which tiles each pixel may belong to.
pub type RegionMapping = BTreeMap<PixelId, BTreeSet<TileId>>;

/// What a successful ingest appended.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestSummary {
    pub session_id: SessionId,
    pub observations: usize,
    /// Pixels that received observations, ascending.
    pub pixels: Vec<PixelId>,
}

/// Append-only observation store, indexed by pixel, tile and session.
#[derive(Debug, Clone, Default)]
pub struct SampleStore {
    observations: Vec<Observation>,
    by_pixel: HashMap<PixelId, Vec<usize>>,
    by_tile: HashMap<TileId, Vec<usize>>,
    sessions: Vec<SessionId>,
    session_ranges: HashMap<SessionId, Range<usize>>,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from an ordered list of observations (as produced by
    /// [`SampleStore::observations`]). Each session's observations must be
    /// contiguous.
    pub fn from_observations(observations: Vec<Observation>) -> Result<Self> {
        let mut store = Self::new();
        for obs in observations {
            if store.sessions.last() != Some(&obs.session_id) {
                if store.session_ranges.contains_key(&obs.session_id) {
                    return Err(malformed(format!(
                        "{} is not contiguous in the observation list",
                        obs.session_id
                    )));
                }
                let start = store.observations.len();
                store.sessions.push(obs.session_id);
                store.session_ranges.insert(obs.session_id, start..start);
            }
            store.push(obs);
        }
        Ok(store)
    }

    /// Extract one colour per mapped pixel per image and append the resulting
    /// observations, tagged with the session and each declared candidate tile.
    ///
    /// The session is validated as a whole before anything is appended, so a
    /// `MalformedSession` error leaves the store untouched.
    pub fn add_session<I: AsRef<[ColorVector]>>(
        &mut self,
        session: &CalibrationSession,
        images: &[I],
        mapping: &RegionMapping,
    ) -> Result<IngestSummary> {
        self.validate_session(session, images, mapping)?;

        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let start = self.observations.len();
        self.sessions.push(session.session_id);
        self.session_ranges.insert(session.session_id, start..start);

        for (&pixel, candidates) in mapping {
            for (frame, (image, reference)) in images
                .iter()
                .zip(&session.known_reference_sequence)
                .enumerate()
            {
                let color = image.as_ref()[pixel.index()];
                for tile in candidates {
                    self.push(Observation {
                        pixel_id: pixel,
                        tile_candidate_id: *tile,
                        color_vector: color,
                        session_id: session.session_id,
                        frame: frame as u32,
                        reference_label: reference[tile].clone(),
                        timestamp_ms,
                    });
                }
            }
        }

        let appended = self.observations.len() - start;
        log::info!(
            "ingested {}: {} images, {} pixels, {} observations",
            session.session_id,
            images.len(),
            mapping.len(),
            appended
        );

        Ok(IngestSummary {
            session_id: session.session_id,
            observations: appended,
            pixels: mapping.keys().copied().collect(),
        })
    }

    fn validate_session<I: AsRef<[ColorVector]>>(
        &self,
        session: &CalibrationSession,
        images: &[I],
        mapping: &RegionMapping,
    ) -> Result<()> {
        let id = session.session_id;
        if self.session_ranges.contains_key(&id) {
            return Err(malformed(format!("{id} was already ingested")));
        }
        let Some(first) = images.first() else {
            return Err(malformed(format!("{id} has an empty image batch")));
        };
        let image_len = first.as_ref().len();
        if let Some(i) = images.iter().position(|img| img.as_ref().len() != image_len) {
            return Err(malformed(format!(
                "{id}: image {i} has {} pixels, expected {image_len}",
                images[i].as_ref().len()
            )));
        }
        if session.known_reference_sequence.len() != images.len() {
            return Err(malformed(format!(
                "{id}: {} reference frames for {} images",
                session.known_reference_sequence.len(),
                images.len()
            )));
        }
        if mapping.is_empty() {
            return Err(malformed(format!("{id}: region mapping is empty")));
        }
        for (pixel, candidates) in mapping {
            if pixel.index() >= image_len {
                return Err(malformed(format!(
                    "{id}: mapping references unknown {pixel} (image has {image_len} pixels)"
                )));
            }
            if candidates.is_empty() {
                return Err(malformed(format!("{id}: {pixel} has no candidate tiles")));
            }
            for (frame, reference) in session.known_reference_sequence.iter().enumerate() {
                if let Some(tile) = candidates.iter().find(|t| !reference.contains_key(t)) {
                    return Err(malformed(format!(
                        "{id}: frame {frame} has no reference colour for {tile}"
                    )));
                }
            }
            for (i, image) in images.iter().enumerate() {
                if image.as_ref()[pixel.index()].iter().any(|c| !c.is_finite()) {
                    return Err(malformed(format!(
                        "{id}: image {i} has a non-finite colour at {pixel}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn push(&mut self, obs: Observation) {
        let idx = self.observations.len();
        self.by_pixel.entry(obs.pixel_id).or_default().push(idx);
        self.by_tile.entry(obs.tile_candidate_id).or_default().push(idx);
        if let Some(range) = self.session_ranges.get_mut(&obs.session_id) {
            range.end = idx + 1;
        }
        self.observations.push(obs);
    }

    /// All observations for a pixel across sessions, in insertion order.
    pub fn query_by_pixel(&self, pixel: PixelId) -> Vec<&Observation> {
        self.collect(self.by_pixel.get(&pixel))
    }

    /// All observations made under a tile hypothesis, in insertion order.
    pub fn query_by_tile(&self, tile: TileId) -> Vec<&Observation> {
        self.collect(self.by_tile.get(&tile))
    }

    /// Observations for a pixel up to and including `session`, i.e. what the
    /// store held for that pixel right after `session` was ingested.
    pub fn query_by_pixel_through(&self, pixel: PixelId, session: SessionId) -> Vec<&Observation> {
        let Some(end) = self.session_ranges.get(&session).map(|r| r.end) else {
            return Vec::new();
        };
        self.by_pixel
            .get(&pixel)
            .map(|idx| {
                idx.iter()
                    .take_while(|&&i| i < end)
                    .map(|&i| &self.observations[i])
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn query_by_session(&self, session: SessionId) -> &[Observation] {
        self.session_ranges
            .get(&session)
            .map_or(&[], |r| &self.observations[r.clone()])
    }

    fn collect(&self, indices: Option<&Vec<usize>>) -> Vec<&Observation> {
        indices
            .map(|idx| idx.iter().map(|&i| &self.observations[i]).collect())
            .unwrap_or_default()
    }

    /// Sessions in ingest order.
    pub fn sessions(&self) -> &[SessionId] {
        &self.sessions
    }

    /// Number of distinct sessions that observed a pixel.
    pub fn session_count(&self, pixel: PixelId) -> usize {
        let mut seen = BTreeSet::new();
        for obs in self.query_by_pixel(pixel) {
            seen.insert(obs.session_id);
        }
        seen.len()
    }

    /// Every pixel with at least one observation, ascending.
    pub fn pixels(&self) -> Vec<PixelId> {
        let mut pixels: Vec<PixelId> = self.by_pixel.keys().copied().collect();
        pixels.sort_unstable();
        pixels
    }

    /// Every colour label referenced by any observation.
    pub fn labels(&self) -> BTreeSet<ColorLabel> {
        self.observations
            .iter()
            .map(|o| o.reference_label.clone())
            .collect()
    }

    /// The full ordered record, suitable for export.
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

fn malformed(msg: String) -> ChromacalError {
    ChromacalError::MalformedSession(msg)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
