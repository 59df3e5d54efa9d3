//! Export and import of calibration state.
//!
//! # Storage Format
//!
//! Both files are pretty-printed JSON, gzip-compressed when the path ends in
//! `.gz`:
//! - store snapshot: metadata plus the ordered observation list; replaying it
//!   reproduces the [`SampleStore`] exactly
//! - refiner state: every [`PixelAssignment`](crate::PixelAssignment) plus the
//!   sessions already applied

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChromacalError, Result};
use crate::refiner::RefinerState;
use crate::store::{Observation, SampleStore};

/// Snapshot format written by this version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serialized form of a [`SampleStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub id: Uuid,
    /// ISO-8601 UTC, e.g. `2026-02-15T01:30:00Z`.
    pub exported_at: String,
    pub chromacal_version: String,
    pub observations: Vec<Observation>,
}

impl StoreSnapshot {
    pub fn capture(store: &SampleStore) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            id: Uuid::new_v4(),
            exported_at: format_iso8601(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default(),
            ),
            chromacal_version: crate::VERSION.to_string(),
            observations: store.observations().to_vec(),
        }
    }

    /// Replay the observations into a fresh store.
    pub fn into_store(self) -> Result<SampleStore> {
        if self.version > SNAPSHOT_VERSION {
            return Err(ChromacalError::MalformedSession(format!(
                "snapshot {} has format version {}, this build reads up to {SNAPSHOT_VERSION}",
                self.id, self.version
            )));
        }
        SampleStore::from_observations(self.observations)
    }
}

/// Write `store` to `path`. Returns the snapshot id.
pub fn save_store(store: &SampleStore, path: &Path) -> Result<Uuid> {
    let snapshot = StoreSnapshot::capture(store);
    write_json(&snapshot, path)?;
    log::info!(
        "exported {} observations from {} sessions to {}",
        store.len(),
        store.sessions().len(),
        path.display()
    );
    Ok(snapshot.id)
}

pub fn load_store(path: &Path) -> Result<SampleStore> {
    let snapshot: StoreSnapshot = read_json(path)?;
    log::debug!("loading snapshot {} ({})", snapshot.id, snapshot.exported_at);
    snapshot.into_store()
}

pub fn save_state(state: &RefinerState, path: &Path) -> Result<()> {
    write_json(state, path)
}

pub fn load_state(path: &Path) -> Result<RefinerState> {
    read_json(path)
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("gz"))
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let file = BufWriter::new(File::create(path)?);
    if is_gzip(path) {
        let mut encoder = GzEncoder::new(file, Compression::default());
        serde_json::to_writer_pretty(&mut encoder, value)?;
        encoder.finish()?.flush()?;
    } else {
        let mut file = file;
        serde_json::to_writer_pretty(&mut file, value)?;
        file.flush()?;
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = BufReader::new(File::open(path)?);
    let reader: Box<dyn Read> = if is_gzip(path) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(serde_json::from_reader(reader)?)
}

/// Format a duration-since-epoch as an ISO-8601 UTC timestamp.
fn format_iso8601(since_epoch: Duration) -> String {
    let secs = since_epoch.as_secs();
    let (hour, min, sec) = ((secs / 3600) % 24, (secs / 60) % 60, secs % 60);
    let (year, month, day) = civil_from_days(secs / 86_400);
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{min:02}:{sec:02}Z")
}

/// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let mut days = days;
    let mut year = 1970;
    loop {
        let len = if is_leap(year) { 366 } else { 365 };
        if days < len {
            break;
        }
        days -= len;
        year += 1;
    }
    let feb = if is_leap(year) { 29 } else { 28 };
    let mut month = 1;
    for len in [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31] {
        if days < len {
            break;
        }
        days -= len;
        month += 1;
    }
    (year, month, days + 1)
}

fn is_leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChromacalConfig;
    use crate::refiner::Refiner;
    use crate::store::{CalibrationSession, RegionMapping};
    use crate::types::{ColorLabel, PixelId, SessionId, TileId};

    fn sample_store() -> SampleStore {
        let mut store = SampleStore::new();
        for s in 0..3u64 {
            let label = if s % 2 == 0 { "red" } else { "blue" };
            let session = CalibrationSession {
                session_id: SessionId(s),
                known_reference_sequence: vec![
                    [(TileId(0), ColorLabel::from(label)), (TileId(1), ColorLabel::from("white"))]
                        .into_iter()
                        .collect(),
                ],
            };
            let mapping: RegionMapping =
                [(PixelId(0), [TileId(0), TileId(1)].into_iter().collect())]
                    .into_iter()
                    .collect();
            store
                .add_session(&session, &[vec![[0.1 * s as f64, 0.2, 0.3]]], &mapping)
                .unwrap();
        }
        store
    }

    #[test]
    fn test_format_iso8601_epoch() {
        assert_eq!(format_iso8601(Duration::from_secs(0)), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_format_iso8601_leap_day() {
        // 2024-02-29 12:00:00 UTC
        assert_eq!(format_iso8601(Duration::from_secs(1_709_208_000)), "2024-02-29T12:00:00Z");
    }

    #[test]
    fn test_store_roundtrip_plain() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("observations.json");
        let store = sample_store();
        save_store(&store, &path).unwrap();
        let loaded = load_store(&path).unwrap();
        assert_eq!(loaded.observations(), store.observations());
        assert_eq!(loaded.sessions(), store.sessions());
    }

    #[test]
    fn test_store_roundtrip_gzip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("observations.json.gz");
        let store = sample_store();
        save_store(&store, &path).unwrap();
        let mut magic = [0u8; 2];
        File::open(&path).unwrap().read_exact(&mut magic).unwrap();
        assert_eq!(magic, [0x1f, 0x8b]);
        assert_eq!(load_store(&path).unwrap().observations(), store.observations());
    }

    #[test]
    fn test_random_colors_survive_bit_exact() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0xC0105);
        let mut store = SampleStore::new();
        let pixels = 500usize;
        let mapping: RegionMapping = (0..pixels as u32)
            .map(|p| (PixelId(p), [TileId(0)].into_iter().collect()))
            .collect();
        for s in 0..4u64 {
            let session = CalibrationSession {
                session_id: SessionId(s),
                known_reference_sequence: vec![
                    [(TileId(0), ColorLabel::from("red"))].into_iter().collect(),
                ],
            };
            let image: Vec<[f64; 3]> = (0..pixels)
                .map(|_| [rng.random(), rng.random(), rng.random::<f64>() * 1e-7])
                .collect();
            store.add_session(&session, &[image], &mapping).unwrap();
        }

        let tmp = tempfile::tempdir().unwrap();
        for name in ["observations.json", "observations.json.gz"] {
            let path = tmp.path().join(name);
            save_store(&store, &path).unwrap();
            let loaded = load_store(&path).unwrap();
            assert_eq!(loaded.len(), store.len());
            let changed = store
                .observations()
                .iter()
                .zip(loaded.observations())
                .filter(|(a, b)| {
                    a.color_vector
                        .iter()
                        .zip(&b.color_vector)
                        .any(|(x, y)| x.to_bits() != y.to_bits())
                })
                .count();
            assert_eq!(changed, 0, "{name}: {changed} observations changed bits");
        }
    }

    #[test]
    fn test_newer_snapshot_is_rejected() {
        let mut snapshot = StoreSnapshot::capture(&sample_store());
        snapshot.version = SNAPSHOT_VERSION + 1;
        assert!(snapshot.into_store().is_err());
    }

    #[test]
    fn test_refiner_state_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("assignments.json.gz");
        let config = ChromacalConfig::default();
        let mut refiner = Refiner::new(&config);
        refiner.refine(&sample_store());
        save_state(&refiner.state(), &path).unwrap();
        let restored = Refiner::restore(&config, load_state(&path).unwrap());
        assert_eq!(restored.state(), refiner.state());
        assert_eq!(restored.applied_sessions().len(), 3);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_store(Path::new("/nonexistent/chromacal/observations.json")).unwrap_err();
        assert!(matches!(err, ChromacalError::Io(_)));
    }
}
