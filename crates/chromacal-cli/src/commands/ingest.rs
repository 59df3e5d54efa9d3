//! `chromacal ingest` — append calibration sessions and refine.
//!
//! Session file format:
//!
//! ```json
//! {
//!   "session_id": 3,
//!   "reference": [{"0": "red", "1": "blue"}],
//!   "frames": [[[0.91, 0.12, 0.10], [0.11, 0.29, 0.86]]],
//!   "mapping": {"0": [0, 1], "1": [1]}
//! }
//! ```
//!
//! `reference[i]` gives each tile's colour in `frames[i]`; `mapping` lists the
//! candidate tiles of each pixel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use chromacal_core::{
    CalibrationSession, ChromacalConfig, ColorLabel, ColorVector, RegionMapping, Result, SessionId,
    TileId,
};

use super::Workspace;

#[derive(Debug, Deserialize)]
pub struct SessionFile {
    pub session_id: SessionId,
    pub reference: Vec<HashMap<TileId, ColorLabel>>,
    pub frames: Vec<Vec<ColorVector>>,
    pub mapping: RegionMapping,
}

impl SessionFile {
    pub fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn session(&self) -> CalibrationSession {
        CalibrationSession {
            session_id: self.session_id,
            known_reference_sequence: self.reference.clone(),
        }
    }
}

/// Run the ingest command.
pub fn run(
    workspace: &Workspace,
    config: &ChromacalConfig,
    paths: &[PathBuf],
    refine: bool,
) -> Result<()> {
    let (mut store, mut refiner) = workspace.load(config)?;

    let mut failed = 0usize;
    for path in paths {
        let outcome = SessionFile::read(path)
            .and_then(|file| store.add_session(&file.session(), &file.frames, &file.mapping));
        match outcome {
            Ok(summary) => println!(
                "  {:<12} {} pixels, {} observations  ({})",
                summary.session_id.to_string(),
                summary.pixels.len(),
                summary.observations,
                path.display()
            ),
            Err(e) => {
                failed += 1;
                eprintln!("  skipped {}: {e}", path.display());
            }
        }
    }

    if refine {
        let rounds = refiner.refine(&store);
        if !rounds.is_empty() {
            println!();
            println!(
                "  {:<12} {:>9} {:>9} {:>12} {:>9} {:>10}",
                "Session", "Evaluated", "Converged", "Insufficient", "Ambiguous", "Unresolved"
            );
            for r in &rounds {
                println!(
                    "  {:<12} {:>9} {:>9} {:>12} {:>9} {:>10}",
                    r.session.map(|s| s.to_string()).unwrap_or_default(),
                    r.evaluated,
                    r.converged.len(),
                    r.insufficient,
                    r.ambiguous,
                    r.unresolved
                );
            }
        }
        let pending = refiner.pending_reviews().len();
        if pending > 0 {
            println!();
            println!("{pending} pixel(s) awaiting review: run `chromacal review`");
        }
    }

    workspace.save(&store, &refiner)?;
    if failed > 0 {
        println!("{failed} session file(s) skipped");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chromacal_core::PixelId;

    const SESSION: &str = r#"{
        "session_id": 3,
        "reference": [{"0": "red", "1": "blue"}],
        "frames": [[[0.91, 0.12, 0.10], [0.11, 0.29, 0.86]]],
        "mapping": {"0": [0, 1], "1": [1]}
    }"#;

    #[test]
    fn test_session_file_parses() {
        let file: SessionFile = serde_json::from_str(SESSION).unwrap();
        assert_eq!(file.session_id, SessionId(3));
        assert_eq!(file.reference[0][&TileId(1)], ColorLabel::from("blue"));
        assert_eq!(file.mapping[&PixelId(0)].len(), 2);
        assert_eq!(file.frames[0][1], [0.11, 0.29, 0.86]);
    }

    #[test]
    fn test_ingest_persists_and_skips_bad_files() {
        let tmp = tempfile::tempdir().unwrap();
        let good = tmp.path().join("s3.json");
        let bad = tmp.path().join("bad.json");
        std::fs::write(&good, SESSION).unwrap();
        std::fs::write(&bad, "{").unwrap();

        let ws = Workspace::new(tmp.path().join("ws"));
        let config = ChromacalConfig::default();
        run(&ws, &config, &[good.clone(), bad], true).unwrap();

        let (store, refiner) = ws.load(&config).unwrap();
        assert_eq!(store.sessions(), &[SessionId(3)]);
        assert_eq!(store.len(), 3);
        assert_eq!(refiner.applied_sessions(), &[SessionId(3)]);

        // Same session again is malformed and leaves the store unchanged.
        run(&ws, &config, &[good], true).unwrap();
        assert_eq!(ws.load(&config).unwrap().0.len(), 3);
    }
}
