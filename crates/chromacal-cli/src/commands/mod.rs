pub mod export;
pub mod ingest;
pub mod predict;
pub mod review;
pub mod status;

use std::path::{Path, PathBuf};

use chromacal_core::{ChromacalConfig, Refiner, Result, SampleStore};

const OBSERVATIONS_FILE: &str = "observations.json.gz";
const ASSIGNMENTS_FILE: &str = "assignments.json";

/// Load `path`, or defaults when no file was given.
pub fn load_config(path: Option<&Path>) -> Result<ChromacalConfig> {
    match path {
        Some(p) => ChromacalConfig::from_json_file(p),
        None => Ok(ChromacalConfig::default()),
    }
}

/// On-disk calibration state: the observation store plus refiner state.
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn observations(&self) -> PathBuf {
        self.dir.join(OBSERVATIONS_FILE)
    }

    fn assignments(&self) -> PathBuf {
        self.dir.join(ASSIGNMENTS_FILE)
    }

    /// Load the store and refiner, starting empty if nothing was saved yet.
    pub fn load(&self, config: &ChromacalConfig) -> Result<(SampleStore, Refiner)> {
        let store = if self.observations().exists() {
            chromacal_core::load_store(&self.observations())?
        } else {
            log::info!("no observations in {}, starting empty", self.dir.display());
            SampleStore::new()
        };
        let refiner = if self.assignments().exists() {
            Refiner::restore(config, chromacal_core::load_state(&self.assignments())?)
        } else {
            Refiner::new(config)
        };
        Ok((store, refiner))
    }

    pub fn save(&self, store: &SampleStore, refiner: &Refiner) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        chromacal_core::save_store(store, &self.observations())?;
        self.save_state(refiner)
    }

    pub fn save_state(&self, refiner: &Refiner) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        chromacal_core::save_state(&refiner.state(), &self.assignments())
    }
}

/// Format a confidence for tables.
pub fn pct(v: f64) -> String {
    format!("{:6.2}%", v * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path().join("ws"));
        let (store, refiner) = ws.load(&ChromacalConfig::default()).unwrap();
        assert!(store.is_empty());
        assert!(refiner.snapshot().is_empty());
        ws.save(&store, &refiner).unwrap();
        assert!(ws.observations().exists());
        assert!(ws.assignments().exists());
    }

    #[test]
    fn test_pct() {
        assert_eq!(pct(0.5), " 50.00%");
    }
}
