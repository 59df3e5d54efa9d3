//! # chromacal-core
//!
//! **Lighting-robust colour classification for tiled objects.**
//!
//! `chromacal-core` learns which camera pixels look at which physical tile of
//! an object (a puzzle cube face, a sticker grid) and then, for a live image,
//! reports how confident it is that each tile shows each colour.
//!
//! ## Quick Start
//!
//! ```no_run
//! use chromacal_core::{ChromacalConfig, Classifier, Refiner, SampleStore};
//!
//! let config = ChromacalConfig::default();
//! let mut store = SampleStore::new();
//! let mut refiner = Refiner::new(&config);
//! let classifier = Classifier::new(&config);
//!
//! // store.add_session(&session, &images, &mapping)?;
//! refiner.refine(&store);
//! for request in refiner.pending_reviews() {
//!     println!("{} looks like {}", request.pixel, request.tile);
//! }
//! classifier.sync(&store, &refiner);
//! let live = vec![[0.9, 0.1, 0.1]; 64];
//! for report in classifier.predict(&live) {
//!     println!("{}: {:?}", report.tile_id, report.matching_input());
//! }
//! ```
//!
//! ## Architecture
//!
//! Calibration: SampleStore → SignificanceEngine → Refiner (→ review → Finalized)
//!
//! Prediction: Finalized pixels → SpatialIndex per tile/label → DensityPredictor
//! → ConfidenceAggregator → per-tile `(label, confidence)` vectors
//!
//! Each calibration session adds observations; the refiner runs one ANOVA per
//! pixel per candidate tile and tightens its significance level every session
//! until the pixel converges. Converged pixels wait for an external accept or
//! reject. Only finalized pixels ever reach the spatial indexes.

pub mod aggregate;
pub mod classifier;
pub mod config;
pub mod density;
pub mod error;
pub mod persist;
pub mod refiner;
pub mod significance;
pub mod spatial;
pub mod store;
pub mod types;

pub use aggregate::{ConfidenceAggregator, nearest_rank};
pub use classifier::{
    Classifier, IndexRegistry, PredictionResult, SyncReport, TileIndex, TileReport,
};
pub use config::{CalibrationConfig, ChromacalConfig, IndexConfig, PredictionConfig};
pub use density::{ColorCorrection, DensityPredictor, Identity};
pub use error::{ChromacalError, Result};
pub use persist::{StoreSnapshot, load_state, load_store, save_state, save_store};
pub use refiner::{
    AssignmentState, Confirmation, EvaluationStatus, PixelAssignment, Refiner, RefinerState,
    ReviewDecision, ReviewRequest, RoundReport,
};
pub use significance::{CandidateScore, Significance, SignificanceEngine};
pub use spatial::{ColorSample, Neighbor, SpatialIndex};
pub use store::{CalibrationSession, IngestSummary, Observation, RegionMapping, SampleStore};
pub use types::{ColorLabel, ColorVector, PixelId, SessionId, TileId};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
