//! Error taxonomy for the calibration and prediction pipeline.
//!
//! Every variant is local to one entity (a session, a pixel, a tile/label
//! pair). Callers report them per entity and keep processing the rest.

use crate::types::{ColorLabel, PixelId, TileId};

#[derive(Debug, thiserror::Error)]
pub enum ChromacalError {
    /// Bad input to the sample store. Not retried.
    #[error("malformed session: {0}")]
    MalformedSession(String),

    /// Fewer than two distinguishable calibration groups for a pixel.
    #[error("insufficient calibration data for {pixel}")]
    InsufficientData { pixel: PixelId },

    /// Candidate tiles the data cannot tell apart. Left to the reviewer.
    #[error("{pixel} is ambiguous between {candidates:?}")]
    Ambiguous {
        pixel: PixelId,
        candidates: Vec<TileId>,
    },

    /// No pixels were available to aggregate for this tile/label pair.
    #[error("no pixels to aggregate for {tile}/{label}")]
    EmptyPixelSet { tile: TileId, label: ColorLabel },

    /// Alpha reached its floor without the pixel converging.
    #[error("{pixel} is unresolved: alpha reached its floor without convergence")]
    Unresolved { pixel: PixelId },

    #[error("unknown pixel {0}")]
    UnknownPixel(PixelId),

    #[error("cannot {action} {pixel} while it is {state}")]
    InvalidTransition {
        pixel: PixelId,
        state: String,
        action: &'static str,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChromacalError>;
