//! Identifiers and colour values shared by every pipeline stage.

use serde::{Deserialize, Serialize};

/// A colour as three linear channels (typically RGB in `0.0..=1.0`).
pub type ColorVector = [f64; 3];

/// Index of a pixel in the image. Images are flat slices; rows and columns
/// do not matter to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PixelId(pub u32);

/// A discrete physical region on the object (e.g. one sticker position).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TileId(pub u32);

/// Calibration session identifier. Sessions are ordered by insertion, not by
/// numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

/// Name of a colour class (e.g. `"red"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColorLabel(pub String);

impl ColorLabel {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ColorLabel {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl PixelId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for PixelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "px{}", self.0)
    }
}

impl std::fmt::Display for TileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tile{}", self.0)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session{}", self.0)
    }
}

impl std::fmt::Display for ColorLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
