use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{NORMALIZED_BOUND, SPACE_COUNT};
use crate::error::{Error, Result};

/// One of the eight independent 3-D semantic spaces (levels).
///
/// The discriminant is the level index used by serialization and by the
/// connection level mask, so the order is part of the binary format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CoordinateSpace {
    Physical = 0,
    Sensory = 1,
    Motor = 2,
    Emotional = 3,
    Cognitive = 4,
    Social = 5,
    Temporal = 6,
    Abstract = 7,
}

impl CoordinateSpace {
    pub const ALL: [CoordinateSpace; SPACE_COUNT] = [
        Self::Physical,
        Self::Sensory,
        Self::Motor,
        Self::Emotional,
        Self::Cognitive,
        Self::Social,
        Self::Temporal,
        Self::Abstract,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Physical => "physical",
            Self::Sensory => "sensory",
            Self::Motor => "motor",
            Self::Emotional => "emotional",
            Self::Cognitive => "cognitive",
            Self::Social => "social",
            Self::Temporal => "temporal",
            Self::Abstract => "abstract",
        }
    }

    /// Inclusive numeric domain of the space. `None` means any finite value.
    pub fn bounds(self) -> Option<(f32, f32)> {
        match self {
            Self::Physical | Self::Temporal => None,
            Self::Sensory
            | Self::Motor
            | Self::Emotional
            | Self::Cognitive
            | Self::Social
            | Self::Abstract => Some((-NORMALIZED_BOUND, NORMALIZED_BOUND)),
        }
    }

    /// Check a single coordinate against the space's domain.
    pub fn validate(self, value: f32) -> Result<()> {
        let (min, max) = self.bounds().unwrap_or((f32::MIN, f32::MAX));
        if !value.is_finite() || value < min || value > max {
            return Err(Error::OutOfRange {
                space: self,
                value,
                min,
                max,
            });
        }
        Ok(())
    }

    pub fn validate_point(self, point: [f32; 3]) -> Result<()> {
        point.iter().try_for_each(|&v| self.validate(v))
    }
}

impl fmt::Display for CoordinateSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Euclidean distance between two points, computed in f64.
pub fn euclidean(a: [f32; 3], b: [f32; 3]) -> f64 {
    let dx = a[0] as f64 - b[0] as f64;
    let dy = a[1] as f64 - b[1] as f64;
    let dz = a[2] as f64 - b[2] as f64;
    (dx * dx + dy * dy + dz * dz).sqrt()
}
