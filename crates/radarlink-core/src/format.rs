//! Consumer-specific coordinate presentation.
//!
//! Decoding always yields millimeters in the radar's own axes. Some consumers
//! expect meters in their own orientation; that conversion lives here so the
//! decoder stays independent of any output format.

use serde::{Deserialize, Serialize};

use crate::frame::TargetReading;

/// How target coordinates are rendered for a consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateFormat {
    /// Integer millimeters in the radar's axes.
    #[default]
    Millimeters,
    /// Meters rounded to 3 decimals; consumer x is radar y, consumer y is
    /// the negated radar x.
    MetersSwapped,
}

/// A reading's position converted for output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Position {
    /// Integer millimeters.
    Millimeters {
        /// Consumer x.
        x: i32,
        /// Consumer y.
        y: i32,
    },
    /// Meters.
    Meters {
        /// Consumer x.
        x: f64,
        /// Consumer y.
        y: f64,
    },
}

impl CoordinateFormat {
    /// Converts a reading's position into this format.
    #[must_use]
    pub fn position(self, reading: &TargetReading) -> Position {
        match self {
            Self::Millimeters => Position::Millimeters {
                x: reading.x_mm,
                y: reading.y_mm,
            },
            Self::MetersSwapped => Position::Meters {
                x: mm_to_m(reading.y_mm),
                y: mm_to_m(-reading.x_mm),
            },
        }
    }
}

impl Position {
    /// Consumer x as a JSON value.
    #[must_use]
    pub fn x_json(&self) -> serde_json::Value {
        match *self {
            Self::Millimeters { x, .. } => x.into(),
            Self::Meters { x, .. } => x.into(),
        }
    }

    /// Consumer y as a JSON value.
    #[must_use]
    pub fn y_json(&self) -> serde_json::Value {
        match *self {
            Self::Millimeters { y, .. } => y.into(),
            Self::Meters { y, .. } => y.into(),
        }
    }
}

// Integer millimeters are already exact at 3 decimals. Callers negate the
// integer, not the float, so an empty slot never renders as -0.0.
fn mm_to_m(mm: i32) -> f64 {
    f64::from(mm) / 1000.0
}
