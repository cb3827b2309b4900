//! Binary frame decoding for the radar's target telemetry.
//!
//! Each notification carries a 4-byte header followed by three 8-byte target
//! blocks. A block holds x, y and speed as 16-bit little-endian
//! sign-magnitude values plus two reserved bytes.
//!
//! The device sets bit 15 for **positive** values and clears it for negative
//! ones. This is the inverse of the usual sign-magnitude convention but it is
//! what the radar puts on the wire, so decoding preserves it bit for bit.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of target slots in every frame.
pub const TARGET_SLOTS: usize = 3;

/// Length of the frame header preceding the target blocks.
pub const HEADER_LEN: usize = 4;

/// Length of one target block.
pub const TARGET_BLOCK_LEN: usize = 8;

/// Shortest frame that carries all three target blocks.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + TARGET_SLOTS * TARGET_BLOCK_LEN;

const SIGN_MASK: u16 = 0x8000;
const MAGNITUDE_MASK: u16 = 0x7FFF;

/// Errors raised while decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The frame is too short to hold every target block.
    #[error("Malformed frame: got {len} bytes, need at least {min}")]
    MalformedFrame {
        /// Received length.
        len: usize,
        /// Required length.
        min: usize,
    },
}

/// Result type for frame decoding.
pub type FrameResult<T> = std::result::Result<T, FrameError>;

/// One target slot as reported by the radar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReading {
    /// Lateral position in millimeters.
    pub x_mm: i32,
    /// Distance from the sensor in millimeters.
    pub y_mm: i32,
    /// Radial speed in millimeters per second.
    pub speed_mm_s: i32,
}

impl TargetReading {
    /// Returns `true` if the slot reports a target (non-zero position).
    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.x_mm != 0 || self.y_mm != 0
    }
}

/// Fully decoded contents of one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Readings in slot order.
    pub readings: [TargetReading; TARGET_SLOTS],
    /// `true` iff at least one target is present.
    pub movement: bool,
    /// Number of slots with a non-zero position.
    pub targets_present: u8,
}

impl Snapshot {
    /// Builds a snapshot and derives `movement` and `targets_present`.
    #[must_use]
    pub fn from_readings(readings: [TargetReading; TARGET_SLOTS]) -> Self {
        let mut targets_present = 0u8;
        for reading in &readings {
            if reading.is_present() {
                targets_present += 1;
            }
        }

        Self {
            readings,
            movement: targets_present > 0,
            targets_present,
        }
    }

    /// Snapshot with every slot empty.
    #[must_use]
    pub fn zeroed() -> Self {
        Self::default()
    }
}

/// Decodes one 16-bit sign-magnitude value using the device's sign convention.
#[inline]
#[must_use]
pub fn decode_value(lsb: u8, msb: u8) -> i32 {
    let raw = u16::from_le_bytes([lsb, msb]);
    let magnitude = i32::from(raw & MAGNITUDE_MASK);

    if raw & SIGN_MASK == 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Encodes a value the way the device does, as `[lsb, msb]`.
///
/// Magnitudes above `0x7FFF` are truncated to 15 bits. Zero is encoded with the
/// sign bit set, matching what the radar sends for empty slots.
#[must_use]
pub fn encode_value(value: i32) -> [u8; 2] {
    let magnitude = (value.unsigned_abs() & u32::from(MAGNITUDE_MASK)) as u16;
    let raw = if value < 0 {
        magnitude
    } else {
        magnitude | SIGN_MASK
    };
    raw.to_le_bytes()
}

/// Decodes a raw notification payload into a [`Snapshot`].
///
/// # Errors
///
/// Returns [`FrameError::MalformedFrame`] if `frame` is shorter than
/// [`MIN_FRAME_LEN`]. Trailing bytes beyond the target blocks are ignored.
pub fn decode(frame: &[u8]) -> FrameResult<Snapshot> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(FrameError::MalformedFrame {
            len: frame.len(),
            min: MIN_FRAME_LEN,
        });
    }

    let mut readings = [TargetReading::default(); TARGET_SLOTS];
    for (slot, reading) in readings.iter_mut().enumerate() {
        let offset = HEADER_LEN + slot * TARGET_BLOCK_LEN;
        let block = &frame[offset..offset + TARGET_BLOCK_LEN];
        *reading = TargetReading {
            x_mm: decode_value(block[0], block[1]),
            y_mm: decode_value(block[2], block[3]),
            speed_mm_s: decode_value(block[4], block[5]),
        };
    }

    Ok(Snapshot::from_readings(readings))
}
