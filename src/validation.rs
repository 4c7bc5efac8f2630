//! Frame validation utilities for test pattern verification.
//!
//! Captured frames from the mock device or the vivid virtual driver carry
//! known patterns. These checks confirm the buffer contents survived the
//! queue round trip intact and that no frames were skipped.

use thiserror::Error;

use crate::traits::{Format, Frame};

/// Expected RGB values for SMPTE color bars (8 bars).
///
/// These are the RGB values resulting from converting the YUV values
/// used by the mock device's color bar pattern.
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235), // White
    (235, 235, 11),  // Yellow
    (12, 236, 237),  // Cyan
    (13, 237, 13),   // Green
    (237, 13, 237),  // Magenta
    (238, 14, 13),   // Red
    (15, 15, 239),   // Blue
    (16, 16, 16),    // Black
];

/// Tolerance for RGB color matching (accounts for YUV->RGB conversion errors).
const COLOR_TOLERANCE: u32 = 15;

/// Minimum left-to-right luminance rise for a gradient.
const MIN_GRADIENT_RISE: f32 = 50.0;

/// Why a frame failed validation.
#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    /// Payload length differs from the negotiated frame size.
    #[error("Frame holds {actual} bytes, format {format} needs {expected}")]
    SizeMismatch {
        /// Negotiated format.
        format: String,
        /// Expected payload length.
        expected: usize,
        /// Actual payload length.
        actual: usize,
    },

    /// Sample position lies outside the frame data.
    #[error("Failed to get pixel at ({x}, {y})")]
    PixelOutOfBounds {
        /// Column.
        x: u32,
        /// Row.
        y: u32,
    },

    /// A color bar does not have the expected color.
    #[error("Color bar {bar} mismatch: expected RGB{expected:?}, got RGB{actual:?}")]
    ColorBarMismatch {
        /// Bar index, left to right.
        bar: usize,
        /// Expected color.
        expected: (u8, u8, u8),
        /// Sampled color.
        actual: (u8, u8, u8),
    },

    /// Luminance drops somewhere along the gradient.
    #[error("Gradient not monotonically increasing at x={x}: luminance {luminance} < previous {previous}")]
    NotMonotonic {
        /// Column where the drop was seen.
        x: u32,
        /// Luminance at `x`.
        luminance: f32,
        /// Luminance at the previous sample.
        previous: f32,
    },

    /// Luminance barely changes across the frame.
    #[error("Insufficient luminance change for gradient: {0} (expected at least 50)")]
    FlatGradient(f32),

    /// No frames to check.
    #[error("Cannot validate empty frame sequence")]
    EmptySequence,

    /// Sequence numbers are not consecutive.
    #[error("Frame sequence gap at index {index}: expected {expected}, got {actual}")]
    SequenceGap {
        /// Position in the frame list.
        index: usize,
        /// Expected sequence number.
        expected: u32,
        /// Sequence number found.
        actual: u32,
    },
}

/// Validates that a packed frame holds exactly one image of `format`.
///
/// # Errors
///
/// Returns `SizeMismatch` when the payload length differs from `format.size`.
pub fn validate_frame_size(frame: &Frame, format: &Format) -> Result<(), ValidationError> {
    let expected = format.size as usize;
    if frame.data.len() == expected {
        Ok(())
    } else {
        Err(ValidationError::SizeMismatch {
            format: format.to_string(),
            expected,
            actual: frame.data.len(),
        })
    }
}

/// Validates that a frame contains the SMPTE color bar pattern.
///
/// This function checks 8 vertical stripes at their center positions,
/// verifying that each stripe contains the expected color with a tolerance
/// for YUV-to-RGB conversion inaccuracies.
///
/// # Errors
///
/// Returns an error if a sample falls outside the frame or any color bar
/// doesn't match the expected color within tolerance.
pub fn validate_color_bars(frame: &Frame, format: &Format) -> Result<(), ValidationError> {
    let width = format.width;
    let bar_width = width / 8;
    let center_y = format.height / 2;

    for (bar, expected) in SMPTE_COLOR_BARS.iter().copied().enumerate() {
        // Sample the center of each bar
        #[allow(clippy::cast_possible_truncation)]
        let x = (bar as u32 * bar_width) + (bar_width / 2);

        let actual = frame
            .pixel_at(x, center_y, width)
            .ok_or(ValidationError::PixelOutOfBounds { x, y: center_y })?;

        if !colors_match(actual, expected, COLOR_TOLERANCE) {
            return Err(ValidationError::ColorBarMismatch {
                bar,
                expected,
                actual,
            });
        }
    }

    Ok(())
}

/// Validates that a frame contains a horizontal gradient pattern.
///
/// Samples the center row every 10 pixels and checks that luminance never
/// drops by more than rounding error and rises significantly overall.
///
/// # Errors
///
/// Returns an error if the luminance decreases or barely changes.
pub fn validate_gradient(frame: &Frame, format: &Format) -> Result<(), ValidationError> {
    let width = format.width;
    let center_y = format.height / 2;

    let mut first: Option<f32> = None;
    let mut previous: Option<f32> = None;

    for x in (0..width).step_by(10) {
        let (r, g, b) = frame
            .pixel_at(x, center_y, width)
            .ok_or(ValidationError::PixelOutOfBounds { x, y: center_y })?;

        // Y' in Rec. 601
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );

        if let Some(prev) = previous {
            if luminance < prev - 1.0 {
                return Err(ValidationError::NotMonotonic {
                    x,
                    luminance,
                    previous: prev,
                });
            }
        }
        first.get_or_insert(luminance);
        previous = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first, previous) {
        let rise = last - first;
        if rise < MIN_GRADIENT_RISE {
            return Err(ValidationError::FlatGradient(rise));
        }
    }

    Ok(())
}

/// Validates that frame sequence numbers increment by 1 with no gaps.
///
/// # Errors
///
/// Returns an error for an empty slice or any gap between neighbours.
pub fn validate_frame_sequence(frames: &[Frame]) -> Result<(), ValidationError> {
    if frames.is_empty() {
        return Err(ValidationError::EmptySequence);
    }

    for (index, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let expected = prev.metadata.sequence.wrapping_add(1);
            if curr.metadata.sequence != expected {
                return Err(ValidationError::SequenceGap {
                    index: index + 1,
                    expected,
                    actual: curr.metadata.sequence,
                });
            }
        }
    }

    Ok(())
}

/// Whether all three channels are within `tolerance` of each other.
fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u32) -> bool {
    let (ar, ag, ab) = actual;
    let (er, eg, eb) = expected;

    u32::from(ar.abs_diff(er)) <= tolerance
        && u32::from(ag.abs_diff(eg)) <= tolerance
        && u32::from(ab.abs_diff(eb)) <= tolerance
}
