//! Frame and snapshot validation utilities.
//!
//! Checks converted frames against known test patterns (SMPTE color bars, a
//! horizontal luma ramp), checks sequence continuity, and reads back the PPM
//! files the snapshot writer produces.

use crate::convert::RgbImage;
use crate::error::{CameraError, Result};
use crate::traits::FrameMetadata;

/// Expected RGB values for SMPTE color bars (8 bars).
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235),
    (235, 235, 11),
    (12, 236, 237),
    (13, 237, 13),
    (237, 13, 237),
    (238, 14, 13),
    (15, 15, 239),
    (16, 16, 16),
];

/// Per-channel tolerance for color matching, covers YUV->RGB rounding.
const COLOR_TOLERANCE: u8 = 15;

/// Validates that an image contains the SMPTE color bar pattern.
///
/// Samples the center of each of the 8 vertical stripes on the middle row.
pub fn validate_color_bars(image: &RgbImage) -> Result<()> {
    let bar_width = image.width / 8;
    let center_y = image.height / 2;
    if bar_width == 0 {
        return Err(CameraError::ValidationFailed(format!(
            "image too narrow for 8 bars: {} px",
            image.width
        )));
    }

    for (bar_idx, expected) in (0u32..).zip(SMPTE_COLOR_BARS) {
        let sample_x = bar_idx * bar_width + bar_width / 2;
        let actual = image.pixel_at(sample_x, center_y).ok_or_else(|| {
            CameraError::ValidationFailed(format!("no pixel at ({sample_x}, {center_y})"))
        })?;

        if !colors_match(actual, expected, COLOR_TOLERANCE) {
            return Err(CameraError::ValidationFailed(format!(
                "color bar {bar_idx} mismatch at ({sample_x}, {center_y}): \
                 expected RGB{expected:?}, got RGB{actual:?}"
            )));
        }
    }

    Ok(())
}

/// Validates that an image contains a horizontal gradient.
///
/// Luminance along the middle row must not drop (beyond rounding) and must rise
/// by at least 50 from left to right.
pub fn validate_gradient(image: &RgbImage) -> Result<()> {
    let center_y = image.height / 2;
    let mut first: Option<f32> = None;
    let mut prev: Option<f32> = None;

    for x in (0..image.width).step_by(10) {
        let (r, g, b) = image.pixel_at(x, center_y).ok_or_else(|| {
            CameraError::ValidationFailed(format!("no pixel at ({x}, {center_y})"))
        })?;

        // Rec. 601 luma
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );

        if let Some(prev) = prev {
            if luminance < prev - 1.0 {
                return Err(CameraError::ValidationFailed(format!(
                    "gradient decreases at x={x}: {luminance} < {prev}"
                )));
            }
        }
        first.get_or_insert(luminance);
        prev = Some(luminance);
    }

    let change = match (first, prev) {
        (Some(first), Some(last)) => last - first,
        _ => 0.0,
    };
    if change < 50.0 {
        return Err(CameraError::ValidationFailed(format!(
            "insufficient luminance change for gradient: {change} (expected at least 50)"
        )));
    }

    Ok(())
}

/// Validates that sequence numbers increase by exactly one.
pub fn validate_frame_sequence(frames: &[FrameMetadata]) -> Result<()> {
    if frames.is_empty() {
        return Err(CameraError::ValidationFailed(
            "cannot validate empty frame sequence".to_owned(),
        ));
    }

    for (i, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let expected = prev.sequence.wrapping_add(1);
            if curr.sequence != expected {
                return Err(CameraError::ValidationFailed(format!(
                    "frame sequence gap at index {}: expected {expected}, got {}",
                    i + 1,
                    curr.sequence
                )));
            }
        }
    }

    Ok(())
}

/// Decode a binary PPM (P6, maxval 255).
///
/// Accepts any whitespace between header fields and `#` comments, as written
/// by other tools.
pub fn decode_ppm(bytes: &[u8]) -> Result<RgbImage> {
    let mut header = PpmHeader { bytes, pos: 0 };

    let magic = header.token()?;
    if magic != b"P6" {
        return Err(CameraError::ValidationFailed(format!(
            "not a binary PPM: magic {:?}",
            String::from_utf8_lossy(magic)
        )));
    }
    let width = header.number("width")?;
    let height = header.number("height")?;
    let maxval = header.number("maxval")?;
    if maxval != 255 {
        return Err(CameraError::ValidationFailed(format!(
            "unsupported maxval {maxval}"
        )));
    }
    // Exactly one whitespace byte separates the header from the raster.
    let start = header.pos + 1;

    let expected = width as usize * height as usize * 3;
    let pixels = bytes
        .get(start..)
        .filter(|raster| raster.len() == expected)
        .ok_or_else(|| {
            CameraError::ValidationFailed(format!(
                "raster holds {} bytes, {width}x{height} needs {expected}",
                bytes.len().saturating_sub(start)
            ))
        })?;

    Ok(RgbImage {
        width,
        height,
        pixels: pixels.to_vec(),
    })
}

struct PpmHeader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PpmHeader<'a> {
    fn skip_separators(&mut self) {
        while let Some(&byte) = self.bytes.get(self.pos) {
            if byte == b'#' {
                while self.bytes.get(self.pos).is_some_and(|&b| b != b'\n') {
                    self.pos += 1;
                }
            } else if byte.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn token(&mut self) -> Result<&'a [u8]> {
        self.skip_separators();
        let start = self.pos;
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| !b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
        match self.bytes.get(start..self.pos) {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(CameraError::ValidationFailed("truncated PPM header".to_owned())),
        }
    }

    fn number(&mut self, field: &str) -> Result<u32> {
        let token = self.token()?;
        std::str::from_utf8(token)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| {
                CameraError::ValidationFailed(format!(
                    "bad PPM {field}: {:?}",
                    String::from_utf8_lossy(token)
                ))
            })
    }
}

/// Whether every channel of `actual` is within `tolerance` of `expected`.
pub fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u8) -> bool {
    actual.0.abs_diff(expected.0) <= tolerance
        && actual.1.abs_diff(expected.1) <= tolerance
        && actual.2.abs_diff(expected.2) <= tolerance
}
