//! YUYV 4:2:2 to RGB conversion.
//!
//! Pure functions: no state, safe to call from any thread on independent inputs.

use crate::error::{CameraError, Result};

/// Packed 8-bit RGB raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// `3 * width * height` bytes of R, G, B triples, row-major.
    pub pixels: Vec<u8>,
}

impl RgbImage {
    /// Get RGB values for a pixel at the specified coordinates.
    ///
    /// Returns `None` if the coordinates are outside the raster.
    #[must_use]
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<(u8, u8, u8)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        match self.pixels.get(offset..offset + 3)? {
            &[r, g, b] => Some((r, g, b)),
            _ => None,
        }
    }
}

/// Number of bytes a packed YUYV frame of the given size occupies.
pub fn yuyv_frame_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(2))
}

/// Convert a packed YUYV frame to RGB.
///
/// `raw` must hold exactly `2 * width * height` bytes. Every `Y0 U Y1 V` group
/// yields two pixels sharing one chroma pair.
pub fn yuyv_to_rgb(raw: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let expected = yuyv_frame_len(width, height).ok_or(CameraError::BadInputLength {
        expected: usize::MAX,
        actual: raw.len(),
    })?;
    if raw.len() != expected {
        return Err(CameraError::BadInputLength {
            expected,
            actual: raw.len(),
        });
    }

    let mut pixels = Vec::with_capacity(expected / 2 * 3);
    let mut groups = raw.chunks_exact(4);
    for group in &mut groups {
        if let &[y0, u, y1, v] = group {
            let (r, g, b) = yuv_to_rgb(y0, u, v);
            pixels.extend_from_slice(&[r, g, b]);
            let (r, g, b) = yuv_to_rgb(y1, u, v);
            pixels.extend_from_slice(&[r, g, b]);
        }
    }
    // Odd pixel count: the last pixel has no V sample.
    if let &[y, u] = groups.remainder() {
        let (r, g, b) = yuv_to_rgb(y, u, 128);
        pixels.extend_from_slice(&[r, g, b]);
    }

    Ok(RgbImage {
        width,
        height,
        pixels,
    })
}

/// Convert YUV values to RGB.
///
/// Uses the ITU-R BT.601 coefficients on full-range luma. Channels are
/// truncated toward zero, then clamped to 0-255.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f64::from(y);
    let u_f = f64::from(u) - 128.0;
    let v_f = f64::from(v) - 128.0;

    let r = 1.402f64.mul_add(v_f, y_f);
    let g = 0.714_136f64.mul_add(-v_f, 0.344_136f64.mul_add(-u_f, y_f));
    let b = 1.772f64.mul_add(u_f, y_f);

    (clamp(r), clamp(g), clamp(b))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp(val: f64) -> u8 {
    val.trunc().clamp(0.0, 255.0) as u8
}
