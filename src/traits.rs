//! Core types and the hardware/backend seams of the handler.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use crate::convert::RgbImage;
use crate::error::{CameraError, Result};

/// Pixel format tag (e.g., YUYV, MJPG).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// JPEG pixel format (still JPEG).
    pub const JPEG: Self = Self::new(b"JPEG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");

    /// How frames in this format are interpreted.
    #[must_use]
    pub fn encoding(self) -> PixelEncoding {
        match &self.0 {
            b"YUYV" => PixelEncoding::RawInterleavedYuv422,
            b"MJPG" | b"JPEG" => PixelEncoding::CompressedJpeg,
            _ => PixelEncoding::Unsupported,
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({self})")
    }
}

impl FromStr for FourCC {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        let code: [u8; 4] = s.as_bytes().try_into().map_err(|_| {
            CameraError::Config(format!("pixel format must be 4 characters, got {s:?}"))
        })?;
        Ok(Self(code))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// How the bytes of a frame are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelEncoding {
    /// Packed YUYV 4:2:2, two bytes per pixel.
    RawInterleavedYuv422,
    /// Self-contained JPEG bitstream.
    CompressedJpeg,
    /// No defined interpretation.
    Unsupported,
}

/// Active capture format as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFormat {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Maximum frame size in bytes.
    pub size: u32,
}

impl CaptureFormat {
    /// Create a packed format specification; stride and size assume YUYV.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let stride = width * 2;
        let size = stride * height;
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }

    /// Encoding derived from the pixel format.
    #[must_use]
    pub fn encoding(&self) -> PixelEncoding {
        self.fourcc.encoding()
    }
}

/// Format the caller would like; the device may clamp or substitute any field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    /// Requested width in pixels.
    pub width: u32,
    /// Requested height in pixels.
    pub height: u32,
    /// Requested pixel format, `None` keeps the device's current one.
    pub fourcc: Option<FourCC>,
}

impl FormatRequest {
    /// Request a resolution and pixel format.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        Self {
            width,
            height,
            fourcc: Some(fourcc),
        }
    }

    /// Apply this request on top of the device's current format.
    #[must_use]
    pub fn apply_to(&self, current: &CaptureFormat) -> CaptureFormat {
        CaptureFormat {
            width: self.width,
            height: self.height,
            fourcc: self.fourcc.unwrap_or(current.fourcc),
            ..current.clone()
        }
    }
}

/// Time per frame as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInterval {
    /// Seconds numerator.
    pub numerator: u32,
    /// Seconds denominator.
    pub denominator: u32,
}

impl FrameInterval {
    /// Frames per second, `None` when either term is zero.
    #[must_use]
    pub fn frames_per_second(self) -> Option<f64> {
        if self.numerator == 0 || self.denominator == 0 {
            return None;
        }
        Some(f64::from(self.denominator) / f64::from(self.numerator))
    }
}

/// Lifecycle of a capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Closed, no resources held.
    Off,
    /// Inside `open`.
    StartingUp,
    /// Streaming.
    On,
    /// Inside `close`.
    ShuttingDown,
}

/// Metadata for a captured frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// Interpreted frame content.
#[derive(Debug, Clone)]
pub enum FramePayload {
    /// Raw device bytes of a compressed capture.
    Jpeg(Vec<u8>),
    /// Converted RGB raster of a raw capture.
    Rgb(RgbImage),
}

impl FramePayload {
    /// The converted raster, if this was a raw capture.
    #[must_use]
    pub const fn as_rgb(&self) -> Option<&RgbImage> {
        match self {
            Self::Rgb(image) => Some(image),
            Self::Jpeg(_) => None,
        }
    }

    /// The JPEG bitstream, if this was a compressed capture.
    #[must_use]
    pub fn as_jpeg(&self) -> Option<&[u8]> {
        match self {
            Self::Jpeg(bytes) => Some(bytes.as_slice()),
            Self::Rgb(_) => None,
        }
    }
}

/// A captured frame, copied out of the buffer ring.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame content.
    pub payload: FramePayload,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// A buffer the hardware has filled and handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    /// Buffer index.
    pub index: u32,
    /// Bytes of valid payload.
    pub bytes_used: u32,
    /// Driver frame counter.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
}

/// Buffer half of the hardware control surface.
///
/// Methods report raw `io::Error`s; the ring maps them onto [`CameraError`].
pub trait BufferQueue {
    /// A mapped buffer region.
    type Region: AsRef<[u8]>;

    /// Ask for `count` buffers. Returns how many the hardware granted.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// Map buffer `index` into the process.
    fn map_buffer(&mut self, index: u32) -> io::Result<Self::Region>;

    /// Unmap a region previously returned by `map_buffer`.
    fn unmap_buffer(&mut self, index: u32, region: Self::Region) -> io::Result<()>;

    /// Free the hardware allocation made by `request_buffers`.
    fn release_buffers(&mut self) -> io::Result<()>;

    /// Hand buffer `index` to the hardware.
    fn queue_buffer(&mut self, index: u32) -> io::Result<()>;

    /// Wait for a filled buffer.
    ///
    /// `WouldBlock` means no frame is ready, `TimedOut` that the bounded wait elapsed.
    fn dequeue_buffer(&mut self) -> io::Result<Dequeued>;
}

/// Full hardware control surface of a capture node.
pub trait VideoNode: BufferQueue {
    /// Read the current capture format.
    fn format(&self) -> io::Result<CaptureFormat>;

    /// Ask for a format. Returns the format the driver actually applied.
    fn set_format(&mut self, format: &CaptureFormat) -> io::Result<CaptureFormat>;

    /// Read the streaming frame interval.
    fn frame_interval(&self) -> io::Result<FrameInterval>;

    /// Start streaming.
    fn stream_on(&mut self) -> io::Result<()>;

    /// Stop streaming.
    fn stream_off(&mut self) -> io::Result<()>;
}

/// Capability interface the command layer drives. One implementation per hardware family.
pub trait CameraBackend {
    /// Active format, `None` while closed.
    fn active_format(&self) -> Option<&CaptureFormat>;

    /// Capture and interpret a single frame.
    fn capture_one(&mut self) -> Result<Frame>;

    /// Frame rate as currently reported by the hardware.
    fn query_frame_rate(&mut self) -> Result<f64>;

    /// Release the device. Idempotent.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_encoding() {
        assert_eq!(FourCC::YUYV.encoding(), PixelEncoding::RawInterleavedYuv422);
        assert_eq!(FourCC::MJPG.encoding(), PixelEncoding::CompressedJpeg);
        assert_eq!(FourCC::JPEG.encoding(), PixelEncoding::CompressedJpeg);
        assert_eq!(FourCC::RGB3.encoding(), PixelEncoding::Unsupported);
    }

    #[test]
    fn test_fourcc_parse_and_display() {
        let fourcc: FourCC = "MJPG".parse().expect("parse should succeed");
        assert_eq!(fourcc, FourCC::MJPG);
        assert_eq!(fourcc.to_string(), "MJPG");
        assert!("MJP".parse::<FourCC>().is_err());
    }

    #[test]
    fn test_frame_interval_rate() {
        let interval = FrameInterval {
            numerator: 1,
            denominator: 30,
        };
        assert_eq!(interval.frames_per_second(), Some(30.0));

        let undefined = FrameInterval {
            numerator: 0,
            denominator: 30,
        };
        assert_eq!(undefined.frames_per_second(), None);
    }

    #[test]
    fn test_request_keeps_current_fourcc() {
        let current = CaptureFormat::new(320, 240, FourCC::MJPG);
        let request = FormatRequest {
            width: 640,
            height: 480,
            fourcc: None,
        };
        let desired = request.apply_to(&current);
        assert_eq!(desired.fourcc, FourCC::MJPG);
        assert_eq!((desired.width, desired.height), (640, 480));
    }
}
