//! Scriptable capture node for testing without hardware.
//!
//! `MockNode` fills its buffers with a synthetic YUYV pattern (or a fixed JPEG
//! bitstream) and records every buffer operation in a ledger shared with a
//! [`MockProbe`], so tests can check what was mapped, queued and released after
//! the node itself has been moved into a ring, a device or a worker thread.

use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{CameraError, Result};
use crate::traits::{
    BufferQueue, CameraBackend, CaptureFormat, Dequeued, FourCC, Frame, FrameInterval,
    PixelEncoding, VideoNode,
};

/// Smallest well-formed-looking JPEG: SOI, an APP0 stub, EOI.
pub const TINY_JPEG: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x04, 0x4A, 0x46, 0xFF, 0xD9,
];

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// YUYV values of the eight SMPTE bars: white, yellow, cyan, green, magenta, red, blue, black.
const BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

/// Render a packed (unpadded) YUYV frame.
#[must_use]
pub fn yuyv_pattern(width: u32, height: u32, pattern: TestPattern) -> Vec<u8> {
    let bar_width = (width / 8).max(1);
    let mut data = Vec::with_capacity(width as usize * height as usize * 2);

    for _ in 0..height {
        for x in (0..width).step_by(2) {
            let (y, u, v) = match pattern {
                TestPattern::ColorBars => BARS
                    .get((x / bar_width) as usize)
                    .copied()
                    .unwrap_or(BARS[7]),
                #[allow(clippy::cast_possible_truncation)]
                TestPattern::Gradient => (((x * 255) / width) as u8, 128, 128),
                TestPattern::Solid(y, u, v) => (y, u, v),
            };
            if x + 1 < width {
                data.extend_from_slice(&[y, u, y, v]);
            } else {
                data.extend_from_slice(&[y, u]);
            }
        }
    }
    data
}

#[derive(Debug, Default)]
struct MockLedger {
    granted: u32,
    mapped: BTreeSet<u32>,
    queued: VecDeque<u32>,
    unmap_calls: usize,
    streaming: bool,
    released: bool,
    closed: bool,
    fail_next_queue: bool,
}

/// Read side of a [`MockNode`]'s ledger.
#[derive(Debug, Clone)]
pub struct MockProbe {
    ledger: Arc<Mutex<MockLedger>>,
}

impl MockProbe {
    fn ledger(&self) -> MutexGuard<'_, MockLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffers currently mapped.
    pub fn mapped(&self) -> usize {
        self.ledger().mapped.len()
    }

    /// Number of unmap calls seen.
    pub fn unmap_calls(&self) -> usize {
        self.ledger().unmap_calls
    }

    /// Buffers currently queued with the "hardware".
    pub fn queued(&self) -> usize {
        self.ledger().queued.len()
    }

    /// Whether the buffer allocation was released.
    pub fn released(&self) -> bool {
        self.ledger().released
    }

    /// Whether the node is streaming.
    pub fn streaming(&self) -> bool {
        self.ledger().streaming
    }

    /// Whether the node has been dropped.
    pub fn closed(&self) -> bool {
        self.ledger().closed
    }

    /// Make the next `queue_buffer` call fail.
    pub fn fail_next_queue(&self) {
        self.ledger().fail_next_queue = true;
    }
}

/// Mock capture node.
pub struct MockNode {
    format: CaptureFormat,
    row_padding: u32,
    max_resolution: Option<(u32, u32)>,
    reject_set_format: bool,
    fail_format: bool,
    fail_stream_on: bool,
    granted: Option<u32>,
    buffer_len: Option<usize>,
    bytes_used: Option<u32>,
    fail_map_at: Option<u32>,
    dequeue_failures: VecDeque<io::ErrorKind>,
    interval: FrameInterval,
    pattern: TestPattern,
    jpeg: Vec<u8>,
    sequence: u32,
    ledger: Arc<Mutex<MockLedger>>,
}

impl Default for MockNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNode {
    /// Create a 640x480 YUYV node streaming color bars at 30 fps.
    #[must_use]
    pub fn new() -> Self {
        Self {
            format: CaptureFormat::new(640, 480, FourCC::YUYV),
            row_padding: 0,
            max_resolution: None,
            reject_set_format: false,
            fail_format: false,
            fail_stream_on: false,
            granted: None,
            buffer_len: None,
            bytes_used: None,
            fail_map_at: None,
            dequeue_failures: VecDeque::new(),
            interval: FrameInterval {
                numerator: 1,
                denominator: 30,
            },
            pattern: TestPattern::ColorBars,
            jpeg: TINY_JPEG.to_vec(),
            sequence: 0,
            ledger: Arc::default(),
        }
    }

    /// Handle for inspecting the ledger after the node is moved.
    #[must_use]
    pub fn probe(&self) -> MockProbe {
        MockProbe {
            ledger: Arc::clone(&self.ledger),
        }
    }

    /// Set the current format.
    #[must_use]
    pub fn with_format(mut self, format: CaptureFormat) -> Self {
        self.format = format;
        self.apply_padding();
        self
    }

    /// Pad every row by `bytes` beyond the packed width.
    #[must_use]
    pub fn with_row_padding(mut self, bytes: u32) -> Self {
        self.row_padding = bytes;
        self.apply_padding();
        self
    }

    /// Clamp requested resolutions to at most `width` x `height`.
    #[must_use]
    pub fn with_max_resolution(mut self, width: u32, height: u32) -> Self {
        self.max_resolution = Some((width, height));
        self
    }

    /// Fail every `set_format` call.
    #[must_use]
    pub fn rejecting_set_format(mut self) -> Self {
        self.reject_set_format = true;
        self
    }

    /// Fail every `format` call.
    #[must_use]
    pub fn failing_format(mut self) -> Self {
        self.fail_format = true;
        self
    }

    /// Fail `stream_on`.
    #[must_use]
    pub fn failing_stream_on(mut self) -> Self {
        self.fail_stream_on = true;
        self
    }

    /// Grant this many buffers whatever was requested.
    #[must_use]
    pub fn with_granted_buffers(mut self, granted: u32) -> Self {
        self.granted = Some(granted);
        self
    }

    /// Size of every mapped buffer.
    #[must_use]
    pub fn with_buffer_len(mut self, len: usize) -> Self {
        self.buffer_len = Some(len);
        self
    }

    /// Report this many valid bytes for every dequeued buffer.
    #[must_use]
    pub fn with_bytes_used(mut self, bytes: u32) -> Self {
        self.bytes_used = Some(bytes);
        self
    }

    /// Fail mapping of buffer `index`.
    #[must_use]
    pub fn with_map_failure_at(mut self, index: u32) -> Self {
        self.fail_map_at = Some(index);
        self
    }

    /// Fail the next dequeues with these error kinds, in order.
    #[must_use]
    pub fn with_dequeue_failures<I: IntoIterator<Item = io::ErrorKind>>(mut self, kinds: I) -> Self {
        self.dequeue_failures.extend(kinds);
        self
    }

    /// Frame interval reported by the node.
    #[must_use]
    pub fn with_frame_interval(mut self, numerator: u32, denominator: u32) -> Self {
        self.interval = FrameInterval {
            numerator,
            denominator,
        };
        self
    }

    /// Pattern rendered into YUYV buffers.
    #[must_use]
    pub fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    fn ledger(&self) -> MutexGuard<'_, MockLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_padding(&mut self) {
        self.format.stride = self.format.width * 2 + self.row_padding;
        self.format.size = self.format.stride * self.format.height;
    }

    fn frame_bytes(&self) -> Vec<u8> {
        if self.format.encoding() == PixelEncoding::CompressedJpeg {
            return self.jpeg.clone();
        }
        let packed = yuyv_pattern(self.format.width, self.format.height, self.pattern);
        if self.row_padding == 0 {
            return packed;
        }
        let row = self.format.width as usize * 2;
        let mut padded = Vec::with_capacity(self.format.size as usize);
        for line in packed.chunks(row) {
            padded.extend_from_slice(line);
            padded.resize(padded.len() + self.row_padding as usize, 0);
        }
        padded
    }

    fn region_len(&self) -> usize {
        self.buffer_len
            .unwrap_or_else(|| (self.format.size as usize).max(self.jpeg.len()))
    }
}

impl BufferQueue for MockNode {
    type Region = Vec<u8>;

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let granted = self.granted.unwrap_or(count);
        let mut ledger = self.ledger();
        ledger.granted = granted;
        ledger.released = false;
        Ok(granted)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<Vec<u8>> {
        if self.fail_map_at == Some(index) {
            return Err(io::Error::other(format!("mmap of buffer {index} failed")));
        }
        if index >= self.ledger().granted {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        let mut region = self.frame_bytes();
        region.resize(self.region_len(), 0);
        self.ledger().mapped.insert(index);
        Ok(region)
    }

    fn unmap_buffer(&mut self, index: u32, region: Vec<u8>) -> io::Result<()> {
        drop(region);
        let mut ledger = self.ledger();
        ledger.mapped.remove(&index);
        ledger.unmap_calls += 1;
        Ok(())
    }

    fn release_buffers(&mut self) -> io::Result<()> {
        let mut ledger = self.ledger();
        ledger.granted = 0;
        ledger.queued.clear();
        ledger.released = true;
        Ok(())
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut ledger = self.ledger();
        if std::mem::take(&mut ledger.fail_next_queue) {
            return Err(io::Error::other("VIDIOC_QBUF failed"));
        }
        if index >= ledger.granted {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        ledger.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<Dequeued> {
        if let Some(kind) = self.dequeue_failures.pop_front() {
            return Err(io::Error::from(kind));
        }
        let index = self
            .ledger()
            .queued
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;

        let sequence = self.sequence;
        self.sequence += 1;
        let full = u32::try_from(self.frame_bytes().len()).unwrap_or(u32::MAX);

        Ok(Dequeued {
            index,
            bytes_used: self.bytes_used.unwrap_or(full),
            sequence,
            timestamp: Duration::from_millis(u64::from(sequence) * 33),
        })
    }
}

impl VideoNode for MockNode {
    fn format(&self) -> io::Result<CaptureFormat> {
        if self.fail_format {
            return Err(io::Error::other("VIDIOC_G_FMT failed"));
        }
        Ok(self.format.clone())
    }

    fn set_format(&mut self, format: &CaptureFormat) -> io::Result<CaptureFormat> {
        if self.reject_set_format {
            return Err(io::Error::other("VIDIOC_S_FMT rejected"));
        }
        let (width, height) = match self.max_resolution {
            Some((max_w, max_h)) => (format.width.min(max_w), format.height.min(max_h)),
            None => (format.width, format.height),
        };
        self.format = CaptureFormat::new(width, height, format.fourcc);
        self.apply_padding();
        Ok(self.format.clone())
    }

    fn frame_interval(&self) -> io::Result<FrameInterval> {
        Ok(self.interval)
    }

    fn stream_on(&mut self) -> io::Result<()> {
        if self.fail_stream_on {
            return Err(io::Error::other("VIDIOC_STREAMON failed"));
        }
        self.ledger().streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.ledger().streaming = false;
        Ok(())
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.ledger().closed = true;
    }
}

/// Backend whose every capture blocks for a fixed time, then times out.
pub struct StalledBackend {
    stall: Duration,
}

impl StalledBackend {
    /// Block each capture for `stall`.
    #[must_use]
    pub const fn new(stall: Duration) -> Self {
        Self { stall }
    }
}

impl CameraBackend for StalledBackend {
    fn active_format(&self) -> Option<&CaptureFormat> {
        None
    }

    fn capture_one(&mut self) -> Result<Frame> {
        std::thread::sleep(self.stall);
        Err(CameraError::Timeout)
    }

    fn query_frame_rate(&mut self) -> Result<f64> {
        Ok(30.0)
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_node_format() {
        let mut node = MockNode::new();
        let format = node.format().expect("format should succeed");
        assert_eq!(format.width, 640);
        assert_eq!(format.height, 480);

        let desired = CaptureFormat::new(1280, 720, FourCC::YUYV);
        let actual = node.set_format(&desired).expect("set_format should succeed");
        assert_eq!((actual.width, actual.height), (1280, 720));
    }

    #[test]
    fn test_mock_node_clamps_resolution() {
        let mut node = MockNode::new().with_max_resolution(320, 240);
        let actual = node
            .set_format(&CaptureFormat::new(1920, 1080, FourCC::YUYV))
            .expect("set_format should succeed");
        assert_eq!((actual.width, actual.height), (320, 240));
        assert_eq!(actual.size, 320 * 240 * 2);
    }

    #[test]
    fn test_ledger_tracks_buffers() {
        let mut node = MockNode::new().with_format(CaptureFormat::new(8, 2, FourCC::YUYV));
        let probe = node.probe();

        assert_eq!(node.request_buffers(3).expect("request"), 3);
        let region = node.map_buffer(1).expect("map");
        assert_eq!(region.len(), 32);
        assert_eq!(probe.mapped(), 1);

        node.queue_buffer(1).expect("queue");
        assert_eq!(probe.queued(), 1);
        let filled = node.dequeue_buffer().expect("dequeue");
        assert_eq!(filled.index, 1);
        assert_eq!(filled.bytes_used, 32);

        node.unmap_buffer(1, region).expect("unmap");
        node.release_buffers().expect("release");
        assert_eq!(probe.mapped(), 0);
        assert!(probe.released());

        drop(node);
        assert!(probe.closed());
    }

    #[test]
    fn test_scripted_dequeue_failures() {
        let mut node = MockNode::new().with_dequeue_failures([io::ErrorKind::TimedOut]);
        node.request_buffers(2).expect("request");
        node.queue_buffer(0).expect("queue");

        let err = node.dequeue_buffer().expect_err("scripted failure");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(node.dequeue_buffer().expect("dequeue").index, 0);

        let err = node.dequeue_buffer().expect_err("nothing queued");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_color_bars_pattern() {
        let data = yuyv_pattern(640, 480, TestPattern::ColorBars);
        assert_eq!(data.len(), 640 * 480 * 2);
        // First bar is white.
        assert_eq!(data[0], 235);
        // Last bar is black.
        assert_eq!(data[638 * 2], 16);
    }

    #[test]
    fn test_gradient_pattern() {
        let data = yuyv_pattern(640, 480, TestPattern::Gradient);
        assert!(data[0] < 10);

        let last_row_start = 479 * 640 * 2;
        assert!(data[last_row_start + 638 * 2] > 200);
    }

    #[test]
    fn test_solid_pattern() {
        let data = yuyv_pattern(64, 64, TestPattern::Solid(128, 64, 192));
        assert_eq!(&data[..4], &[128, 64, 128, 192]);
    }

    #[test]
    fn test_row_padding_layout() {
        let mut node = MockNode::new()
            .with_format(CaptureFormat::new(4, 2, FourCC::YUYV))
            .with_row_padding(4)
            .with_pattern(TestPattern::Solid(50, 128, 128));
        assert_eq!(node.format().expect("format").stride, 12);

        node.request_buffers(2).expect("request");
        let region = node.map_buffer(0).expect("map");
        assert_eq!(region.len(), 24);
        assert_eq!(&region[8..12], &[0, 0, 0, 0]);
        assert_eq!(region[12], 50);
    }

    #[test]
    fn test_jpeg_buffers_hold_bitstream() {
        let mut node = MockNode::new().with_format(CaptureFormat::new(64, 48, FourCC::MJPG));
        node.request_buffers(2).expect("request");
        let region = node.map_buffer(0).expect("map");
        assert_eq!(&region[..TINY_JPEG.len()], TINY_JPEG);

        node.queue_buffer(0).expect("queue");
        let filled = node.dequeue_buffer().expect("dequeue");
        assert_eq!(filled.bytes_used as usize, TINY_JPEG.len());
    }
}
