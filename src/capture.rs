//! Capture device lifecycle: negotiate a format, stream, hand out frames.

use std::borrow::Cow;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::convert::yuyv_to_rgb;
use crate::device::V4l2Node;
use crate::error::{CameraError, Result};
use crate::ring::BufferRing;
use crate::traits::{
    CameraBackend, CaptureFormat, DeviceState, FormatRequest, Frame, FrameMetadata, FramePayload,
    PixelEncoding, VideoNode,
};

/// Knobs for opening a hardware device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    /// Buffers to request for the ring.
    pub buffer_count: u32,
    /// Bound on every wait for a frame; `None` waits indefinitely.
    pub dequeue_timeout: Option<Duration>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            buffer_count: 4,
            dequeue_timeout: Some(Duration::from_secs(2)),
        }
    }
}

struct Session<N: VideoNode> {
    ring: BufferRing<N>,
    format: CaptureFormat,
}

/// A camera bound to one capture node.
///
/// Holds the node, its buffer ring and the negotiated format while `On`, and
/// nothing while `Off`.
pub struct CaptureDevice<N: VideoNode> {
    state: DeviceState,
    session: Option<Session<N>>,
}

impl<N: VideoNode> Default for CaptureDevice<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: VideoNode> CaptureDevice<N> {
    /// A closed device.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: DeviceState::Off,
            session: None,
        }
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> DeviceState {
        self.state
    }

    /// Negotiated format, `None` while closed.
    pub fn format(&self) -> Option<&CaptureFormat> {
        self.session.as_ref().map(|session| &session.format)
    }

    /// Bring up an already opened node: negotiate, map buffers, start streaming.
    ///
    /// The device may clamp or substitute any part of `request`; the returned
    /// format is what was actually applied. On failure everything acquired so
    /// far is released and the device stays `Off`.
    pub fn open_node(
        &mut self,
        node: N,
        request: &FormatRequest,
        buffer_count: u32,
    ) -> Result<CaptureFormat> {
        if self.state != DeviceState::Off {
            return Err(CameraError::InvalidState(self.state));
        }
        self.state = DeviceState::StartingUp;

        match start(node, request, buffer_count) {
            Ok(session) => {
                let format = session.format.clone();
                info!(
                    width = format.width,
                    height = format.height,
                    fourcc = %format.fourcc,
                    buffers = session.ring.len(),
                    "capture device streaming"
                );
                self.session = Some(session);
                self.state = DeviceState::On;
                Ok(format)
            }
            Err(err) => {
                warn!(error = %err, "capture device failed to start");
                self.state = DeviceState::Off;
                Err(err)
            }
        }
    }
}

impl CaptureDevice<V4l2Node> {
    /// Open a V4L2 capture node by path and start streaming.
    pub fn open<P: AsRef<Path>>(
        path: P,
        request: &FormatRequest,
        options: &OpenOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let node = V4l2Node::open(path, options.dequeue_timeout).map_err(|source| {
            CameraError::DeviceUnavailable {
                path: path.to_path_buf(),
                source,
            }
        })?;

        let mut device = Self::new();
        device.open_node(node, request, options.buffer_count)?;
        Ok(device)
    }
}

impl<N: VideoNode> CameraBackend for CaptureDevice<N> {
    fn active_format(&self) -> Option<&CaptureFormat> {
        self.format()
    }

    /// Capture and interpret one frame.
    ///
    /// The buffer goes back to the hardware whether or not interpretation
    /// succeeds.
    fn capture_one(&mut self) -> Result<Frame> {
        let state = self.state;
        let session = match (state, self.session.as_mut()) {
            (DeviceState::On, Some(session)) => session,
            _ => return Err(CameraError::InvalidState(state)),
        };

        let handle = session.ring.dequeue_one()?;
        let metadata = FrameMetadata {
            sequence: handle.sequence(),
            timestamp: handle.timestamp(),
            bytes_used: handle.bytes_used(),
        };
        let payload = session
            .ring
            .payload(&handle)
            .and_then(|bytes| interpret(&session.format, bytes));
        let requeued = session.ring.requeue(handle);

        let payload = payload?;
        if let Err(err) = requeued {
            warn!(error = %err, sequence = metadata.sequence, "buffer requeue failed after capture");
        }
        debug!(sequence = metadata.sequence, bytes = metadata.bytes_used, "frame captured");
        Ok(Frame { payload, metadata })
    }

    /// Frame rate the hardware currently reports.
    fn query_frame_rate(&mut self) -> Result<f64> {
        let session = match (self.state, self.session.as_ref()) {
            (DeviceState::On, Some(session)) => session,
            _ => return Err(CameraError::InvalidState(self.state)),
        };
        let interval = session
            .ring
            .queue()
            .frame_interval()
            .map_err(CameraError::DeviceError)?;
        interval
            .frames_per_second()
            .ok_or(CameraError::RateUnavailable {
                numerator: interval.numerator,
                denominator: interval.denominator,
            })
    }

    /// Stop streaming and release every resource. Idempotent.
    fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            self.state = DeviceState::Off;
            return;
        };
        self.state = DeviceState::ShuttingDown;

        if let Err(err) = session.ring.queue_mut().stream_off() {
            warn!(error = %err, "stream off failed");
        }
        session.ring.teardown();
        drop(session);

        self.state = DeviceState::Off;
        info!("capture device closed");
    }
}

impl<N: VideoNode> Drop for CaptureDevice<N> {
    fn drop(&mut self) {
        self.close();
    }
}

fn start<N: VideoNode>(
    mut node: N,
    request: &FormatRequest,
    buffer_count: u32,
) -> Result<Session<N>> {
    let current = node
        .format()
        .map_err(|err| CameraError::FormatNegotiationFailed(format!("cannot read format: {err}")))?;
    let desired = request.apply_to(&current);

    let format = match node.set_format(&desired) {
        Ok(applied) => applied,
        Err(err) => {
            warn!(error = %err, "device rejected requested format, keeping current one");
            node.format().map_err(|err| {
                CameraError::FormatNegotiationFailed(format!("cannot read format: {err}"))
            })?
        }
    };
    if format.width == 0 || format.height == 0 {
        return Err(CameraError::FormatNegotiationFailed(format!(
            "device reported {}x{}",
            format.width, format.height
        )));
    }
    if (format.width, format.height, format.fourcc) != (desired.width, desired.height, desired.fourcc)
    {
        info!(
            width = format.width,
            height = format.height,
            fourcc = %format.fourcc,
            "device adjusted requested format"
        );
    }

    let mut ring = BufferRing::initialize(node, buffer_count, format.size as usize)?;
    ring.enqueue_all()?;
    ring.queue_mut()
        .stream_on()
        .map_err(CameraError::DeviceError)?;

    Ok(Session { ring, format })
}

fn interpret(format: &CaptureFormat, bytes: &[u8]) -> Result<FramePayload> {
    match format.encoding() {
        PixelEncoding::CompressedJpeg => Ok(FramePayload::Jpeg(bytes.to_vec())),
        PixelEncoding::RawInterleavedYuv422 => {
            let packed = packed_rows(format, bytes);
            yuyv_to_rgb(&packed, format.width, format.height).map(FramePayload::Rgb)
        }
        PixelEncoding::Unsupported => Err(CameraError::UnsupportedEncoding(format.fourcc)),
    }
}

/// Drop per-row padding so the converter sees `2 * width` bytes per row.
fn packed_rows<'a>(format: &CaptureFormat, bytes: &'a [u8]) -> Cow<'a, [u8]> {
    let row = format.width as usize * 2;
    let stride = (format.stride as usize).max(row);
    let rows = format.height as usize;

    if stride == row {
        return Cow::Borrowed(bytes.get(..row * rows).unwrap_or(bytes));
    }
    Cow::Owned(
        bytes
            .chunks(stride)
            .take(rows)
            .flat_map(|line| line.get(..row).unwrap_or(line))
            .copied()
            .collect(),
    )
}
