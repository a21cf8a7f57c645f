//! Webcam-Handler: a V4L2 webcam device handler
//!
//! Owns a capture node through a fixed ring of mapped buffers, turns raw YUYV
//! or JPEG captures into frames, and drives them with a single-flight command
//! protocol whose blocking work runs on a dedicated capture thread.

pub mod capture;
pub mod config;
pub mod convert;
pub mod device;
pub mod error;
pub mod mailbox;
pub mod protocol;
pub mod ring;
pub mod snapshot;
pub mod traits;
pub mod validation;
pub mod worker;

#[cfg(test)]
pub mod mock;

pub use capture::{CaptureDevice, OpenOptions};
pub use config::HandlerConfig;
pub use convert::{yuyv_to_rgb, RgbImage};
pub use device::V4l2Node;
pub use error::{CameraError, Result};
pub use protocol::{CommandKind, CommandProtocol, CommandResult, LogSink, ResultSink};
pub use ring::{BufferHandle, BufferRing};
pub use snapshot::SnapshotWriter;
pub use traits::{
    CameraBackend, CaptureFormat, DeviceState, FormatRequest, FourCC, Frame, FrameMetadata,
    FramePayload,
};
pub use worker::CaptureWorker;
