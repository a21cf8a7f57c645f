//! Handler configuration, loaded from JSON.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::OpenOptions;
use crate::error::{CameraError, Result};
use crate::ring::MIN_BUFFERS;
use crate::snapshot::SnapshotWriter;
use crate::traits::{FormatRequest, FourCC};

/// Everything needed to bring up the handler.
///
/// Every field has a default, so `{}` is a valid configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandlerConfig {
    /// Capture node path.
    pub device_path: PathBuf,
    /// Requested frame width.
    pub width: u32,
    /// Requested frame height.
    pub height: u32,
    /// Requested pixel format as a four-character code; device default if absent.
    pub pixel_format: Option<String>,
    /// Number of capture buffers.
    pub buffer_count: u32,
    /// Bound on each frame wait in milliseconds; `0` waits indefinitely.
    pub dequeue_timeout_ms: u64,
    /// Frame rate reported before any hardware query.
    pub initial_frame_rate: f64,
    /// Period of the command tick in milliseconds.
    pub tick_period_ms: u64,
    /// Directory snapshots are written to.
    pub snapshot_dir: PathBuf,
    /// File name prefix of snapshots.
    pub snapshot_prefix: String,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/video0"),
            width: 640,
            height: 480,
            pixel_format: None,
            buffer_count: 4,
            dequeue_timeout_ms: 2000,
            initial_frame_rate: 30.0,
            tick_period_ms: 100,
            snapshot_dir: PathBuf::from("snapshots"),
            snapshot_prefix: "frame".to_owned(),
        }
    }
}

impl HandlerConfig {
    /// Read and validate a JSON configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|err| CameraError::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the handler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CameraError::Config(format!(
                "resolution must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.buffer_count < MIN_BUFFERS {
            return Err(CameraError::Config(format!(
                "buffer_count must be at least {MIN_BUFFERS}, got {}",
                self.buffer_count
            )));
        }
        if !self.initial_frame_rate.is_finite() || self.initial_frame_rate <= 0.0 {
            return Err(CameraError::Config(format!(
                "initial_frame_rate must be positive, got {}",
                self.initial_frame_rate
            )));
        }
        if self.tick_period_ms == 0 {
            return Err(CameraError::Config("tick_period_ms must be non-zero".to_owned()));
        }
        self.fourcc()?;
        Ok(())
    }

    /// Requested pixel format, parsed.
    pub fn fourcc(&self) -> Result<Option<FourCC>> {
        self.pixel_format.as_deref().map(str::parse).transpose()
    }

    /// Format request built from the configured resolution and pixel format.
    pub fn format_request(&self) -> Result<FormatRequest> {
        Ok(FormatRequest {
            width: self.width,
            height: self.height,
            fourcc: self.fourcc()?,
        })
    }

    /// Device open options.
    pub const fn open_options(&self) -> OpenOptions {
        OpenOptions {
            buffer_count: self.buffer_count,
            dequeue_timeout: match self.dequeue_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }

    /// Command tick period.
    pub const fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    /// Snapshot writer for the configured directory and prefix.
    pub fn snapshot_writer(&self) -> SnapshotWriter {
        SnapshotWriter::new(self.snapshot_dir.clone(), self.snapshot_prefix.clone())
    }
}
