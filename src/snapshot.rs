//! Persist captured frames to disk.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::convert::RgbImage;
use crate::error::Result;
use crate::traits::{Frame, FramePayload};

/// File format a snapshot was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotEncoding {
    /// Device JPEG bitstream, written verbatim.
    Jpeg,
    /// Binary PPM (P6) of the converted RGB raster.
    Ppm,
}

impl SnapshotEncoding {
    /// File extension without the dot.
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Ppm => "ppm",
        }
    }
}

/// Where and what a snapshot wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotInfo {
    /// Written file.
    pub path: PathBuf,
    /// Bytes written.
    pub bytes: usize,
    /// File format.
    pub encoding: SnapshotEncoding,
    /// Frame width, when known (raw captures).
    pub width: Option<u32>,
    /// Frame height, when known (raw captures).
    pub height: Option<u32>,
    /// Driver sequence number of the captured frame.
    pub sequence: u32,
}

/// Writes numbered snapshot files into one directory.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    directory: PathBuf,
    prefix: String,
    // Next index to try; found by scanning the directory on first write.
    next: Option<u32>,
}

impl SnapshotWriter {
    /// Write into `directory`, naming files `<prefix>-NNNN.<ext>`.
    pub fn new<D: Into<PathBuf>, S: Into<String>>(directory: D, prefix: S) -> Self {
        Self {
            directory: directory.into(),
            prefix: prefix.into(),
            next: None,
        }
    }

    /// Write `frame`, creating the directory if needed.
    ///
    /// Numbering continues after the highest `<prefix>-NNNN` file already in
    /// the directory, and an existing file is never overwritten.
    pub fn write(&mut self, frame: &Frame) -> Result<SnapshotInfo> {
        fs::create_dir_all(&self.directory)?;

        let (bytes, encoding, dims) = match &frame.payload {
            FramePayload::Jpeg(bytes) => (bytes.clone(), SnapshotEncoding::Jpeg, None),
            FramePayload::Rgb(image) => (
                encode_ppm(image),
                SnapshotEncoding::Ppm,
                Some((image.width, image.height)),
            ),
        };

        let mut index = match self.next {
            Some(index) => index,
            None => next_free_index(&self.directory, &self.prefix)?,
        };
        let (path, mut file) = loop {
            let path = self.directory.join(format!(
                "{}-{index:04}.{}",
                self.prefix,
                encoding.extension()
            ));
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (path, file),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => index += 1,
                Err(err) => return Err(err.into()),
            }
        };
        self.next = Some(index + 1);
        file.write_all(&bytes)?;
        file.sync_all()?;

        info!(path = %path.display(), bytes = bytes.len(), "snapshot written");

        Ok(SnapshotInfo {
            path,
            bytes: bytes.len(),
            encoding,
            width: dims.map(|(w, _)| w),
            height: dims.map(|(_, h)| h),
            sequence: frame.metadata.sequence,
        })
    }
}

/// One past the highest index among `<prefix>-NNNN.*` files in `directory`.
fn next_free_index(directory: &Path, prefix: &str) -> Result<u32> {
    let mut next = 0;
    for entry in fs::read_dir(directory)? {
        let name = entry?.file_name();
        let Some(index) = name
            .to_str()
            .and_then(|name| name.strip_prefix(prefix))
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|rest| rest.split('.').next())
            .and_then(|digits| digits.parse::<u32>().ok())
        else {
            continue;
        };
        next = next.max(index.saturating_add(1));
    }
    Ok(next)
}

/// Encode an RGB raster as binary PPM.
#[must_use]
pub fn encode_ppm(image: &RgbImage) -> Vec<u8> {
    let header = format!("P6\n{} {}\n255\n", image.width, image.height);
    let mut out = Vec::with_capacity(header.len() + image.pixels.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&image.pixels);
    out
}
