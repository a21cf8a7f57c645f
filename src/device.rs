//! V4L2 capture node driven through raw buffer ioctls.
//!
//! The v4l crate's mmap stream owns its buffers and hides their indices, which
//! the ring needs to track ownership. This node therefore issues
//! `VIDIOC_REQBUFS`/`QUERYBUF`/`QBUF`/`DQBUF` itself and leaves format and
//! parameter handling to the crate's safe API.
#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::path::Path;
use std::ptr::{self, NonNull};
use std::slice;
use std::time::Duration;

use tracing::debug;
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{Device, Timestamp};

use crate::traits::{BufferQueue, CaptureFormat, Dequeued, FourCC, FrameInterval, VideoNode};

/// A buffer mapped from the driver into this process.
#[derive(Debug)]
pub struct MappedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl AsRef<[u8]> for MappedBuffer {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: `ptr` comes from a successful mmap of `len` bytes and stays
        // mapped until `unmap_buffer` consumes this value.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

/// V4L2 video capture node.
pub struct V4l2Node {
    device: Device,
    timeout: Option<Duration>,
}

impl V4l2Node {
    /// Open a capture node such as `/dev/video0`.
    ///
    /// Fails unless the node supports video capture and streaming I/O.
    /// `timeout` bounds every dequeue wait; `None` waits indefinitely.
    pub fn open<P: AsRef<Path>>(path: P, timeout: Option<Duration>) -> io::Result<Self> {
        let device = Device::with_path(path)?;
        let caps = device.query_caps()?;

        for (flag, what) in [
            (Flags::VIDEO_CAPTURE, "video capture"),
            (Flags::STREAMING, "streaming I/O"),
        ] {
            if !caps.capabilities.contains(flag) {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("{} ({}) does not support {what}", caps.card, caps.driver),
                ));
            }
        }

        debug!(
            driver = %caps.driver,
            card = %caps.card,
            bus = %caps.bus,
            "opened capture node"
        );

        Ok(Self { device, timeout })
    }

    fn fd(&self) -> c_int {
        self.device.handle().fd()
    }

    fn buffer_desc(index: u32) -> v4l2_buffer {
        v4l2_buffer {
            index,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: v4l2_buffer is a plain C struct, all-zero is a valid value.
            ..unsafe { mem::zeroed() }
        }
    }

    fn request(&self, count: u32) -> io::Result<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: v4l2_requestbuffers is a plain C struct, all-zero is valid.
            ..unsafe { mem::zeroed() }
        };
        // SAFETY: `req` is a live, correctly typed argument for VIDIOC_REQBUFS.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_REQBUFS,
                ptr::addr_of_mut!(req).cast::<c_void>(),
            )?;
        }
        Ok(req.count)
    }

    fn stream_ioctl(&self, request: v4l2::vidioc::_IOC_TYPE) -> io::Result<()> {
        let mut typ = Type::VideoCapture as u32;
        // SAFETY: STREAMON/STREAMOFF take a pointer to the buffer type.
        unsafe { v4l2::ioctl(self.fd(), request, ptr::addr_of_mut!(typ).cast::<c_void>()) }
    }

    fn wait_readable(&self) -> io::Result<()> {
        let timeout_ms = self
            .timeout
            .map_or(-1, |t| i32::try_from(t.as_millis()).unwrap_or(i32::MAX));
        match self.device.handle().poll(libc::POLLIN, timeout_ms)? {
            0 => Err(io::Error::from(io::ErrorKind::TimedOut)),
            _ => Ok(()),
        }
    }
}

impl BufferQueue for V4l2Node {
    type Region = MappedBuffer;

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        self.request(count)
    }

    fn map_buffer(&mut self, index: u32) -> io::Result<MappedBuffer> {
        let mut buf = Self::buffer_desc(index);
        // SAFETY: `buf` is a live, correctly typed argument for VIDIOC_QUERYBUF.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_QUERYBUF,
                ptr::addr_of_mut!(buf).cast::<c_void>(),
            )?;
        }

        let len = buf.length as usize;
        // SAFETY: for MMAP buffers QUERYBUF fills the `offset` member of the union.
        let offset = libc::off_t::try_from(unsafe { buf.m.offset })
            .map_err(|_| io::Error::other("buffer offset out of range"))?;
        // SAFETY: maps a driver-provided region; the result is checked below.
        let mapped = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd(),
                offset,
            )?
        };

        let ptr = NonNull::new(mapped.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        Ok(MappedBuffer { ptr, len })
    }

    fn unmap_buffer(&mut self, _index: u32, region: MappedBuffer) -> io::Result<()> {
        // SAFETY: `region` was produced by `map_buffer` and is consumed here, so
        // no slice into it can outlive the unmap.
        unsafe { v4l2::munmap(region.ptr.as_ptr().cast::<c_void>(), region.len) }
    }

    fn release_buffers(&mut self) -> io::Result<()> {
        self.request(0).map(|_| ())
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut buf = Self::buffer_desc(index);
        // SAFETY: `buf` is a live, correctly typed argument for VIDIOC_QBUF.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_QBUF,
                ptr::addr_of_mut!(buf).cast::<c_void>(),
            )
        }
    }

    fn dequeue_buffer(&mut self) -> io::Result<Dequeued> {
        self.wait_readable()?;

        let mut buf = Self::buffer_desc(0);
        // SAFETY: `buf` is a live, correctly typed argument for VIDIOC_DQBUF.
        unsafe {
            v4l2::ioctl(
                self.fd(),
                v4l2::vidioc::VIDIOC_DQBUF,
                ptr::addr_of_mut!(buf).cast::<c_void>(),
            )?;
        }

        Ok(Dequeued {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
            timestamp: Duration::from(Timestamp::from(buf.timestamp)),
        })
    }
}

impl VideoNode for V4l2Node {
    fn format(&self) -> io::Result<CaptureFormat> {
        let fmt = self.device.format()?;
        Ok(CaptureFormat {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn set_format(&mut self, format: &CaptureFormat) -> io::Result<CaptureFormat> {
        let mut fmt = self.device.format()?;
        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = self.device.set_format(&fmt)?;
        Ok(CaptureFormat {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn frame_interval(&self) -> io::Result<FrameInterval> {
        let params = self.device.params()?;
        Ok(FrameInterval {
            numerator: params.interval.numerator,
            denominator: params.interval.denominator,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.stream_ioctl(v4l2::vidioc::VIDIOC_STREAMON)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.stream_ioctl(v4l2::vidioc::VIDIOC_STREAMOFF)
    }
}
