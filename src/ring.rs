//! Fixed pool of hardware-mapped capture buffers.
//!
//! Every buffer is either with the hardware (queued, being filled) or with the
//! application (dequeued, being read). A dequeued buffer is represented by a
//! move-only [`BufferHandle`]; giving the handle back through
//! [`BufferRing::requeue`] is the only way to return the buffer, and payload
//! slices borrow the handle, so no read can outlive the requeue.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{CameraError, Result};
use crate::traits::BufferQueue;

/// Minimum buffer count, needed for double-buffering.
pub const MIN_BUFFERS: u32 = 2;

static NEXT_RING_ID: AtomicU64 = AtomicU64::new(1);

/// Ownership of a single buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Queued with the hardware.
    WithHardware,
    /// Held by the application.
    WithApplication,
}

struct Slot<R> {
    region: Option<R>,
    state: BufferState,
}

/// A filled buffer checked out of the ring.
///
/// Not `Clone`, not `Send`: exactly one live handle exists per dequeued buffer
/// and it never leaves the thread that owns the ring.
#[derive(Debug)]
pub struct BufferHandle {
    ring: u64,
    index: u32,
    bytes_used: u32,
    sequence: u32,
    timestamp: Duration,
    _not_send: PhantomData<*const ()>,
}

impl BufferHandle {
    /// Index of the buffer inside the ring.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Bytes of valid payload.
    pub const fn bytes_used(&self) -> u32 {
        self.bytes_used
    }

    /// Driver frame counter.
    pub const fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Capture timestamp.
    pub const fn timestamp(&self) -> Duration {
        self.timestamp
    }
}

/// Ring of mapped buffers driven through a [`BufferQueue`].
pub struct BufferRing<Q: BufferQueue> {
    queue: Q,
    slots: Vec<Slot<Q::Region>>,
    id: u64,
    enqueued: bool,
    released: bool,
    // Buffers whose hardware requeue failed; retried before the next dequeue.
    stranded: Vec<u32>,
}

impl<Q: BufferQueue> BufferRing<Q> {
    /// Request and map `count` buffers.
    ///
    /// Buffers shorter than `size_hint` are treated as failed mappings. On any
    /// failure every buffer mapped so far is unmapped and the allocation released;
    /// `queue` is dropped with the error.
    pub fn initialize(mut queue: Q, count: u32, size_hint: usize) -> Result<Self> {
        if count < MIN_BUFFERS {
            return Err(CameraError::InsufficientBuffers {
                requested: count,
                granted: 0,
            });
        }

        let granted = queue
            .request_buffers(count)
            .map_err(|err| CameraError::AllocationFailed {
                index: 0,
                reason: err.to_string(),
            })?;
        if granted < MIN_BUFFERS {
            release_quietly(&mut queue);
            return Err(CameraError::InsufficientBuffers {
                requested: count,
                granted,
            });
        }

        let mut mapped: Vec<Q::Region> = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let failure = match queue.map_buffer(index) {
                Ok(region) if region.as_ref().len() >= size_hint => {
                    mapped.push(region);
                    continue;
                }
                Ok(region) => {
                    let reason = format!(
                        "buffer holds {} bytes, frames need {size_hint}",
                        region.as_ref().len()
                    );
                    unmap_quietly(&mut queue, index, region);
                    CameraError::AllocationFailed { index, reason }
                }
                Err(err) => CameraError::AllocationFailed {
                    index,
                    reason: err.to_string(),
                },
            };

            for (done, region) in (0..index).zip(mapped.drain(..)) {
                unmap_quietly(&mut queue, done, region);
            }
            release_quietly(&mut queue);
            return Err(failure);
        }

        debug!(requested = count, granted, "buffer ring mapped");

        let slots = mapped
            .into_iter()
            .map(|region| Slot {
                region: Some(region),
                state: BufferState::WithApplication,
            })
            .collect();

        Ok(Self {
            queue,
            slots,
            id: NEXT_RING_ID.fetch_add(1, Ordering::Relaxed),
            enqueued: false,
            released: false,
            stranded: Vec::new(),
        })
    }

    /// Hand every buffer to the hardware. Valid once, right after initialization.
    pub fn enqueue_all(&mut self) -> Result<()> {
        if self.enqueued || self.released {
            return Err(CameraError::DeviceError(std::io::Error::other(
                "buffers already handed to hardware",
            )));
        }
        for (index, slot) in (0u32..).zip(self.slots.iter_mut()) {
            self.queue
                .queue_buffer(index)
                .map_err(CameraError::DeviceError)?;
            slot.state = BufferState::WithHardware;
        }
        self.enqueued = true;
        Ok(())
    }

    /// Take one filled buffer from the hardware.
    pub fn dequeue_one(&mut self) -> Result<BufferHandle> {
        if self.released {
            return Err(CameraError::DeviceError(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "buffer ring has been torn down",
            )));
        }
        self.retry_stranded();

        let filled = self
            .queue
            .dequeue_buffer()
            .map_err(CameraError::from_dequeue)?;

        let slot = self
            .slots
            .get_mut(filled.index as usize)
            .filter(|slot| slot.state == BufferState::WithHardware)
            .ok_or_else(|| {
                CameraError::DeviceError(std::io::Error::other(format!(
                    "hardware returned buffer {} which was not queued",
                    filled.index
                )))
            })?;
        slot.state = BufferState::WithApplication;

        debug!(
            index = filled.index,
            bytes = filled.bytes_used,
            sequence = filled.sequence,
            "buffer dequeued"
        );

        Ok(BufferHandle {
            ring: self.id,
            index: filled.index,
            bytes_used: filled.bytes_used,
            sequence: filled.sequence,
            timestamp: filled.timestamp,
            _not_send: PhantomData,
        })
    }

    /// Read access to a dequeued buffer, bounded by its payload length.
    pub fn payload<'a>(&'a self, handle: &'a BufferHandle) -> Result<&'a [u8]> {
        if handle.ring != self.id {
            return Err(CameraError::ForeignHandle);
        }
        let region = self
            .slots
            .get(handle.index as usize)
            .and_then(|slot| slot.region.as_ref())
            .ok_or(CameraError::NoDataAvailable)?;
        let bytes = region.as_ref();
        let used = (handle.bytes_used as usize).min(bytes.len());
        bytes.get(..used).ok_or(CameraError::NoDataAvailable)
    }

    /// Return a buffer to the hardware, consuming its handle.
    pub fn requeue(&mut self, handle: BufferHandle) -> Result<()> {
        if handle.ring != self.id {
            return Err(CameraError::ForeignHandle);
        }
        if self.released {
            // Torn down while checked out; nothing left to queue.
            return Ok(());
        }
        let index = handle.index;
        match self.queue.queue_buffer(index) {
            Ok(()) => {
                if let Some(slot) = self.slots.get_mut(index as usize) {
                    slot.state = BufferState::WithHardware;
                }
                Ok(())
            }
            Err(err) => {
                warn!(index, error = %err, "requeue failed, will retry");
                self.stranded.push(index);
                Err(CameraError::DeviceError(err))
            }
        }
    }

    /// Unmap every buffer and release the allocation. Idempotent.
    pub fn teardown(&mut self) {
        if self.released {
            return;
        }
        for (index, slot) in (0u32..).zip(self.slots.iter_mut()) {
            if let Some(region) = slot.region.take() {
                unmap_quietly(&mut self.queue, index, region);
            }
            slot.state = BufferState::WithApplication;
        }
        release_quietly(&mut self.queue);
        self.stranded.clear();
        self.released = true;
        debug!(buffers = self.slots.len(), "buffer ring torn down");
    }

    /// Number of buffers owned by the ring.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the ring owns no buffers.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// State of buffer `index`.
    pub fn state(&self, index: u32) -> Option<BufferState> {
        self.slots.get(index as usize).map(|slot| slot.state)
    }

    /// Buffers currently (with hardware, with application).
    pub fn partition(&self) -> (usize, usize) {
        let with_hardware = self
            .slots
            .iter()
            .filter(|slot| slot.state == BufferState::WithHardware)
            .count();
        (with_hardware, self.slots.len() - with_hardware)
    }

    /// Number of buffers still mapped.
    pub fn mapped(&self) -> usize {
        self.slots.iter().filter(|slot| slot.region.is_some()).count()
    }

    /// Whether `teardown` has run.
    pub const fn is_torn_down(&self) -> bool {
        self.released
    }

    pub(crate) const fn queue(&self) -> &Q {
        &self.queue
    }

    pub(crate) fn queue_mut(&mut self) -> &mut Q {
        &mut self.queue
    }

    fn retry_stranded(&mut self) {
        let stranded = std::mem::take(&mut self.stranded);
        for index in stranded {
            match self.queue.queue_buffer(index) {
                Ok(()) => {
                    if let Some(slot) = self.slots.get_mut(index as usize) {
                        slot.state = BufferState::WithHardware;
                    }
                    debug!(index, "stranded buffer requeued");
                }
                Err(_) => self.stranded.push(index),
            }
        }
    }
}

impl<Q: BufferQueue> Drop for BufferRing<Q> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn unmap_quietly<Q: BufferQueue>(queue: &mut Q, index: u32, region: Q::Region) {
    if let Err(err) = queue.unmap_buffer(index, region) {
        warn!(index, error = %err, "failed to unmap buffer");
    }
}

fn release_quietly<Q: BufferQueue>(queue: &mut Q) {
    if let Err(err) = queue.release_buffers() {
        warn!(error = %err, "failed to release buffers");
    }
}
