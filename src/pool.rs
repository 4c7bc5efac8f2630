//! Buffer pool for the three acquisition strategies.
//!
//! A pool is created with [`BufferPool::allocate`], made visible to the
//! device with [`BufferPool::map_or_register`] and torn down exactly once
//! with [`BufferPool::release`] after streaming has stopped.

use std::mem;
use std::ops::Range;

use tracing::{debug, warn};

use crate::error::{CaptureError, Result};
use crate::traits::{CaptureDevice, IoMethod, QueueRequest};

/// Fewest device-owned buffers a streaming session can run with.
pub const MIN_MAPPED_BUFFERS: u32 = 2;

/// One buffer of the pool.
#[derive(Debug)]
pub enum Buffer<R> {
    /// Device-owned region mapped into the process; must be unmapped.
    Mapped(R),
    /// Process-owned heap region; freed on drop.
    Owned(Box<[u8]>),
}

impl<R: AsRef<[u8]>> Buffer<R> {
    /// Buffer contents.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Mapped(region) => region.as_ref(),
            Self::Owned(region) => &region[..],
        }
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the buffer has zero length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the region's lifetime belongs to the device.
    pub const fn is_device_owned(&self) -> bool {
        matches!(self, Self::Mapped(_))
    }
}

/// Resource counters for leak checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Heap regions allocated.
    pub allocated: usize,
    /// Heap regions freed.
    pub freed: usize,
    /// Device regions mapped.
    pub mapped: usize,
    /// Device regions unmapped.
    pub unmapped: usize,
    /// Heap regions registered with the device.
    pub registered: usize,
    /// Buffers given up without being freed or unmapped.
    pub leaked: usize,
}

impl PoolStats {
    /// Every allocation freed and every mapping unmapped.
    pub const fn is_balanced(&self) -> bool {
        self.allocated == self.freed && self.mapped == self.unmapped
    }
}

/// Ordered set of capture buffers, indexed `0..len()`.
#[derive(Debug)]
pub struct BufferPool<R> {
    method: IoMethod,
    count: u32,
    buffer_size: usize,
    buffers: Vec<Buffer<R>>,
    stats: PoolStats,
    released: bool,
}

fn alloc_region(size: usize) -> Result<Box<[u8]>> {
    let mut region = Vec::new();
    region
        .try_reserve_exact(size)
        .map_err(|err| CaptureError::Allocation(format!("Out of memory ({size} bytes): {err}")))?;
    region.resize(size, 0);
    Ok(region.into_boxed_slice())
}

fn mapping_error(index: u32, err: CaptureError) -> CaptureError {
    match err {
        err @ CaptureError::Mapping { .. } => err,
        other => CaptureError::Mapping {
            index,
            message: other.to_string(),
        },
    }
}

impl<R: AsRef<[u8]>> BufferPool<R> {
    /// Allocate the buffer set for `method`.
    ///
    /// For `Mmap` the device is asked for `count_hint` buffers and may grant
    /// fewer; fewer than [`MIN_MAPPED_BUFFERS`] is an allocation failure. For
    /// `Read` and `UserPtr`, `count_hint` heap regions of `buffer_size` bytes
    /// are allocated.
    pub fn allocate<D>(
        device: &mut D,
        method: IoMethod,
        count_hint: u32,
        buffer_size: usize,
    ) -> Result<Self>
    where
        D: CaptureDevice<Region = R>,
    {
        let mut pool = Self {
            method,
            count: 0,
            buffer_size,
            buffers: Vec::new(),
            stats: PoolStats::default(),
            released: false,
        };

        match method {
            IoMethod::Mmap => {
                let granted = device
                    .request_buffers(IoMethod::Mmap, count_hint)
                    .map_err(|err| {
                        CaptureError::Allocation(format!(
                            "{} does not support memory mapping: {err}",
                            device.path().display()
                        ))
                    })?;
                if granted < MIN_MAPPED_BUFFERS {
                    return Err(CaptureError::Allocation(format!(
                        "Insufficient buffer memory on {}: {granted} of {count_hint} buffers granted",
                        device.path().display()
                    )));
                }
                pool.count = granted;
                pool.buffers.reserve(granted as usize);
            }
            IoMethod::Read | IoMethod::UserPtr => {
                if count_hint == 0 || buffer_size == 0 {
                    return Err(CaptureError::Allocation(format!(
                        "Cannot allocate {count_hint} buffers of {buffer_size} bytes"
                    )));
                }
                for _ in 0..count_hint {
                    pool.buffers.push(Buffer::Owned(alloc_region(buffer_size)?));
                    pool.stats.allocated += 1;
                }
                pool.count = count_hint;
            }
        }

        debug!(%method, count = pool.count, buffer_size, "Allocated buffer pool");
        Ok(pool)
    }

    /// Map device buffers (`Mmap`) or register heap buffers (`UserPtr`).
    ///
    /// A failed mapping unmaps every region mapped so far before the error
    /// is returned. `Read` has nothing to do.
    pub fn map_or_register<D>(&mut self, device: &mut D) -> Result<()>
    where
        D: CaptureDevice<Region = R>,
    {
        match self.method {
            IoMethod::Read => Ok(()),
            IoMethod::Mmap => {
                #[allow(clippy::cast_possible_truncation)]
                let start = self.buffers.len() as u32;
                for index in start..self.count {
                    if let Err(err) = self.map_one(device, index) {
                        if let Some(release_err) = self.drain(device) {
                            warn!(error = %release_err, "Rollback after failed mapping was incomplete");
                        }
                        return Err(err);
                    }
                }
                Ok(())
            }
            IoMethod::UserPtr => {
                if self.stats.registered > 0 {
                    return Ok(());
                }
                let granted = device
                    .request_buffers(IoMethod::UserPtr, self.count)
                    .map_err(|err| CaptureError::Mapping {
                        index: 0,
                        message: format!(
                            "{} does not support user pointer i/o: {err}",
                            device.path().display()
                        ),
                    })?;
                if granted < self.count {
                    return Err(CaptureError::Mapping {
                        index: granted,
                        message: format!("device accepted {granted} of {} user buffers", self.count),
                    });
                }
                self.stats.registered = self.count as usize;
                Ok(())
            }
        }
    }

    fn map_one<D>(&mut self, device: &mut D, index: u32) -> Result<()>
    where
        D: CaptureDevice<Region = R>,
    {
        let info = device
            .query_buffer(index)
            .map_err(|err| mapping_error(index, err))?;

        if (info.length as usize) < self.buffer_size {
            return Err(CaptureError::Mapping {
                index,
                message: format!(
                    "buffer length {} does not hold negotiated frame size {}",
                    info.length, self.buffer_size
                ),
            });
        }

        let region = device
            .map_buffer(&info)
            .map_err(|err| mapping_error(index, err))?;
        self.buffers.push(Buffer::Mapped(region));
        self.stats.mapped += 1;
        Ok(())
    }

    /// Unmap or free every buffer. Safe to call more than once and on a
    /// partially mapped pool.
    ///
    /// Every buffer is attempted even when one fails; the first failure is
    /// returned.
    pub fn release<D>(&mut self, device: &mut D) -> Result<()>
    where
        D: CaptureDevice<Region = R>,
    {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.drain(device).map_or(Ok(()), Err)
    }

    fn drain<D>(&mut self, device: &mut D) -> Option<CaptureError>
    where
        D: CaptureDevice<Region = R>,
    {
        let mut first_error = None;
        for (index, buffer) in (0u32..).zip(self.buffers.drain(..)) {
            match buffer {
                Buffer::Mapped(region) => match device.unmap_buffer(region) {
                    Ok(()) => self.stats.unmapped += 1,
                    Err(err) => {
                        warn!(index, error = %err, "munmap failed");
                        first_error.get_or_insert(CaptureError::Release {
                            index,
                            message: err.to_string(),
                        });
                    }
                },
                Buffer::Owned(region) => {
                    drop(region);
                    self.stats.freed += 1;
                }
            }
        }
        first_error
    }

    /// Give up every buffer without freeing or unmapping it.
    ///
    /// Used when the device may still be writing into the regions. Returns
    /// the number of buffers leaked; later releases are no-ops.
    pub fn abandon(&mut self) -> usize {
        let leaked = self.buffers.len();
        for buffer in self.buffers.drain(..) {
            mem::forget(buffer);
        }
        self.stats.leaked += leaked;
        self.released = true;
        leaked
    }

    /// Acquisition strategy of this pool.
    pub const fn method(&self) -> IoMethod {
        self.method
    }

    /// Number of buffers (the device-granted count for `Mmap`).
    pub const fn len(&self) -> usize {
        self.count as usize
    }

    /// Every valid pool index.
    pub const fn indices(&self) -> Range<u32> {
        0..self.count
    }

    /// Whether the pool holds no buffers.
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Negotiated frame size each buffer must hold.
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Buffer at `index`, once mapped or allocated.
    pub fn buffer(&self, index: u32) -> Option<&Buffer<R>> {
        self.buffers.get(index as usize)
    }

    /// Resource counters.
    pub const fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Whether [`BufferPool::release`] has run.
    pub const fn is_released(&self) -> bool {
        self.released
    }

    /// Queue request for `index`, or `None` if it cannot be queued.
    pub fn queue_request(&mut self, index: u32) -> Option<QueueRequest<'_>> {
        match self.method {
            IoMethod::Read => None,
            IoMethod::Mmap => (index < self.count && (index as usize) < self.buffers.len())
                .then_some(QueueRequest::Mmap { index }),
            IoMethod::UserPtr => match self.buffers.get_mut(index as usize)? {
                Buffer::Owned(region) => Some(QueueRequest::UserPtr {
                    index,
                    region: &mut region[..],
                }),
                Buffer::Mapped(_) => None,
            },
        }
    }

    /// Heap region that `read(2)` fills.
    pub fn read_target(&mut self) -> Option<&mut [u8]> {
        match self.buffers.first_mut()? {
            Buffer::Owned(region) => Some(&mut region[..]),
            Buffer::Mapped(_) => None,
        }
    }

    /// Index of the heap region starting at `addr`.
    pub fn index_of_userptr(&self, addr: usize) -> Option<u32> {
        (0u32..)
            .zip(&self.buffers)
            .find(|(_, buffer)| match buffer {
                Buffer::Owned(region) => region.as_ptr() as usize == addr,
                Buffer::Mapped(_) => false,
            })
            .map(|(index, _)| index)
    }
}

impl<R> Drop for BufferPool<R> {
    fn drop(&mut self) {
        let leaked = self
            .buffers
            .iter()
            .filter(|buffer| matches!(buffer, Buffer::Mapped(_)))
            .count();
        if leaked > 0 {
            warn!(leaked, "Buffer pool dropped without release; mapped regions leaked");
        }
    }
}
