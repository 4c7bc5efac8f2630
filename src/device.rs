//! V4L2 device implementation using the v4l crate.
//!
//! Format and rate negotiation go through the v4l crate's safe `Capture` API.
//! The buffer queue (REQBUFS/QUERYBUF/QBUF/DQBUF/STREAMON/STREAMOFF), the
//! crop reset, the shared mappings and the readiness wait use raw ioctls and
//! libc calls on the same descriptor.
#![allow(unsafe_code)]

use std::fs;
use std::io;
use std::mem::{self, ManuallyDrop};
use std::os::raw::c_int;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::slice;
use std::time::Duration;

use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::framesize::FrameSizeEnum;
use v4l::memory::Memory;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{v4l2, v4l_sys, Device, Fraction};

use crate::error::{CaptureError, Result};
use crate::traits::{
    BufferInfo, CaptureDevice, Dequeued, DeviceCapabilities, Format, FormatDescription, FourCC,
    FrameInterval, FrameSizeRange, IoMethod, QueueRequest, Readiness,
};

/// A device-owned buffer mapped into the process with `mmap(2)`.
///
/// Dropping the region unmaps it; [`CaptureDevice::unmap_buffer`] does the
/// same but reports failures.
#[derive(Debug)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl MmapRegion {
    fn unmap(self) -> io::Result<()> {
        let region = ManuallyDrop::new(self);
        // SAFETY: ptr/len describe a live mapping created by `map_buffer` and
        // ManuallyDrop prevents a second munmap from Drop.
        let ret = unsafe { libc::munmap(region.ptr.as_ptr().cast(), region.len) };
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl AsRef<[u8]> for MmapRegion {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: the mapping is valid for `len` bytes until unmapped, and
        // unmapping consumes the region.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: see `unmap`; this is the only other place a mapping ends.
        if unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) } == -1 {
            warn!(error = %io::Error::last_os_error(), "munmap failed");
        }
    }
}

/// An open V4L2 capture device.
pub struct V4l2Device {
    device: Device,
    path: PathBuf,
    fd: c_int,
    capabilities: DeviceCapabilities,
    read_sequence: u32,
}

impl V4l2Device {
    /// Open a V4L2 device node (e.g. `/dev/video0`).
    ///
    /// The path must be a character device that supports video capture.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let device_error = |message: String| CaptureError::Device {
            path: path.clone(),
            message,
        };

        let metadata =
            fs::metadata(&path).map_err(|err| device_error(format!("cannot identify: {err}")))?;
        if !metadata.file_type().is_char_device() {
            return Err(device_error("is no device".to_owned()));
        }

        let device = Device::with_path(&path)
            .map_err(|err| device_error(format!("cannot open: {err}")))?;

        let caps = device
            .query_caps()
            .map_err(|err| device_error(format!("is no V4L2 device: {err}")))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(Flags::STREAMING),
            can_read_write: caps.capabilities.contains(Flags::READ_WRITE),
        };

        if !capabilities.can_capture {
            return Err(device_error("does not support video capture".to_owned()));
        }

        let fd = device.handle().fd();
        info!(
            path = %path.display(),
            driver = %capabilities.driver,
            card = %capabilities.card,
            "Opened capture device"
        );

        Ok(Self {
            device,
            path,
            fd,
            capabilities,
            read_sequence: 0,
        })
    }

    /// Raw file descriptor, for extension unit queries.
    pub(crate) const fn fd(&self) -> c_int {
        self.fd
    }
}

const fn capture_type() -> u32 {
    Type::VideoCapture as u32
}

const fn memory_for(method: IoMethod) -> u32 {
    match method {
        IoMethod::UserPtr => Memory::UserPtr as u32,
        IoMethod::Read | IoMethod::Mmap => Memory::Mmap as u32,
    }
}

fn zeroed_buffer() -> v4l_sys::v4l2_buffer {
    // SAFETY: v4l2_buffer is a plain C struct for which all-zero is valid.
    unsafe { mem::zeroed() }
}

fn to_format(fmt: &v4l::Format) -> Format {
    Format {
        width: fmt.width,
        height: fmt.height,
        fourcc: FourCC::from(fmt.fourcc),
        stride: fmt.stride,
        size: fmt.size,
    }
}

fn to_duration(sec: i64, usec: i64) -> Duration {
    // V4L2 timestamps are non-negative in practice
    #[allow(clippy::cast_sign_loss)]
    let secs = sec.max(0) as u64;
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let nanos = (usec.max(0) as u32).saturating_mul(1000);
    Duration::new(secs, nanos)
}

fn monotonic_now() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer for the duration of the call.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    #[allow(clippy::useless_conversion)]
    to_duration(i64::from(ts.tv_sec), i64::from(ts.tv_nsec) / 1000)
}

impl CaptureDevice for V4l2Device {
    type Region = MmapRegion;

    fn path(&self) -> &Path {
        &self.path
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn format(&self) -> Result<Format> {
        let fmt = Capture::format(&self.device)
            .map_err(|err| CaptureError::Capability(format!("VIDIOC_G_FMT: {err}")))?;
        Ok(to_format(&fmt))
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        let mut fmt = Capture::format(&self.device)
            .map_err(|err| CaptureError::Capability(format!("VIDIOC_G_FMT: {err}")))?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = Capture::set_format(&self.device, &fmt)
            .map_err(|err| CaptureError::Capability(format!("VIDIOC_S_FMT: {err}")))?;

        Ok(to_format(&fmt))
    }

    fn frame_interval(&self) -> Result<FrameInterval> {
        let params = Capture::params(&self.device)
            .map_err(|err| CaptureError::Capability(format!("VIDIOC_G_PARM: {err}")))?;
        Ok(FrameInterval {
            numerator: params.interval.numerator,
            denominator: params.interval.denominator,
        })
    }

    fn set_frame_interval(&mut self, interval: FrameInterval) -> Result<FrameInterval> {
        let params = Parameters::new(Fraction::new(interval.numerator, interval.denominator));
        let params = Capture::set_params(&self.device, &params)
            .map_err(|err| CaptureError::Capability(format!("VIDIOC_S_PARM: {err}")))?;
        Ok(FrameInterval {
            numerator: params.interval.numerator,
            denominator: params.interval.denominator,
        })
    }

    fn reset_crop(&mut self) -> Result<()> {
        // SAFETY: v4l2_cropcap is a plain C struct for which all-zero is valid.
        let mut cropcap: v4l_sys::v4l2_cropcap = unsafe { mem::zeroed() };
        cropcap.type_ = capture_type();
        // SAFETY: cropcap is a valid v4l2_cropcap for the duration of the call.
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_CROPCAP,
                ptr::addr_of_mut!(cropcap).cast(),
            )
        }
        .map_err(|err| CaptureError::Capability(format!("VIDIOC_CROPCAP: {err}")))?;

        let mut crop = v4l_sys::v4l2_crop {
            type_: capture_type(),
            c: cropcap.defrect,
        };
        // SAFETY: crop is a valid v4l2_crop for the duration of the call.
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_S_CROP,
                ptr::addr_of_mut!(crop).cast(),
            )
        }
        .map_err(|err| CaptureError::Capability(format!("VIDIOC_S_CROP: {err}")))?;

        debug!(
            width = crop.c.width,
            height = crop.c.height,
            "Crop reset to default rectangle"
        );
        Ok(())
    }

    fn enum_formats(&self) -> Result<Vec<FormatDescription>> {
        let descriptions = Capture::enum_formats(&self.device)
            .map_err(|err| CaptureError::Capability(format!("VIDIOC_ENUM_FMT: {err}")))?;

        let mut formats = Vec::with_capacity(descriptions.len());
        for desc in descriptions {
            let frame_sizes = match Capture::enum_framesizes(&self.device, desc.fourcc) {
                Ok(sizes) => sizes
                    .into_iter()
                    .map(|size| match size.size {
                        FrameSizeEnum::Discrete(d) => FrameSizeRange::Discrete {
                            width: d.width,
                            height: d.height,
                        },
                        // Continuous ranges are reported as stepwise with unit steps
                        FrameSizeEnum::Stepwise(s) if s.step_width == 1 && s.step_height == 1 => {
                            FrameSizeRange::Continuous {
                                min_width: s.min_width,
                                max_width: s.max_width,
                                min_height: s.min_height,
                                max_height: s.max_height,
                            }
                        }
                        FrameSizeEnum::Stepwise(s) => FrameSizeRange::Stepwise {
                            min_width: s.min_width,
                            max_width: s.max_width,
                            step_width: s.step_width,
                            min_height: s.min_height,
                            max_height: s.max_height,
                            step_height: s.step_height,
                        },
                    })
                    .collect(),
                Err(err) => {
                    debug!(fourcc = %FourCC::from(desc.fourcc), error = %err, "No frame sizes reported");
                    Vec::new()
                }
            };

            formats.push(FormatDescription {
                index: desc.index,
                fourcc: FourCC::from(desc.fourcc),
                description: desc.description,
                frame_sizes,
            });
        }
        Ok(formats)
    }

    fn request_buffers(&mut self, method: IoMethod, count: u32) -> Result<u32> {
        let mut req = v4l_sys::v4l2_requestbuffers {
            count,
            type_: capture_type(),
            memory: memory_for(method),
            // SAFETY: remaining fields are plain integers, zero is valid.
            ..unsafe { mem::zeroed() }
        };
        // SAFETY: req is a valid v4l2_requestbuffers for the duration of the call.
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_REQBUFS,
                ptr::addr_of_mut!(req).cast(),
            )?;
        }
        debug!(requested = count, granted = req.count, %method, "VIDIOC_REQBUFS");
        Ok(req.count)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferInfo> {
        let mut buf = v4l_sys::v4l2_buffer {
            index,
            type_: capture_type(),
            memory: Memory::Mmap as u32,
            ..zeroed_buffer()
        };
        // SAFETY: buf is a valid v4l2_buffer for the duration of the call.
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_QUERYBUF,
                ptr::addr_of_mut!(buf).cast(),
            )?;
        }
        // SAFETY: the driver fills `m.offset` for MMAP buffers.
        let offset = unsafe { buf.m.offset };
        Ok(BufferInfo {
            index,
            length: buf.length,
            offset,
        })
    }

    fn map_buffer(&mut self, info: &BufferInfo) -> Result<MmapRegion> {
        let mapping_error = |message: String| CaptureError::Mapping {
            index: info.index,
            message,
        };
        let offset = libc::off_t::try_from(info.offset)
            .map_err(|_| mapping_error(format!("offset {} out of range", info.offset)))?;
        let len = info.length as usize;

        // SAFETY: a fresh shared mapping of a driver-provided offset; the
        // result is checked against MAP_FAILED before use.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(mapping_error(format!(
                "mmap: {}",
                io::Error::last_os_error()
            )));
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| mapping_error("mmap returned null".to_owned()))?;
        Ok(MmapRegion { ptr, len })
    }

    fn unmap_buffer(&mut self, region: MmapRegion) -> Result<()> {
        region.unmap().map_err(CaptureError::Io)
    }

    fn queue_buffer(&mut self, request: QueueRequest<'_>) -> Result<()> {
        let mut buf = v4l_sys::v4l2_buffer {
            index: request.index(),
            type_: capture_type(),
            ..zeroed_buffer()
        };
        match request {
            QueueRequest::Mmap { .. } => buf.memory = Memory::Mmap as u32,
            QueueRequest::UserPtr { region, .. } => {
                buf.memory = Memory::UserPtr as u32;
                buf.m.userptr = region.as_mut_ptr() as usize as std::os::raw::c_ulong;
                buf.length = u32::try_from(region.len()).map_err(|_| {
                    CaptureError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "user buffer larger than 4 GiB",
                    ))
                })?;
            }
        }
        // SAFETY: buf is valid for the call; for USERPTR the region outlives
        // the pool, which is only released after stream-off.
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_QBUF,
                ptr::addr_of_mut!(buf).cast(),
            )
        }
        .map_err(CaptureError::from_queue_io)
    }

    fn dequeue_buffer(&mut self, method: IoMethod) -> Result<Dequeued> {
        let mut buf = v4l_sys::v4l2_buffer {
            type_: capture_type(),
            memory: memory_for(method),
            ..zeroed_buffer()
        };
        // SAFETY: buf is a valid v4l2_buffer for the duration of the call.
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_DQBUF,
                ptr::addr_of_mut!(buf).cast(),
            )
        }
        .map_err(CaptureError::from_queue_io)?;

        let userptr = (method == IoMethod::UserPtr).then(|| {
            // SAFETY: the driver fills `m.userptr` for USERPTR buffers.
            unsafe { buf.m.userptr as usize }
        });

        #[allow(clippy::useless_conversion)]
        let timestamp = to_duration(
            i64::from(buf.timestamp.tv_sec),
            i64::from(buf.timestamp.tv_usec),
        );

        Ok(Dequeued {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
            timestamp,
            userptr,
        })
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> Result<Dequeued> {
        // SAFETY: buf is a valid writable region of buf.len() bytes.
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(CaptureError::from_queue_io(io::Error::last_os_error()));
        }

        let sequence = self.read_sequence;
        self.read_sequence = self.read_sequence.wrapping_add(1);

        Ok(Dequeued {
            index: 0,
            bytes_used: u32::try_from(n).unwrap_or(u32::MAX),
            sequence,
            timestamp: monotonic_now(),
            userptr: None,
        })
    }

    fn stream_on(&mut self) -> Result<()> {
        let mut typ = capture_type();
        // SAFETY: typ is a valid buffer type for the duration of the call.
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_STREAMON,
                ptr::addr_of_mut!(typ).cast(),
            )
        }
        .map_err(|err| CaptureError::StreamControl(format!("VIDIOC_STREAMON: {err}")))
    }

    fn stream_off(&mut self) -> Result<()> {
        let mut typ = capture_type();
        // SAFETY: typ is a valid buffer type for the duration of the call.
        unsafe {
            v4l2::ioctl(
                self.fd,
                v4l2::vidioc::VIDIOC_STREAMOFF,
                ptr::addr_of_mut!(typ).cast(),
            )
        }
        .map_err(|err| CaptureError::StreamControl(format!("VIDIOC_STREAMOFF: {err}")))
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);

        // SAFETY: pfd is a valid array of one pollfd for the duration of the call.
        match unsafe { libc::poll(&mut pfd, 1, millis) } {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    Ok(Readiness::Interrupted)
                } else {
                    Err(CaptureError::FatalIo(err))
                }
            }
            0 => Ok(Readiness::TimedOut),
            _ => Ok(Readiness::Ready),
        }
    }
}
