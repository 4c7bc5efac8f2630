//! Core traits and types for the buffer-queue device abstraction.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Result;

/// Pixel format representation (e.g., YUYV, MJPG, H264).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
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
    /// H.264 elementary stream.
    pub const H264: Self = Self::new(b"H264");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");

    /// Bytes per pixel for packed formats, `None` for compressed ones.
    pub const fn bytes_per_pixel(self) -> Option<u32> {
        match &self.0 {
            b"YUYV" | b"UYVY" => Some(2),
            b"RGB3" | b"BGR3" => Some(3),
            _ => None,
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

impl FromStr for FourCC {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| format!("fourcc must be exactly 4 ASCII characters, got '{s}'"))?;
        Ok(Self(bytes))
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

/// Video format specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a new format specification.
    ///
    /// Stride and size are derived from the pixel format; compressed formats
    /// get zero and rely on the driver to report `sizeimage`.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let stride = match fourcc.bytes_per_pixel() {
            Some(bpp) => width * bpp,
            None => 0,
        };
        let size = stride * height;
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.fourcc)
    }
}

/// Time per frame as a fraction of a second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInterval {
    /// Numerator of the frame period.
    pub numerator: u32,
    /// Denominator of the frame period.
    pub denominator: u32,
}

impl FrameInterval {
    /// Interval for a whole number of frames per second.
    #[must_use]
    pub const fn from_fps(fps: u32) -> Self {
        Self {
            numerator: 1,
            denominator: fps,
        }
    }

    /// Frames per second, rounded down. Zero for a degenerate interval.
    pub const fn fps(self) -> u32 {
        if self.numerator == 0 {
            0
        } else {
            self.denominator / self.numerator
        }
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
    /// Whether the device supports `read(2)` I/O.
    pub can_read_write: bool,
}

impl DeviceCapabilities {
    /// Whether the capability flags allow the given acquisition strategy.
    pub const fn supports(&self, method: IoMethod) -> bool {
        match method {
            IoMethod::Read => self.can_read_write,
            IoMethod::Mmap | IoMethod::UserPtr => self.can_stream,
        }
    }
}

/// How buffers are sourced for a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMethod {
    /// Synchronous `read(2)` into a single heap buffer.
    Read,
    /// Device-owned buffers mapped into the process.
    #[default]
    Mmap,
    /// Process-owned heap buffers registered with the device.
    UserPtr,
}

impl fmt::Display for IoMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Mmap => "mmap",
            Self::UserPtr => "userptr",
        })
    }
}

impl FromStr for IoMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "mmap" => Ok(Self::Mmap),
            "userptr" | "user" => Ok(Self::UserPtr),
            other => Err(format!(
                "unknown io method '{other}' (expected read, mmap or userptr)"
            )),
        }
    }
}

/// Supported frame sizes for one pixel format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSizeRange {
    /// A single fixed resolution.
    Discrete {
        /// Width in pixels.
        width: u32,
        /// Height in pixels.
        height: u32,
    },
    /// A range with fixed step sizes.
    Stepwise {
        /// Smallest width.
        min_width: u32,
        /// Largest width.
        max_width: u32,
        /// Width increment.
        step_width: u32,
        /// Smallest height.
        min_height: u32,
        /// Largest height.
        max_height: u32,
        /// Height increment.
        step_height: u32,
    },
    /// Any size between the bounds.
    Continuous {
        /// Smallest width.
        min_width: u32,
        /// Largest width.
        max_width: u32,
        /// Smallest height.
        min_height: u32,
        /// Largest height.
        max_height: u32,
    },
}

/// A pixel format advertised by the device with its frame sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescription {
    /// Enumeration index reported by the driver.
    pub index: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Human readable description.
    pub description: String,
    /// Supported frame sizes, in driver order.
    pub frame_sizes: Vec<FrameSizeRange>,
}

/// Driver-reported layout of one streaming buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Pool index.
    pub index: u32,
    /// Length of the buffer in bytes.
    pub length: u32,
    /// Offset to pass to `mmap` for device-owned buffers.
    pub offset: u32,
}

/// A buffer returned by the device, filled with one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    /// Index of the filled buffer.
    pub index: u32,
    /// Bytes of valid payload.
    pub bytes_used: u32,
    /// Driver frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Address the device wrote into, for user-pointer buffers.
    pub userptr: Option<usize>,
}

/// Outcome of a bounded readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A buffer can be dequeued.
    Ready,
    /// The timeout elapsed without data.
    TimedOut,
    /// The wait was interrupted by a signal.
    Interrupted,
}

/// A buffer handed to the device's incoming queue.
#[derive(Debug)]
pub enum QueueRequest<'a> {
    /// Device-owned buffer, identified by index.
    Mmap {
        /// Pool index.
        index: u32,
    },
    /// Process-owned buffer, identified by index and address.
    UserPtr {
        /// Pool index.
        index: u32,
        /// Region the device should write into.
        region: &'a mut [u8],
    },
}

impl QueueRequest<'_> {
    /// Pool index of the request.
    pub const fn index(&self) -> u32 {
        match self {
            Self::Mmap { index } | Self::UserPtr { index, .. } => *index,
        }
    }
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

/// A borrowed view of one dequeued frame.
///
/// Valid only for the duration of the sink call that receives it; the
/// underlying buffer is requeued right after.
#[derive(Debug, Clone, Copy)]
pub struct FrameEvent<'a> {
    data: &'a [u8],
    index: u32,
    sequence: u32,
    timestamp: Duration,
}

impl<'a> FrameEvent<'a> {
    /// Build a view over a filled buffer.
    pub const fn new(data: &'a [u8], index: u32, sequence: u32, timestamp: Duration) -> Self {
        Self {
            data,
            index,
            sequence,
            timestamp,
        }
    }

    /// Frame payload.
    pub const fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Payload length in bytes.
    pub const fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Index of the buffer holding this frame.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Driver sequence number.
    pub const fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Capture timestamp.
    pub const fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Copy the payload into an owned [`Frame`].
    pub fn to_frame(&self) -> Frame {
        Frame {
            data: self.data.to_vec(),
            metadata: FrameMetadata {
                sequence: self.sequence,
                timestamp: self.timestamp,
                #[allow(clippy::cast_possible_truncation)]
                bytes_used: self.data.len() as u32,
            },
        }
    }
}

/// An owned copy of a captured video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

impl Frame {
    /// Get RGB values for a pixel at the specified coordinates.
    ///
    /// # Arguments
    ///
    /// * `x` - X coordinate (0-based)
    /// * `y` - Y coordinate (0-based)
    /// * `width` - Frame width in pixels
    ///
    /// # Returns
    ///
    /// Returns `Some((r, g, b))` if the coordinates are valid, `None` otherwise.
    ///
    /// # Notes
    ///
    /// This method assumes YUYV format (2 bytes per pixel). For odd x coordinates,
    /// it uses the Y value from the next pixel pair with the shared U/V values.
    #[must_use]
    pub fn pixel_at(&self, x: u32, y: u32, width: u32) -> Option<(u8, u8, u8)> {
        // YUYV format: [Y0 U Y1 V], each pair of pixels shares U and V
        let pair_x = x & !1;
        let offset = ((y * width + pair_x) * 2) as usize;

        if offset + 3 >= self.data.len() {
            return None;
        }

        let y_val = if x % 2 == 0 {
            *self.data.get(offset)?
        } else {
            *self.data.get(offset + 2)?
        };
        let u = *self.data.get(offset + 1)?;
        let v = *self.data.get(offset + 3)?;

        Some(yuv_to_rgb(y_val, u, v))
    }
}

/// Convert YUV values to RGB (ITU-R BT.601).
#[must_use]
#[allow(clippy::many_single_char_names)]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamp = |val: f32| -> u8 { val.clamp(0.0, 255.0) as u8 };

    (clamp(r), clamp(g), clamp(b))
}

/// Abstraction over a buffer-queue capture device.
///
/// The core drives every device through this trait: negotiation, buffer
/// requests and mappings, queue/dequeue by index, stream control and the
/// readiness wait.
pub trait CaptureDevice {
    /// Device-owned memory region produced by [`CaptureDevice::map_buffer`].
    type Region: AsRef<[u8]>;

    /// Path the device was opened from.
    fn path(&self) -> &Path;

    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Get current format.
    fn format(&self) -> Result<Format>;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_format(&mut self, format: &Format) -> Result<Format>;

    /// Get the current frame interval.
    fn frame_interval(&self) -> Result<FrameInterval>;

    /// Set the frame interval. Returns the interval the driver applied.
    fn set_frame_interval(&mut self, interval: FrameInterval) -> Result<FrameInterval>;

    /// Reset cropping to the driver's default rectangle.
    fn reset_crop(&mut self) -> Result<()>;

    /// List supported pixel formats with their frame sizes.
    fn enum_formats(&self) -> Result<Vec<FormatDescription>>;

    /// Request `count` streaming buffers. Returns the count the driver granted.
    fn request_buffers(&mut self, method: IoMethod, count: u32) -> Result<u32>;

    /// Query the layout of a device-owned buffer.
    fn query_buffer(&mut self, index: u32) -> Result<BufferInfo>;

    /// Map a device-owned buffer into the process.
    fn map_buffer(&mut self, info: &BufferInfo) -> Result<Self::Region>;

    /// Unmap a region previously returned by [`CaptureDevice::map_buffer`].
    fn unmap_buffer(&mut self, region: Self::Region) -> Result<()>;

    /// Hand a buffer to the device's incoming queue.
    fn queue_buffer(&mut self, request: QueueRequest<'_>) -> Result<()>;

    /// Take a filled buffer from the device's outgoing queue.
    fn dequeue_buffer(&mut self, method: IoMethod) -> Result<Dequeued>;

    /// Read one frame synchronously into `buf`.
    fn read_frame(&mut self, buf: &mut [u8]) -> Result<Dequeued>;

    /// Start streaming.
    fn stream_on(&mut self) -> Result<()>;

    /// Stop streaming. Queued buffers are returned to userspace.
    fn stream_off(&mut self) -> Result<()>;

    /// Block until a frame is available or `timeout` elapses.
    fn wait_ready(&mut self, timeout: Duration) -> Result<Readiness>;
}
