//! uvc-capture: V4L2/UVC frame acquisition
//!
//! This library manages the buffer-queue lifecycle of a V4L2 capture device
//! for three acquisition strategies (`read(2)`, mapped device buffers and
//! user-pointer buffers) and runs an event-driven loop that hands each frame
//! to a consumer without copying. Devices are driven through the
//! [`CaptureDevice`] trait, so the whole lifecycle can be exercised against a
//! mock in tests.

pub mod acquisition;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod pool;
pub mod sink;
pub mod traits;
pub mod validation;
pub mod xu;

#[cfg(test)]
pub mod mock;

pub use acquisition::{AcquisitionLoop, CancelToken, LoopStats};
pub use config::CaptureConfig;
pub use controller::{CaptureController, SessionState};
pub use device::V4l2Device;
pub use error::{CaptureError, Result};
pub use pool::{Buffer, BufferPool, PoolStats};
pub use sink::{CollectingSink, FileSink, FrameSink};
pub use traits::{
    CaptureDevice, DeviceCapabilities, Format, FormatDescription, FourCC, Frame, FrameEvent,
    FrameInterval, FrameMetadata, FrameSizeRange, IoMethod,
};
pub use xu::{query_control, ExtensionControls, XuQuery};
