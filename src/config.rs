//! Capture session configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::traits::{Format, FrameInterval, IoMethod};

/// Default device node.
pub const DEFAULT_DEVICE: &str = "/dev/video0";

/// Buffers requested for streaming strategies.
pub const DEFAULT_BUFFER_COUNT: u32 = 2;

/// Frame rate requested when none is configured.
pub const DEFAULT_FPS: u32 = 15;

/// Upper bound on a single readiness wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings for one capture session.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device node to open.
    pub device: PathBuf,
    /// Acquisition strategy, fixed for the session.
    pub io_method: IoMethod,
    /// Format to request; `None` keeps the driver's current format.
    pub format: Option<Format>,
    /// Frame interval to request; `None` keeps the driver's current rate.
    pub frame_interval: Option<FrameInterval>,
    /// Buffers to request for streaming strategies.
    pub buffer_count: u32,
    /// Readiness wait timeout, which also bounds cancellation latency.
    pub wait_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            io_method: IoMethod::default(),
            format: None,
            frame_interval: Some(FrameInterval::from_fps(DEFAULT_FPS)),
            buffer_count: DEFAULT_BUFFER_COUNT,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl CaptureConfig {
    /// Set the device node.
    #[must_use]
    pub fn with_device<P: Into<PathBuf>>(mut self, device: P) -> Self {
        self.device = device.into();
        self
    }

    /// Set the acquisition strategy.
    #[must_use]
    pub fn with_io_method(mut self, io_method: IoMethod) -> Self {
        self.io_method = io_method;
        self
    }

    /// Request a specific format.
    #[must_use]
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    /// Request a frame interval, or keep the driver's with `None`.
    #[must_use]
    pub fn with_frame_interval(mut self, interval: Option<FrameInterval>) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Set the number of streaming buffers to request.
    #[must_use]
    pub fn with_buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count;
        self
    }

    /// Set the readiness wait timeout.
    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Buffers to allocate for the configured strategy.
    pub const fn pool_size(&self) -> u32 {
        match self.io_method {
            IoMethod::Read => 1,
            IoMethod::Mmap | IoMethod::UserPtr => self.buffer_count,
        }
    }
}
