//! Capture session state machine.
//!
//! [`CaptureController`] owns the device and the buffer pool and moves a
//! session through `Opened -> Initialized -> Streaming -> Stopped` and back.
//! Transitions never skip a state; calling an operation from the wrong state
//! returns [`CaptureError::ContractViolation`].

use std::fmt;
use std::io;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::config::CaptureConfig;
use crate::device::V4l2Device;
use crate::error::{CaptureError, Result};
use crate::pool::BufferPool;
use crate::traits::{CaptureDevice, Dequeued, Format, FrameEvent, FrameInterval, IoMethod, Readiness};

/// Lifecycle state of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Device connection dropped.
    Closed,
    /// Device open, no buffers.
    Opened,
    /// Format negotiated and buffer pool ready.
    Initialized,
    /// Buffers queued and the device streaming.
    Streaming,
    /// Streaming stopped, buffers still held.
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Drives one device through a capture session.
pub struct CaptureController<D: CaptureDevice> {
    device: Option<D>,
    config: CaptureConfig,
    pool: Option<BufferPool<D::Region>>,
    state: SessionState,
    format: Option<Format>,
    interval: Option<FrameInterval>,
    checked_out: Option<u32>,
    lost_buffers: usize,
}

impl CaptureController<V4l2Device> {
    /// Open the configured device node and wrap it in a controller.
    pub fn open(config: CaptureConfig) -> Result<Self> {
        let device = V4l2Device::open(&config.device)?;
        Ok(Self::new(device, config))
    }
}

impl<D: CaptureDevice> CaptureController<D> {
    /// Take ownership of an opened device.
    pub fn new(device: D, config: CaptureConfig) -> Self {
        info!(
            path = %device.path().display(),
            card = %device.capabilities().card,
            io = %config.io_method,
            "Capture session opened"
        );
        Self {
            device: Some(device),
            config,
            pool: None,
            state: SessionState::Opened,
            format: None,
            interval: None,
            checked_out: None,
            lost_buffers: 0,
        }
    }

    const fn violation(&self, operation: &'static str) -> CaptureError {
        CaptureError::ContractViolation {
            operation,
            state: self.state,
        }
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.violation(operation))
        }
    }

    fn parts(&mut self, operation: &'static str) -> Result<(&mut D, &mut BufferPool<D::Region>)> {
        let state = self.state;
        match (self.device.as_mut(), self.pool.as_mut()) {
            (Some(device), Some(pool)) => Ok((device, pool)),
            _ => Err(CaptureError::ContractViolation { operation, state }),
        }
    }

    /// Reset cropping, negotiate format and rate, then allocate and map the
    /// buffer pool.
    ///
    /// A failed crop reset or refused negotiation is logged and the device
    /// defaults are kept. On
    /// any pool failure the partial pool is released and the session stays
    /// `Opened`.
    pub fn initialize(&mut self) -> Result<()> {
        self.require("initialize", &[SessionState::Opened])?;
        let state = self.state;
        let device = self.device.as_mut().ok_or(CaptureError::ContractViolation {
            operation: "initialize",
            state,
        })?;

        if let Err(err) = device.reset_crop() {
            debug!(error = %err, "Crop reset skipped");
        }
        if let Some(requested) = &self.config.format {
            match device.set_format(requested) {
                Ok(actual) if actual != *requested => {
                    info!(requested = %requested, actual = %actual, "Driver adjusted format");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "Format negotiation refused, using device default"),
            }
        }
        if let Some(interval) = self.config.frame_interval {
            match device.set_frame_interval(interval) {
                Ok(actual) => debug!(fps = actual.fps(), "Frame interval set"),
                Err(err) => warn!(error = %err, "Frame rate negotiation refused, using device default"),
            }
        }

        let format = device.format()?;
        let interval = match device.frame_interval() {
            Ok(interval) => Some(interval),
            Err(err) => {
                warn!(error = %err, "Frame interval query failed");
                None
            }
        };
        let method = self.config.io_method;
        if !device.capabilities().supports(method) {
            warn!(path = %device.path().display(), %method, "Device does not advertise this io method");
        }

        let mut pool =
            BufferPool::allocate(device, method, self.config.pool_size(), format.size as usize)?;
        if let Err(err) = pool.map_or_register(device) {
            if let Err(release_err) = pool.release(device) {
                warn!(error = %release_err, "Partial pool release failed");
            }
            return Err(err);
        }

        info!(%format, %method, buffers = pool.len(), "Capture session initialized");
        self.pool = Some(pool);
        self.format = Some(format);
        self.interval = interval;
        self.state = SessionState::Initialized;
        Ok(())
    }

    /// Queue every buffer and start streaming.
    ///
    /// On failure the session stays `Initialized` and buffers already queued
    /// are left queued; the caller tears down from there.
    pub fn start(&mut self) -> Result<()> {
        self.require("start", &[SessionState::Initialized])?;
        let (device, pool) = self.parts("start")?;

        if pool.method() != IoMethod::Read {
            Self::queue_all_and_stream(device, pool)?;
        }

        info!(buffers = pool.len(), "Streaming started");
        self.state = SessionState::Streaming;
        Ok(())
    }

    fn queue_all_and_stream(device: &mut D, pool: &mut BufferPool<D::Region>) -> Result<()> {
        for index in pool.indices() {
            let request = pool.queue_request(index).ok_or_else(|| {
                CaptureError::StreamControl(format!("buffer {index} cannot be queued"))
            })?;
            device
                .queue_buffer(request)
                .map_err(|err| CaptureError::StreamControl(format!("VIDIOC_QBUF {index}: {err}")))?;
        }
        device.stream_on().map_err(|err| match err {
            err @ CaptureError::StreamControl(_) => err,
            other => CaptureError::StreamControl(format!("VIDIOC_STREAMON: {other}")),
        })
    }

    /// Stop streaming. Buffers stay mapped until [`Self::release_buffers`].
    pub fn stop(&mut self) -> Result<()> {
        self.require("stop", &[SessionState::Streaming])?;
        let (device, pool) = self.parts("stop")?;

        if pool.method() != IoMethod::Read {
            device.stream_off().map_err(|err| match err {
                err @ CaptureError::StreamControl(_) => err,
                other => CaptureError::StreamControl(format!("VIDIOC_STREAMOFF: {other}")),
            })?;
        }

        info!(lost_buffers = self.lost_buffers, "Streaming stopped");
        self.checked_out = None;
        self.state = SessionState::Stopped;
        Ok(())
    }

    /// Release the buffer pool and return to `Opened`.
    ///
    /// Release failures are logged; the transition always completes.
    pub fn release_buffers(&mut self) -> Result<()> {
        self.require(
            "release_buffers",
            &[SessionState::Initialized, SessionState::Stopped],
        )?;

        if let (Some(device), Some(mut pool)) = (self.device.as_mut(), self.pool.take()) {
            if let Err(err) = pool.release(device) {
                warn!(error = %err, "Buffer release incomplete");
            }
            debug!(stats = ?pool.stats(), "Buffer pool released");
        }

        self.checked_out = None;
        self.state = SessionState::Opened;
        Ok(())
    }

    /// Drop the device connection.
    pub fn close(&mut self) -> Result<()> {
        self.require("close", &[SessionState::Opened])?;
        if let Some(device) = self.device.take() {
            info!(path = %device.path().display(), "Capture session closed");
        }
        self.state = SessionState::Closed;
        Ok(())
    }

    /// Walk the session back to `Opened` from any state.
    ///
    /// A failed stream stop is logged and returned. Mapped buffers are still
    /// released. User-pointer buffers are not: the device may keep writing
    /// into them, so the session stays `Streaming` and holds the pool.
    pub fn teardown(&mut self) -> Result<()> {
        let mut first_error = None;

        if self.state == SessionState::Streaming {
            if let Err(err) = self.stop() {
                warn!(error = %err, "Stream stop failed during teardown");
                if self.holds_user_buffers() {
                    return Err(err);
                }
                first_error = Some(err);
                self.checked_out = None;
                self.state = SessionState::Stopped;
            }
        }
        if matches!(
            self.state,
            SessionState::Initialized | SessionState::Stopped
        ) {
            if let Err(err) = self.release_buffers() {
                first_error.get_or_insert(err);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn holds_user_buffers(&self) -> bool {
        self.pool
            .as_ref()
            .is_some_and(|pool| pool.method() == IoMethod::UserPtr)
    }

    /// Wait up to `timeout` for a filled buffer.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        self.require("wait_ready", &[SessionState::Streaming])?;
        let state = self.state;
        self.device
            .as_mut()
            .ok_or(CaptureError::ContractViolation {
                operation: "wait_ready",
                state,
            })?
            .wait_ready(timeout)
    }

    /// Take one filled buffer from the device and check it out.
    ///
    /// Returns [`CaptureError::TransientIo`] when no buffer is ready. Only one
    /// buffer may be checked out at a time.
    pub fn dequeue(&mut self) -> Result<Dequeued> {
        self.require("dequeue", &[SessionState::Streaming])?;
        if self.checked_out.is_some() {
            return Err(self.violation("dequeue"));
        }
        let state = self.state;
        let (device, pool) = self.parts("dequeue")?;

        let mut dequeued = match pool.method() {
            IoMethod::Read => {
                let target = pool.read_target().ok_or(CaptureError::ContractViolation {
                    operation: "dequeue",
                    state,
                })?;
                device.read_frame(target)?
            }
            method => device.dequeue_buffer(method)?,
        };

        if let Some(addr) = dequeued.userptr {
            dequeued.index = pool.index_of_userptr(addr).ok_or_else(|| {
                CaptureError::FatalIo(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("device returned unknown user pointer {addr:#x}"),
                ))
            })?;
        }
        if !pool.indices().contains(&dequeued.index) {
            return Err(CaptureError::FatalIo(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "device returned buffer {} outside pool of {}",
                    dequeued.index,
                    pool.len()
                ),
            )));
        }

        trace!(
            index = dequeued.index,
            sequence = dequeued.sequence,
            bytes_used = dequeued.bytes_used,
            "Dequeued buffer"
        );
        self.checked_out = Some(dequeued.index);
        Ok(dequeued)
    }

    /// Borrow the payload of the checked-out buffer.
    pub fn frame(&self, dequeued: &Dequeued) -> Result<FrameEvent<'_>> {
        if self.state != SessionState::Streaming || self.checked_out != Some(dequeued.index) {
            return Err(self.violation("frame"));
        }
        let index = dequeued.index;
        let buffer = self
            .pool
            .as_ref()
            .and_then(|pool| pool.buffer(index))
            .ok_or_else(|| self.violation("frame"))?;

        let data = buffer
            .as_slice()
            .get(..dequeued.bytes_used as usize)
            .ok_or_else(|| CaptureError::Mapping {
                index,
                message: format!(
                    "{} bytes used exceeds buffer length {}",
                    dequeued.bytes_used,
                    buffer.len()
                ),
            })?;

        Ok(FrameEvent::new(
            data,
            index,
            dequeued.sequence,
            dequeued.timestamp,
        ))
    }

    /// Return the checked-out buffer to the device.
    ///
    /// The checkout is released even if the enqueue fails; the buffer is
    /// then counted as lost.
    pub fn requeue(&mut self, index: u32) -> Result<()> {
        self.require("requeue", &[SessionState::Streaming])?;
        if self.checked_out != Some(index) {
            return Err(self.violation("requeue"));
        }
        self.checked_out = None;
        let (device, pool) = self.parts("requeue")?;

        if pool.method() == IoMethod::Read {
            return Ok(());
        }
        let request = pool
            .queue_request(index)
            .ok_or_else(|| CaptureError::StreamControl(format!("buffer {index} cannot be queued")))?;
        let result = device.queue_buffer(request);
        if result.is_err() {
            self.lost_buffers += 1;
        }
        result
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Session configuration.
    pub const fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// The device, until the session is closed.
    pub const fn device(&self) -> Option<&D> {
        self.device.as_ref()
    }

    /// The buffer pool while `Initialized`, `Streaming` or `Stopped`.
    pub const fn pool(&self) -> Option<&BufferPool<D::Region>> {
        self.pool.as_ref()
    }

    /// Effective format read back after negotiation.
    pub const fn format(&self) -> Option<&Format> {
        self.format.as_ref()
    }

    /// Effective frame interval, if the driver reports one.
    pub const fn frame_interval(&self) -> Option<FrameInterval> {
        self.interval
    }

    /// Index currently checked out by [`Self::dequeue`].
    pub const fn checked_out(&self) -> Option<u32> {
        self.checked_out
    }

    /// Buffers whose requeue failed while streaming.
    pub const fn lost_buffers(&self) -> usize {
        self.lost_buffers
    }
}

impl<D: CaptureDevice> Drop for CaptureController<D> {
    fn drop(&mut self) {
        if matches!(self.state, SessionState::Opened | SessionState::Closed) {
            return;
        }
        if let Err(err) = self.teardown() {
            warn!(error = %err, "Teardown on drop failed");
        }
        if self.state == SessionState::Streaming {
            if let Some(pool) = self.pool.as_mut() {
                let leaked = pool.abandon();
                error!(leaked, "Device still streaming; user buffers leaked");
            }
        }
    }
}
