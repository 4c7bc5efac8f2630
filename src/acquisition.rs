//! Event-driven acquisition loop.
//!
//! Each iteration performs one bounded readiness wait. A ready device yields
//! one buffer which is handed to the sink by reference and requeued straight
//! after. Cancellation is checked once per iteration, so a stop request is
//! honoured within one wait timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, trace, warn};

use crate::controller::CaptureController;
use crate::error::Result;
use crate::sink::FrameSink;
use crate::traits::{CaptureDevice, Readiness};

/// Cooperative stop flag shared between the loop and a signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create an untriggered token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the loop to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters kept by the acquisition loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Readiness waits performed.
    pub iterations: u64,
    /// Frames delivered to the sink.
    pub frames: u64,
    /// Waits that timed out.
    pub timeouts: u64,
    /// Ready events whose dequeue found no buffer.
    pub not_ready: u64,
    /// Frames dropped because their payload could not be viewed.
    pub frame_errors: u64,
    /// Buffers that could not be requeued.
    pub requeue_failures: u64,
}

/// Pulls frames from a streaming controller into a [`FrameSink`].
pub struct AcquisitionLoop<S> {
    sink: S,
    cancel: CancelToken,
    timeout: Option<Duration>,
    frame_limit: Option<u64>,
    stats: LoopStats,
}

impl<S: FrameSink> AcquisitionLoop<S> {
    /// Create a loop delivering to `sink` until `cancel` is triggered.
    pub const fn new(sink: S, cancel: CancelToken) -> Self {
        Self {
            sink,
            cancel,
            timeout: None,
            frame_limit: None,
            stats: LoopStats {
                iterations: 0,
                frames: 0,
                timeouts: 0,
                not_ready: 0,
                frame_errors: 0,
                requeue_failures: 0,
            },
        }
    }

    /// Override the controller's configured wait timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Stop after `frames` frames have been delivered.
    #[must_use]
    pub const fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Run until cancelled, the frame limit is reached, or a fatal error.
    ///
    /// A fatal error leaves the controller `Streaming`; the caller decides
    /// when to stop and tear down.
    pub fn run<D: CaptureDevice>(&mut self, controller: &mut CaptureController<D>) -> Result<LoopStats> {
        let timeout = self.timeout.unwrap_or(controller.config().wait_timeout);
        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = timeout.as_millis() as u64;
        info!(timeout_ms, limit = ?self.frame_limit, "Acquisition loop started");

        loop {
            self.stats.iterations += 1;
            match controller.wait_ready(timeout) {
                Ok(Readiness::Ready) => self.service(controller)?,
                Ok(Readiness::TimedOut) => {
                    self.stats.timeouts += 1;
                    warn!(timeout_ms, "Timed out waiting for frame");
                }
                Ok(Readiness::Interrupted) => trace!("Readiness wait interrupted"),
                Err(err) => {
                    error!(error = %err, "Readiness wait failed, aborting acquisition");
                    return Err(err);
                }
            }

            if self.cancel.is_cancelled() {
                info!(frames = self.stats.frames, "Acquisition cancelled");
                break;
            }
            if self.frame_limit.is_some_and(|limit| self.stats.frames >= limit) {
                info!(frames = self.stats.frames, "Frame limit reached");
                break;
            }
        }

        Ok(self.stats)
    }

    fn service<D: CaptureDevice>(&mut self, controller: &mut CaptureController<D>) -> Result<()> {
        let dequeued = match controller.dequeue() {
            Ok(dequeued) => dequeued,
            Err(err) if err.is_transient() => {
                self.stats.not_ready += 1;
                trace!("No buffer ready");
                return Ok(());
            }
            Err(err) => {
                error!(error = %err, "Dequeue failed, aborting acquisition");
                return Err(err);
            }
        };

        match controller.frame(&dequeued) {
            Ok(event) => {
                self.sink.on_frame(&event);
                self.stats.frames += 1;
            }
            Err(err) => {
                self.stats.frame_errors += 1;
                warn!(index = dequeued.index, error = %err, "Dropping frame");
            }
        }

        if let Err(err) = controller.requeue(dequeued.index) {
            self.stats.requeue_failures += 1;
            warn!(index = dequeued.index, error = %err, "Requeue failed");
        }
        Ok(())
    }

    /// Counters so far; still valid after `run` returns an error.
    pub const fn stats(&self) -> LoopStats {
        self.stats
    }

    /// The sink.
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// Consume the loop and return the sink.
    pub fn into_sink(self) -> S {
        self.sink
    }
}
