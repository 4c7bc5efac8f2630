//! Frame consumers.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;
use crate::traits::{Frame, FrameEvent};

/// Receives each captured frame synchronously.
///
/// The event borrows the device buffer and is only valid for the duration of
/// the call. Copy it with [`FrameEvent::to_frame`] to keep the data.
pub trait FrameSink {
    /// Consume one frame.
    fn on_frame(&mut self, frame: &FrameEvent<'_>);
}

impl<F> FrameSink for F
where
    F: FnMut(&FrameEvent<'_>),
{
    fn on_frame(&mut self, frame: &FrameEvent<'_>) {
        self(frame);
    }
}

/// Appends raw frame payloads to a file.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    frames: u64,
    bytes: u64,
    write_errors: u64,
}

impl FileSink {
    /// Create (or truncate) `path` for writing.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        debug!(path = %path.display(), "Writing raw frames");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            frames: 0,
            bytes: 0,
            write_errors: 0,
        })
    }

    /// Flush buffered data to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Output path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames written.
    pub const fn frames(&self) -> u64 {
        self.frames
    }

    /// Payload bytes written.
    pub const fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Frames that could not be written.
    pub const fn write_errors(&self) -> u64 {
        self.write_errors
    }
}

impl FrameSink for FileSink {
    fn on_frame(&mut self, frame: &FrameEvent<'_>) {
        match self.writer.write_all(frame.data()) {
            Ok(()) => {
                self.frames += 1;
                self.bytes += frame.len() as u64;
            }
            Err(err) => {
                self.write_errors += 1;
                warn!(path = %self.path.display(), sequence = frame.sequence(), error = %err, "Frame write failed");
            }
        }
    }
}

/// Copies up to `limit` frames into owned [`Frame`]s.
#[derive(Debug, Default)]
pub struct CollectingSink {
    frames: Vec<Frame>,
    limit: usize,
}

impl CollectingSink {
    /// Keep at most `limit` frames; later frames are ignored.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            frames: Vec::with_capacity(limit),
            limit,
        }
    }

    /// Frames collected so far.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Number of frames collected.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frame was collected.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Whether the limit has been reached.
    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.limit
    }

    /// Take the collected frames.
    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

impl FrameSink for CollectingSink {
    fn on_frame(&mut self, frame: &FrameEvent<'_>) {
        if !self.is_full() {
            self.frames.push(frame.to_frame());
        }
    }
}
