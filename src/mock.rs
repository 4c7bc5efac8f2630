//! Mock device implementation for testing without hardware.
//!
//! The mock models the V4L2 buffer queue: granted buffer counts, per-index
//! mappings, a FIFO of queued indices, stream state and a scripted readiness
//! wait. Every call is counted so tests can check for balanced resources.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::acquisition::CancelToken;
use crate::error::{CaptureError, Result};
use crate::traits::{
    BufferInfo, CaptureDevice, Dequeued, DeviceCapabilities, Format, FormatDescription, FourCC,
    FrameInterval, FrameSizeRange, IoMethod, QueueRequest, Readiness,
};
use crate::xu::{ExtensionControls, XuQuery};

/// Scripted outcome of one readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStep {
    /// Data is available.
    Ready,
    /// Timeout elapsed.
    Timeout,
    /// Wait interrupted by a signal.
    Interrupted,
    /// Wait failed.
    Fail,
}

/// Scripted outcome of one dequeue, overriding the queue FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueStep {
    /// EAGAIN.
    NotReady,
    /// EIO.
    Fatal,
}

/// Per-operation call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `request_buffers` calls.
    pub request_buffers: usize,
    /// `query_buffer` calls.
    pub query_buffer: usize,
    /// Successful `map_buffer` calls.
    pub map: usize,
    /// `unmap_buffer` calls.
    pub unmap: usize,
    /// `queue_buffer` calls.
    pub queue: usize,
    /// Successful `dequeue_buffer`/`read_frame` calls.
    pub dequeue: usize,
    /// `stream_on` calls.
    pub stream_on: usize,
    /// `stream_off` calls.
    pub stream_off: usize,
    /// `reset_crop` calls.
    pub reset_crop: usize,
    /// `wait_ready` calls.
    pub wait: usize,
}

/// Queue traffic in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEvent {
    /// Index handed to the device.
    Queued(u32),
    /// Index returned by the device.
    Dequeued(u32),
    /// Streaming started.
    StreamOn,
    /// Streaming stopped.
    StreamOff,
    /// Mapping of an index released.
    Unmapped(u32),
}

/// Shared handle on a mock's event log. It outlives the device, so tests
/// can inspect what a drop did.
pub type EventLog = Arc<Mutex<Vec<MockEvent>>>;

/// A "mapped" mock buffer, pre-filled with the device's test pattern.
#[derive(Debug)]
pub struct MockRegion {
    index: u32,
    data: Vec<u8>,
}

impl MockRegion {
    /// Index the region was mapped for.
    pub const fn index(&self) -> u32 {
        self.index
    }
}

impl AsRef<[u8]> for MockRegion {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Mock device for testing without hardware.
pub struct MockDevice {
    path: PathBuf,
    capabilities: DeviceCapabilities,
    format: Format,
    interval: FrameInterval,
    pattern: TestPattern,
    grant_limit: Option<u32>,
    buffer_length: Option<u32>,
    reported_bytes_used: Option<u32>,
    fail_request: bool,
    fail_map_at: Option<u32>,
    fail_unmap: bool,
    fail_queue_at: Option<u32>,
    fail_requeue: bool,
    fail_stream_on: bool,
    fail_stream_off: bool,
    fail_crop: bool,
    fail_interval_query: bool,
    refuse_format: bool,
    refuse_interval: bool,
    idle: WaitStep,
    sleep_on_timeout: bool,
    waits: VecDeque<WaitStep>,
    dequeues: VecDeque<DequeueStep>,
    cancel_at_wait: Option<(usize, CancelToken)>,
    granted: u32,
    memory: IoMethod,
    queued: VecDeque<u32>,
    userptrs: HashMap<u32, usize>,
    streaming: bool,
    counts: CallCounts,
    events: EventLog,
    frame_count: u32,
    xu_controls: HashMap<(u8, u8), Vec<u8>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a new mock device with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/dev/mock0"),
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
                can_read_write: true,
            },
            format: Format::new(640, 480, FourCC::YUYV),
            interval: FrameInterval::from_fps(30),
            pattern: TestPattern::ColorBars,
            grant_limit: None,
            buffer_length: None,
            reported_bytes_used: None,
            fail_request: false,
            fail_map_at: None,
            fail_unmap: false,
            fail_queue_at: None,
            fail_requeue: false,
            fail_stream_on: false,
            fail_stream_off: false,
            fail_crop: false,
            fail_interval_query: false,
            refuse_format: false,
            refuse_interval: false,
            idle: WaitStep::Ready,
            sleep_on_timeout: false,
            waits: VecDeque::new(),
            dequeues: VecDeque::new(),
            cancel_at_wait: None,
            granted: 0,
            memory: IoMethod::Mmap,
            queued: VecDeque::new(),
            userptrs: HashMap::new(),
            streaming: false,
            counts: CallCounts::default(),
            events: EventLog::default(),
            frame_count: 0,
            xu_controls: HashMap::new(),
        }
    }

    /// Set the format for this mock device.
    #[must_use]
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Set the capabilities for this mock device.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set the test pattern written into buffers.
    #[must_use]
    pub fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Grant at most `limit` buffers per request.
    #[must_use]
    pub fn with_grant_limit(mut self, limit: u32) -> Self {
        self.grant_limit = Some(limit);
        self
    }

    /// Report `length` bytes per buffer instead of the format size.
    #[must_use]
    pub fn with_buffer_length(mut self, length: u32) -> Self {
        self.buffer_length = Some(length);
        self
    }

    /// Report `bytes_used` on every dequeue regardless of buffer capacity.
    #[must_use]
    pub fn reporting_bytes_used(mut self, bytes_used: u32) -> Self {
        self.reported_bytes_used = Some(bytes_used);
        self
    }

    /// Reject buffer requests.
    #[must_use]
    pub fn failing_request(mut self) -> Self {
        self.fail_request = true;
        self
    }

    /// Fail the mapping of buffer `index`.
    #[must_use]
    pub fn failing_map_at(mut self, index: u32) -> Self {
        self.fail_map_at = Some(index);
        self
    }

    /// Fail every unmap.
    #[must_use]
    pub fn failing_unmap(mut self) -> Self {
        self.fail_unmap = true;
        self
    }

    /// Fail queueing of buffer `index` before streaming starts.
    #[must_use]
    pub fn failing_queue_at(mut self, index: u32) -> Self {
        self.fail_queue_at = Some(index);
        self
    }

    /// Fail every queue while streaming.
    #[must_use]
    pub fn failing_requeue(mut self) -> Self {
        self.fail_requeue = true;
        self
    }

    /// Fail stream-on.
    #[must_use]
    pub fn failing_stream_on(mut self) -> Self {
        self.fail_stream_on = true;
        self
    }

    /// Fail stream-off.
    #[must_use]
    pub fn failing_stream_off(mut self) -> Self {
        self.fail_stream_off = true;
        self
    }

    /// Fail the crop reset.
    #[must_use]
    pub fn failing_crop(mut self) -> Self {
        self.fail_crop = true;
        self
    }

    /// Fail reading back the frame interval.
    #[must_use]
    pub fn failing_interval_query(mut self) -> Self {
        self.fail_interval_query = true;
        self
    }

    /// Refuse format and frame interval changes.
    #[must_use]
    pub fn refusing_negotiation(mut self) -> Self {
        self.refuse_format = true;
        self.refuse_interval = true;
        self
    }

    /// Readiness outcome once the wait script is exhausted.
    #[must_use]
    pub fn with_idle(mut self, step: WaitStep) -> Self {
        self.idle = step;
        self
    }

    /// Sleep for the full timeout on `WaitStep::Timeout`.
    #[must_use]
    pub fn sleeping_on_timeout(mut self) -> Self {
        self.sleep_on_timeout = true;
        self
    }

    /// Script the next readiness outcomes.
    #[must_use]
    pub fn with_waits<I: IntoIterator<Item = WaitStep>>(mut self, steps: I) -> Self {
        self.waits.extend(steps);
        self
    }

    /// Script the next dequeue outcomes.
    #[must_use]
    pub fn with_dequeues<I: IntoIterator<Item = DequeueStep>>(mut self, steps: I) -> Self {
        self.dequeues.extend(steps);
        self
    }

    /// Trigger `token` during the `nth` readiness wait (1-based).
    #[must_use]
    pub fn cancelling_at_wait(mut self, nth: usize, token: CancelToken) -> Self {
        self.cancel_at_wait = Some((nth, token));
        self
    }

    /// Register an extension unit control value.
    #[must_use]
    pub fn with_xu_control(mut self, unit: u8, selector: u8, value: Vec<u8>) -> Self {
        self.xu_controls.insert((unit, selector), value);
        self
    }

    /// Call counters so far.
    pub const fn counts(&self) -> &CallCounts {
        &self.counts
    }

    /// Queue traffic so far.
    pub fn events(&self) -> Vec<MockEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Handle on the event log that stays readable after the device is dropped.
    pub fn event_log(&self) -> EventLog {
        Arc::clone(&self.events)
    }

    fn record(&self, event: MockEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Indices currently owned by the device.
    pub fn queued(&self) -> Vec<u32> {
        self.queued.iter().copied().collect()
    }

    /// Whether streaming is on.
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn buffer_len(&self) -> u32 {
        self.buffer_length.unwrap_or(self.format.size)
    }

    fn einval() -> CaptureError {
        CaptureError::Io(io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn next_dequeued(&mut self, index: u32, capacity: usize) -> Dequeued {
        let sequence = self.frame_count;
        self.frame_count += 1;
        self.counts.dequeue += 1;
        self.record(MockEvent::Dequeued(index));

        #[allow(clippy::cast_possible_truncation)]
        let bytes_used = self
            .reported_bytes_used
            .unwrap_or((self.format.size as usize).min(capacity) as u32);

        Dequeued {
            index,
            bytes_used,
            sequence,
            timestamp: Duration::from_millis(u64::from(sequence) * 33), // ~30fps
            userptr: self.userptrs.get(&index).copied(),
        }
    }
}

impl CaptureDevice for MockDevice {
    type Region = MockRegion;

    fn path(&self) -> &Path {
        &self.path
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn format(&self) -> Result<Format> {
        Ok(self.format.clone())
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        if self.refuse_format {
            return Err(CaptureError::Capability("VIDIOC_S_FMT: refused".to_owned()));
        }
        self.format = format.clone();
        Ok(self.format.clone())
    }

    fn frame_interval(&self) -> Result<FrameInterval> {
        if self.fail_interval_query {
            return Err(CaptureError::Capability("VIDIOC_G_PARM: Invalid argument".to_owned()));
        }
        Ok(self.interval)
    }

    fn set_frame_interval(&mut self, interval: FrameInterval) -> Result<FrameInterval> {
        if self.refuse_interval {
            return Err(CaptureError::Capability("VIDIOC_S_PARM: refused".to_owned()));
        }
        self.interval = interval;
        Ok(self.interval)
    }

    fn reset_crop(&mut self) -> Result<()> {
        self.counts.reset_crop += 1;
        if self.fail_crop {
            return Err(CaptureError::Capability(
                "VIDIOC_CROPCAP: Inappropriate ioctl for device".to_owned(),
            ));
        }
        Ok(())
    }

    fn enum_formats(&self) -> Result<Vec<FormatDescription>> {
        Ok(vec![
            FormatDescription {
                index: 0,
                fourcc: FourCC::YUYV,
                description: "YUYV 4:2:2".to_owned(),
                frame_sizes: vec![
                    FrameSizeRange::Discrete {
                        width: 640,
                        height: 480,
                    },
                    FrameSizeRange::Discrete {
                        width: 1280,
                        height: 720,
                    },
                ],
            },
            FormatDescription {
                index: 1,
                fourcc: FourCC::MJPG,
                description: "Motion-JPEG".to_owned(),
                frame_sizes: vec![FrameSizeRange::Stepwise {
                    min_width: 160,
                    max_width: 1920,
                    step_width: 16,
                    min_height: 120,
                    max_height: 1080,
                    step_height: 8,
                }],
            },
        ])
    }

    fn request_buffers(&mut self, method: IoMethod, count: u32) -> Result<u32> {
        self.counts.request_buffers += 1;
        if self.fail_request {
            return Err(Self::einval());
        }
        self.memory = method;
        self.granted = self.grant_limit.map_or(count, |limit| limit.min(count));
        Ok(self.granted)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferInfo> {
        self.counts.query_buffer += 1;
        if index >= self.granted {
            return Err(Self::einval());
        }
        let length = self.buffer_len();
        Ok(BufferInfo {
            index,
            length,
            offset: index * length,
        })
    }

    fn map_buffer(&mut self, info: &BufferInfo) -> Result<MockRegion> {
        if self.fail_map_at == Some(info.index) {
            return Err(CaptureError::Mapping {
                index: info.index,
                message: "mmap: Cannot allocate memory".to_owned(),
            });
        }
        self.counts.map += 1;
        let mut data = generate_test_frame(&self.format, self.pattern);
        data.resize(info.length as usize, 0);
        Ok(MockRegion {
            index: info.index,
            data,
        })
    }

    fn unmap_buffer(&mut self, region: MockRegion) -> Result<()> {
        self.counts.unmap += 1;
        if self.fail_unmap {
            return Err(Self::einval());
        }
        self.record(MockEvent::Unmapped(region.index()));
        Ok(())
    }

    fn queue_buffer(&mut self, request: QueueRequest<'_>) -> Result<()> {
        self.counts.queue += 1;
        let index = request.index();

        if self.streaming && self.fail_requeue {
            return Err(Self::einval());
        }
        if !self.streaming && self.fail_queue_at == Some(index) {
            return Err(Self::einval());
        }
        if index >= self.granted || self.queued.contains(&index) {
            return Err(Self::einval());
        }

        if let QueueRequest::UserPtr { region, .. } = request {
            // The device writes straight into caller memory
            let frame = generate_test_frame(&self.format, self.pattern);
            let n = frame.len().min(region.len());
            if let (Some(dst), Some(src)) = (region.get_mut(..n), frame.get(..n)) {
                dst.copy_from_slice(src);
            }
            self.userptrs.insert(index, region.as_ptr() as usize);
        }

        self.queued.push_back(index);
        self.record(MockEvent::Queued(index));
        Ok(())
    }

    fn dequeue_buffer(&mut self, method: IoMethod) -> Result<Dequeued> {
        match self.dequeues.pop_front() {
            Some(DequeueStep::NotReady) => return Err(CaptureError::TransientIo),
            Some(DequeueStep::Fatal) => {
                return Err(CaptureError::FatalIo(io::Error::from_raw_os_error(libc::EIO)))
            }
            None => {}
        }
        if !self.streaming || method != self.memory {
            return Err(Self::einval());
        }
        let index = self.queued.pop_front().ok_or(CaptureError::TransientIo)?;
        let capacity = self.buffer_len() as usize;
        Ok(self.next_dequeued(index, capacity))
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> Result<Dequeued> {
        match self.dequeues.pop_front() {
            Some(DequeueStep::NotReady) => return Err(CaptureError::TransientIo),
            Some(DequeueStep::Fatal) => {
                return Err(CaptureError::FatalIo(io::Error::from_raw_os_error(libc::EIO)))
            }
            None => {}
        }
        let frame = generate_test_frame(&self.format, self.pattern);
        let n = frame.len().min(buf.len());
        if let (Some(dst), Some(src)) = (buf.get_mut(..n), frame.get(..n)) {
            dst.copy_from_slice(src);
        }
        Ok(self.next_dequeued(0, n))
    }

    fn stream_on(&mut self) -> Result<()> {
        self.counts.stream_on += 1;
        if self.fail_stream_on {
            return Err(CaptureError::StreamControl(
                "VIDIOC_STREAMON: Invalid argument".to_owned(),
            ));
        }
        self.streaming = true;
        self.record(MockEvent::StreamOn);
        Ok(())
    }

    fn stream_off(&mut self) -> Result<()> {
        self.counts.stream_off += 1;
        if self.fail_stream_off {
            return Err(CaptureError::StreamControl(
                "VIDIOC_STREAMOFF: Invalid argument".to_owned(),
            ));
        }
        self.streaming = false;
        self.queued.clear();
        self.record(MockEvent::StreamOff);
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        self.counts.wait += 1;
        if let Some((nth, token)) = &self.cancel_at_wait {
            if *nth == self.counts.wait {
                token.cancel();
            }
        }

        match self.waits.pop_front().unwrap_or(self.idle) {
            WaitStep::Ready => Ok(Readiness::Ready),
            WaitStep::Timeout => {
                if self.sleep_on_timeout {
                    std::thread::sleep(timeout);
                }
                Ok(Readiness::TimedOut)
            }
            WaitStep::Interrupted => Ok(Readiness::Interrupted),
            WaitStep::Fail => Err(CaptureError::FatalIo(io::Error::from_raw_os_error(
                libc::EBADF,
            ))),
        }
    }
}

impl ExtensionControls for MockDevice {
    fn xu_length(&mut self, unit: u8, selector: u8) -> Result<u16> {
        let value = self
            .xu_controls
            .get(&(unit, selector))
            .ok_or_else(|| CaptureError::Control(format!("unit {unit} selector {selector}")))?;
        u16::try_from(value.len()).map_err(|_| CaptureError::Control("length overflow".to_owned()))
    }

    fn xu_query(&mut self, unit: u8, selector: u8, query: XuQuery, data: &mut [u8]) -> Result<()> {
        let value = self
            .xu_controls
            .get_mut(&(unit, selector))
            .ok_or_else(|| CaptureError::Control(format!("unit {unit} selector {selector}")))?;
        match query {
            XuQuery::SetCur => {
                value.clear();
                value.extend_from_slice(data);
            }
            _ => {
                let n = value.len().min(data.len());
                if let (Some(dst), Some(src)) = (data.get_mut(..n), value.get(..n)) {
                    dst.copy_from_slice(src);
                }
            }
        }
        Ok(())
    }
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// Generate test frame data based on pattern.
pub fn generate_test_frame(format: &Format, pattern: TestPattern) -> Vec<u8> {
    let size = (format.width * format.height * 2) as usize; // YUYV = 2 bytes/pixel
    let mut data = vec![0u8; size];

    match pattern {
        TestPattern::ColorBars => {
            generate_color_bars(&mut data, format.width, format.height);
        }
        TestPattern::Gradient => {
            generate_gradient(&mut data, format.width, format.height);
        }
        TestPattern::Solid(y, u, v) => {
            generate_solid(&mut data, y, u, v);
        }
    }

    data
}

fn put_pair(data: &mut [u8], offset: usize, y: u8, u: u8, v: u8) {
    if let Some(pair) = data.get_mut(offset..offset + 4) {
        pair.copy_from_slice(&[y, u, y, v]);
    }
}

/// Generate YUYV color bars pattern.
fn generate_color_bars(data: &mut [u8], width: u32, height: u32) {
    // White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    const BARS: [(u8, u8, u8); 8] = [
        (235, 128, 128),
        (210, 16, 146),
        (170, 166, 16),
        (145, 54, 34),
        (106, 202, 222),
        (81, 90, 240),
        (41, 240, 110),
        (16, 128, 128),
    ];

    let bar_width = (width / 8).max(1);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let bar_idx = (x / bar_width).min(7) as usize;
            let (y_val, u_val, v_val) = BARS.get(bar_idx).copied().unwrap_or((16, 128, 128));
            put_pair(data, ((y * width + x) * 2) as usize, y_val, u_val, v_val);
        }
    }
}

/// Generate YUYV horizontal gradient pattern.
fn generate_gradient(data: &mut [u8], width: u32, height: u32) {
    for y in 0..height {
        for x in (0..width).step_by(2) {
            #[allow(clippy::cast_possible_truncation)]
            let y_val = ((x * 255) / width) as u8;
            put_pair(data, ((y * width + x) * 2) as usize, y_val, 128, 128);
        }
    }
}

/// Generate solid color YUYV frame.
fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for chunk in data.chunks_exact_mut(4) {
        chunk.copy_from_slice(&[y, u, y, v]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_creation() {
        let device = MockDevice::new();
        assert_eq!(device.capabilities().driver, "mock");
        assert!(device.capabilities().can_capture);
        assert!(device.capabilities().can_stream);
    }

    #[test]
    fn test_mock_device_format() {
        let mut device = MockDevice::new();
        let format = device.format().expect("format should succeed");
        assert_eq!(format.width, 640);
        assert_eq!(format.height, 480);

        let new_format = Format::new(1280, 720, FourCC::YUYV);
        let actual = device
            .set_format(&new_format)
            .expect("set_format should succeed");
        assert_eq!(actual.width, 1280);
        assert_eq!(actual.height, 720);
    }

    #[test]
    fn test_mock_rejects_double_queue() {
        let mut device = MockDevice::new();
        device
            .request_buffers(IoMethod::Mmap, 2)
            .expect("request should succeed");
        device
            .queue_buffer(QueueRequest::Mmap { index: 1 })
            .expect("first queue should succeed");
        assert!(device.queue_buffer(QueueRequest::Mmap { index: 1 }).is_err());
        assert!(device.queue_buffer(QueueRequest::Mmap { index: 2 }).is_err());
    }

    #[test]
    fn test_mock_dequeue_fifo() {
        let mut device = MockDevice::new();
        device
            .request_buffers(IoMethod::Mmap, 3)
            .expect("request should succeed");
        for index in [2, 0, 1] {
            device
                .queue_buffer(QueueRequest::Mmap { index })
                .expect("queue should succeed");
        }
        device.stream_on().expect("stream_on should succeed");

        let first = device
            .dequeue_buffer(IoMethod::Mmap)
            .expect("dequeue should succeed");
        assert_eq!(first.index, 2);
        assert_eq!(first.sequence, 0);
        assert_eq!(first.bytes_used, 614_400);
        assert_eq!(device.queued(), vec![0, 1]);
    }

    #[test]
    fn test_mock_cancels_at_wait() {
        let token = CancelToken::new();
        let mut device = MockDevice::new()
            .with_waits([WaitStep::Timeout, WaitStep::Ready])
            .cancelling_at_wait(2, token.clone());

        let first = device
            .wait_ready(Duration::from_millis(1))
            .expect("wait should succeed");
        assert_eq!(first, Readiness::TimedOut);
        assert!(!token.is_cancelled());

        let second = device
            .wait_ready(Duration::from_millis(1))
            .expect("wait should succeed");
        assert_eq!(second, Readiness::Ready);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_color_bars_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::ColorBars);

        assert_eq!(data.len(), (640 * 480 * 2) as usize);

        // First bar should be white (Y=235)
        assert_eq!(data[0], 235);
    }

    #[test]
    fn test_gradient_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::Gradient);

        // Left edge should be dark
        assert!(data[0] < 10);

        // Right edge should be bright (check last row, last pixel)
        let last_row_start = (479 * 640 * 2) as usize;
        let last_pixel_y = data[last_row_start + 638 * 2];
        assert!(last_pixel_y > 200);
    }

    #[test]
    fn test_solid_pattern() {
        let format = Format::new(64, 64, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::Solid(128, 64, 192));

        assert_eq!(data[0], 128);
        assert_eq!(data[2], 128);
        assert_eq!(data[1], 64);
        assert_eq!(data[3], 192);
    }
}
