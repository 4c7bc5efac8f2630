//! uvc-capture binary: capture frames from a V4L2 device.
//!
//! # Usage
//!
//! ```bash
//! uvc-capture --device /dev/video0 --io mmap --width 1280 --height 720 --frames 100
//! uvc-capture --list-formats
//! uvc-capture --xu 5:4 --output capture.yuv
//! ```
//!
//! Capture runs until Ctrl-C or until `--frames` frames have been received.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uvc_capture::{
    query_control, AcquisitionLoop, CancelToken, CaptureConfig, CaptureController, CaptureDevice,
    FileSink, Format, FourCC, FrameEvent, FrameInterval, FrameSink, FrameSizeRange, IoMethod,
    LoopStats, V4l2Device, XuQuery,
};

#[derive(Parser)]
#[command(name = "uvc-capture")]
#[command(about = "Capture frames from a V4L2/UVC device", long_about = None)]
struct Cli {
    /// Video device node
    #[arg(short, long, default_value = uvc_capture::config::DEFAULT_DEVICE)]
    device: PathBuf,

    /// Acquisition strategy: read, mmap or userptr
    #[arg(long, default_value = "mmap")]
    io: IoMethod,

    /// Requested frame width (needs --height)
    #[arg(long, requires = "height")]
    width: Option<u32>,

    /// Requested frame height (needs --width)
    #[arg(long, requires = "width")]
    height: Option<u32>,

    /// Requested pixel format
    #[arg(long, default_value = "YUYV")]
    fourcc: FourCC,

    /// Requested frame rate; 0 keeps the driver's rate
    #[arg(long, default_value_t = uvc_capture::config::DEFAULT_FPS)]
    fps: u32,

    /// Streaming buffers to request
    #[arg(short, long, default_value_t = uvc_capture::config::DEFAULT_BUFFER_COUNT)]
    buffers: u32,

    /// Stop after this many frames
    #[arg(short = 'n', long)]
    frames: Option<u64>,

    /// Readiness wait timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Append raw frames to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// List supported formats and frame sizes, then exit
    #[arg(long)]
    list_formats: bool,

    /// Print the current value of an extension unit control (unit:selector)
    #[arg(long, value_parser = parse_unit_selector)]
    xu: Vec<(u8, u8)>,
}

impl Cli {
    fn config(&self) -> CaptureConfig {
        let mut config = CaptureConfig::default()
            .with_device(self.device.clone())
            .with_io_method(self.io)
            .with_buffer_count(self.buffers)
            .with_wait_timeout(Duration::from_millis(self.timeout_ms))
            .with_frame_interval((self.fps > 0).then(|| FrameInterval::from_fps(self.fps)));
        if let (Some(width), Some(height)) = (self.width, self.height) {
            config = config.with_format(Format::new(width, height, self.fourcc));
        }
        config
    }
}

fn parse_unit_selector(s: &str) -> std::result::Result<(u8, u8), String> {
    let (unit, selector) = s
        .split_once(':')
        .ok_or_else(|| format!("expected unit:selector, got '{s}'"))?;
    let unit = unit.parse().map_err(|err| format!("bad unit '{unit}': {err}"))?;
    let selector = selector
        .parse()
        .map_err(|err| format!("bad selector '{selector}': {err}"))?;
    Ok((unit, selector))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut device = V4l2Device::open(&cli.device)?;
    println!("Device: {}", device.capabilities().card);
    println!("Driver: {}", device.capabilities().driver);

    if cli.list_formats {
        print_formats(&device)?;
        return Ok(());
    }

    for &(unit, selector) in &cli.xu {
        match query_control(&mut device, unit, selector, XuQuery::GetCur) {
            Ok(value) => println!("XU unit {unit} selector {selector}: {value:02x?}"),
            Err(err) => warn!(unit, selector, error = %err, "Extension unit query failed"),
        }
    }

    let mut controller = CaptureController::new(device, cli.config());
    controller.initialize()?;
    if let Some(format) = controller.format() {
        println!("Format: {format}");
    }
    if let Some(interval) = controller.frame_interval() {
        println!("Rate: {} fps", interval.fps());
    }
    controller.start()?;

    let cancel = CancelToken::new();
    watch_ctrl_c(cancel.clone())?;

    let result = match &cli.output {
        Some(path) => {
            let (result, mut sink) =
                capture(&mut controller, FileSink::create(path)?, cancel, cli.frames);
            sink.flush()?;
            info!(
                path = %sink.path().display(),
                frames = sink.frames(),
                bytes = sink.bytes_written(),
                write_errors = sink.write_errors(),
                "Raw frames written"
            );
            result
        }
        None => {
            let print = |frame: &FrameEvent<'_>| {
                println!(
                    "Frame {}: {} bytes, timestamp: {:?}",
                    frame.sequence(),
                    frame.len(),
                    frame.timestamp()
                );
            };
            capture(&mut controller, print, cancel, cli.frames).0
        }
    };

    let stats = settle(result, controller.teardown())?;
    controller.close()?;

    info!(
        frames = stats.frames,
        timeouts = stats.timeouts,
        not_ready = stats.not_ready,
        frame_errors = stats.frame_errors,
        requeue_failures = stats.requeue_failures,
        "Capture finished"
    );
    Ok(())
}

fn capture<S: FrameSink>(
    controller: &mut CaptureController<V4l2Device>,
    sink: S,
    cancel: CancelToken,
    frames: Option<u64>,
) -> (uvc_capture::Result<LoopStats>, S) {
    let mut acquisition = AcquisitionLoop::new(sink, cancel);
    if let Some(limit) = frames {
        acquisition = acquisition.with_frame_limit(limit);
    }
    let result = acquisition.run(controller);
    (result, acquisition.into_sink())
}

/// Combine the capture outcome with the teardown outcome.
///
/// A capture error wins; a teardown error behind it is only logged.
fn settle(
    result: uvc_capture::Result<LoopStats>,
    teardown: uvc_capture::Result<()>,
) -> Result<LoopStats> {
    match (result, teardown) {
        (Ok(stats), Ok(())) => Ok(stats),
        (Ok(_), Err(err)) => Err(err.into()),
        (Err(err), teardown) => {
            if let Err(teardown_err) = teardown {
                warn!(error = %teardown_err, "Teardown after failed capture also failed");
            }
            Err(err.into())
        }
    }
}

/// Cancel `token` on Ctrl-C from a dedicated signal thread.
fn watch_ctrl_c(token: CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;

    std::thread::Builder::new()
        .name("ctrl-c".to_owned())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Ctrl-C received, stopping capture");
                        token.cancel();
                    }
                    Err(err) => warn!(error = %err, "Cannot listen for Ctrl-C"),
                }
            });
        })
        .context("failed to spawn signal thread")?;
    Ok(())
}

fn print_formats(device: &V4l2Device) -> Result<()> {
    for desc in device.enum_formats()? {
        println!("[{}] {} ({})", desc.index, desc.fourcc, desc.description);
        for size in &desc.frame_sizes {
            match *size {
                FrameSizeRange::Discrete { width, height } => println!("    {width}x{height}"),
                FrameSizeRange::Stepwise {
                    min_width,
                    max_width,
                    step_width,
                    min_height,
                    max_height,
                    step_height,
                } => println!(
                    "    {min_width}x{min_height} - {max_width}x{max_height} \
                     (step {step_width}x{step_height})"
                ),
                FrameSizeRange::Continuous {
                    min_width,
                    max_width,
                    min_height,
                    max_height,
                } => println!("    {min_width}x{min_height} - {max_width}x{max_height} (continuous)"),
            }
        }
    }
    Ok(())
}
