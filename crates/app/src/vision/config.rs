//! Configuration parsing for the live server.
//!
//! CLI flags are collected into `LiveServerArgs` and validated once into a
//! `LiveConfig` which the session, capture loop, and HTTP layer read without
//! re-parsing.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::{Args, ValueEnum};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
/// Source of live frames.
pub enum CaptureBackend {
    /// Local cameras through OpenCV `VideoCapture`.
    Opencv,
    /// Synthetic colour bars, no hardware required.
    TestPattern,
}

impl CaptureBackend {
    fn compiled_default() -> Self {
        if cfg!(feature = "with-opencv") {
            CaptureBackend::Opencv
        } else {
            CaptureBackend::TestPattern
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Pacing used by the capture loop and the stream publisher.
pub struct LiveTiming {
    /// Pause after each published frame.
    pub capture_interval: Duration,
    /// Pause before retrying a failed device read.
    pub retry_interval: Duration,
    /// Pause between two parts sent to the same stream connection.
    pub stream_interval: Duration,
    /// Pause before re-polling an empty frame buffer.
    pub idle_interval: Duration,
}

impl Default for LiveTiming {
    fn default() -> Self {
        Self {
            capture_interval: Duration::from_millis(30),
            retry_interval: Duration::from_millis(50),
            stream_interval: Duration::from_millis(30),
            idle_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Lower the default log filter to `debug`.
    pub verbose: bool,
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by the server and the live session.
pub struct LiveConfig {
    pub host: String,
    pub port: u16,
    pub backend: CaptureBackend,
    /// Capture width requested from the device.
    pub width: i32,
    /// Capture height requested from the device.
    pub height: i32,
    /// JPEG quality used for streamed parts.
    pub jpeg_quality: u8,
    pub timing: LiveTiming,
    /// TorchScript model; absent means the overlay-only annotator.
    #[cfg_attr(not(feature = "with-tch"), allow(dead_code))]
    pub model_path: Option<PathBuf>,
    #[cfg_attr(not(feature = "with-tch"), allow(dead_code))]
    pub detector_width: i32,
    #[cfg_attr(not(feature = "with-tch"), allow(dead_code))]
    pub detector_height: i32,
    /// Force CPU inference.
    #[cfg_attr(not(feature = "with-tch"), allow(dead_code))]
    pub use_cpu: bool,
    /// HTTP worker count; `None` lets Actix pick.
    pub workers: Option<usize>,
    pub telemetry: TelemetryOptions,
}

/// CLI arguments accepted by the server.
#[derive(Debug, Args)]
pub struct LiveServerArgs {
    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
    /// Port to bind the HTTP server to.
    #[arg(long, default_value_t = 5000)]
    pub port: u16,
    /// Capture backend (defaults to opencv when compiled in; without it opencv
    /// falls back to the test pattern).
    #[arg(long, value_enum)]
    pub backend: Option<CaptureBackend>,
    /// Capture width in pixels.
    #[arg(long, value_name = "PX", default_value_t = 640)]
    pub width: i32,
    /// Capture height in pixels.
    #[arg(long, value_name = "PX", default_value_t = 480)]
    pub height: i32,
    /// JPEG quality used by the stream encoder (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 85)]
    pub jpeg_quality: i32,
    /// Pause after each published frame.
    #[arg(long = "capture-interval-ms", value_name = "MS", default_value_t = 30)]
    pub capture_interval_ms: u64,
    /// Pause before retrying a failed device read.
    #[arg(long = "retry-interval-ms", value_name = "MS", default_value_t = 50)]
    pub retry_interval_ms: u64,
    /// Pause between parts on one stream connection.
    #[arg(long = "stream-interval-ms", value_name = "MS", default_value_t = 30)]
    pub stream_interval_ms: u64,
    /// Pause before re-polling an empty frame buffer.
    #[arg(long = "idle-interval-ms", value_name = "MS", default_value_t = 50)]
    pub idle_interval_ms: u64,
    /// TorchScript model path (requires the `with-tch` feature).
    #[arg(long = "model", value_name = "PATH")]
    pub model_path: Option<PathBuf>,
    /// Detector input width in pixels.
    #[arg(long = "detector-width", value_name = "PX")]
    pub detector_width: Option<i32>,
    /// Detector input height in pixels.
    #[arg(long = "detector-height", value_name = "PX")]
    pub detector_height: Option<i32>,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
    /// Number of HTTP worker threads.
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,
    /// Enable debug logging.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<LiveServerArgs> for LiveConfig {
    type Error = anyhow::Error;

    fn try_from(args: LiveServerArgs) -> Result<Self> {
        if args.width <= 0 || args.height <= 0 {
            bail!("Capture width and height must be positive integers");
        }

        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }

        let backend = args.backend.unwrap_or_else(CaptureBackend::compiled_default);

        if args.model_path.is_some() && !cfg!(feature = "with-tch") {
            bail!("--model requires building with the `with-tch` feature");
        }

        let (detector_width, detector_height) = match (args.detector_width, args.detector_height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            (Some(w), None) if w > 0 => (w, args.height),
            (None, Some(h)) if h > 0 => (args.width, h),
            (None, None) => Self::default_detector_size(args.width, args.height),
            _ => bail!("Detector dimensions must be positive integers"),
        };

        let intervals = [
            ("--capture-interval-ms", args.capture_interval_ms),
            ("--retry-interval-ms", args.retry_interval_ms),
            ("--stream-interval-ms", args.stream_interval_ms),
            ("--idle-interval-ms", args.idle_interval_ms),
        ];
        for (flag, value) in intervals {
            if value == 0 {
                bail!("{flag} must be at least 1");
            }
        }

        if args.workers == Some(0) {
            bail!("--workers must be at least 1");
        }

        Ok(Self {
            host: args.host,
            port: args.port,
            backend,
            width: args.width,
            height: args.height,
            jpeg_quality: args.jpeg_quality as u8,
            timing: LiveTiming {
                capture_interval: Duration::from_millis(args.capture_interval_ms),
                retry_interval: Duration::from_millis(args.retry_interval_ms),
                stream_interval: Duration::from_millis(args.stream_interval_ms),
                idle_interval: Duration::from_millis(args.idle_interval_ms),
            },
            model_path: args.model_path,
            detector_width,
            detector_height,
            use_cpu: args.use_cpu,
            workers: args.workers,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                verbose: args.verbose,
            },
        })
    }
}

impl LiveConfig {
    /// Square detector input covering the larger capture side, aligned to 32.
    fn default_detector_size(width: i32, height: i32) -> (i32, i32) {
        let max_dim = width.max(height).max(32);
        let aligned = ((max_dim + 31) / 32) * 32;
        (aligned, aligned)
    }
}
