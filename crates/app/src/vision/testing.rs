//! Scripted capture devices and annotators shared by the live-session tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use video_ingest::{CaptureDevice, CaptureError, DeviceOpener, Frame};

use crate::vision::{
    annotation::Annotator, config::LiveTiming, error::AnnotationError, session::LiveSession,
};

pub(crate) fn fast_timing() -> LiveTiming {
    LiveTiming {
        capture_interval: Duration::from_millis(2),
        retry_interval: Duration::from_millis(2),
        stream_interval: Duration::from_millis(5),
        idle_interval: Duration::from_millis(5),
    }
}

pub(crate) fn solid_frame(fill: u8) -> Frame {
    Frame {
        data: vec![fill; 8 * 4 * 3],
        width: 8,
        height: 4,
        timestamp_ms: i64::from(fill),
        format: video_ingest::FrameFormat::Bgr8,
    }
}

/// Observable side effects of a [`ScriptedOpener`].
#[derive(Default)]
pub(crate) struct DeviceLog {
    pub(crate) opened: AtomicUsize,
    pub(crate) released: AtomicBool,
    pub(crate) reads: AtomicUsize,
}

/// Opens devices that replay a fixed list of frames, then report read errors.
pub(crate) struct ScriptedOpener {
    frames: Vec<Frame>,
    fail_open: bool,
    pub(crate) device_log: Arc<DeviceLog>,
}

impl ScriptedOpener {
    pub(crate) fn with_frames(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            fail_open: false,
            device_log: Arc::new(DeviceLog::default()),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            frames: Vec::new(),
            fail_open: true,
            device_log: Arc::new(DeviceLog::default()),
        }
    }
}

impl DeviceOpener for ScriptedOpener {
    fn open(&self, device: i32) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        if self.fail_open {
            return Err(CaptureError::Open { device });
        }
        self.device_log.opened.fetch_add(1, Ordering::SeqCst);
        self.device_log.released.store(false, Ordering::SeqCst);
        Ok(Box::new(ScriptedCamera {
            frames: self.frames.iter().cloned().collect(),
            device_log: self.device_log.clone(),
        }))
    }
}

struct ScriptedCamera {
    frames: VecDeque<Frame>,
    device_log: Arc<DeviceLog>,
}

impl CaptureDevice for ScriptedCamera {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        self.device_log.reads.fetch_add(1, Ordering::SeqCst);
        self.frames.pop_front().ok_or(CaptureError::EmptyFrame)
    }

    fn release(&mut self) {
        self.device_log.released.store(true, Ordering::SeqCst);
    }
}

/// Inverts every byte so annotated output is distinguishable from raw input.
pub(crate) struct InvertAnnotator;

impl Annotator for InvertAnnotator {
    fn annotate(&self, frame: &Frame) -> Result<Frame, AnnotationError> {
        let mut out = frame.clone();
        out.data.iter_mut().for_each(|byte| *byte = !*byte);
        Ok(out)
    }
}

pub(crate) fn inverted(frame: &Frame) -> Frame {
    let mut out = frame.clone();
    out.data.iter_mut().for_each(|byte| *byte = !*byte);
    out
}

/// Always fails, counting attempts.
#[derive(Default)]
pub(crate) struct FailingAnnotator {
    pub(crate) attempts: AtomicUsize,
}

impl Annotator for FailingAnnotator {
    fn annotate(&self, _frame: &Frame) -> Result<Frame, AnnotationError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(AnnotationError::Model(anyhow!("model exploded")))
    }
}

/// Blocks inside `annotate` until released, to hold the capture loop mid-tick.
#[derive(Default)]
pub(crate) struct GateAnnotator {
    pub(crate) open: Mutex<bool>,
}

impl Annotator for GateAnnotator {
    fn annotate(&self, frame: &Frame) -> Result<Frame, AnnotationError> {
        while !*self.open.lock().unwrap() {
            thread::sleep(Duration::from_millis(1));
        }
        Ok(frame.clone())
    }
}

pub(crate) fn session_with(
    opener: impl DeviceOpener + 'static,
    annotator: impl Annotator + 'static,
) -> LiveSession {
    LiveSession::new(Arc::new(opener), Arc::new(annotator), fast_timing())
}

/// Poll `condition` until it holds or two seconds pass.
pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
