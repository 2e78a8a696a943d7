//! Capture loop run on the dedicated live-capture thread.
//!
//! The loop owns the device for its whole run: read a frame, annotate it, and
//! publish the result into the session's frame buffer until the stop signal is
//! observed. Read and annotation failures are contained here and never end the
//! loop. Teardown happens through drop guards so the device is released and
//! the session returns to Idle on every exit path.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};
use video_ingest::{CaptureDevice, DeviceOpener};

use crate::vision::{
    annotation::Annotator, config::LiveTiming, error::LiveError, session::SessionShared,
};

/// Everything the capture thread needs, moved into it at spawn time.
pub(crate) struct CaptureContext {
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) opener: Arc<dyn DeviceOpener>,
    pub(crate) annotator: Arc<dyn Annotator>,
    pub(crate) timing: LiveTiming,
}

/// Clears the buffer and returns the session to Idle when dropped.
struct ResetOnExit<'a>(&'a SessionShared);

impl Drop for ResetOnExit<'_> {
    fn drop(&mut self) {
        self.0.buffer().clear();
        self.0.mark_idle();
        info!("live capture stopped");
    }
}

/// Releases the device when dropped.
struct DeviceGuard {
    device: Box<dyn CaptureDevice>,
    id: i32,
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.device.release();
        debug!(device = self.id, "capture device released");
    }
}

pub(crate) fn run_capture_loop(ctx: CaptureContext, device_id: i32) {
    let capture_span = tracing::info_span!("live.capture", device = device_id);
    let _capture_guard = capture_span.enter();

    // Declared before the device so the device is released first.
    let _reset = ResetOnExit(&ctx.shared);

    let mut device = match ctx.opener.open(device_id) {
        Ok(device) => DeviceGuard {
            device,
            id: device_id,
        },
        Err(source) => {
            let err = LiveError::DeviceUnavailable {
                device: device_id,
                source,
            };
            error!("{err}");
            metrics::counter!("live_device_open_failures_total").increment(1);
            return;
        }
    };
    info!("live capture running");

    let mut frame_number: u64 = 0;
    let mut consecutive_failures: u32 = 0;

    while !ctx.shared.stop_requested() {
        let raw = match device.device.read_frame() {
            Ok(frame) => frame,
            Err(source) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                let err = LiveError::FrameReadTransientFailure(source);
                if consecutive_failures == 1 || consecutive_failures % 100 == 0 {
                    warn!(consecutive_failures, "{err}");
                }
                metrics::counter!("live_frame_read_failures_total").increment(1);
                pause(ctx.timing.retry_interval);
                continue;
            }
        };
        consecutive_failures = 0;

        let annotate_start = Instant::now();
        let published = match ctx.annotator.annotate(&raw) {
            Ok(annotated) => annotated,
            Err(source) => {
                let err = LiveError::AnnotationFailed(source);
                warn!(frame = frame_number + 1, "{err}; publishing raw frame");
                metrics::counter!("live_annotation_failures_total").increment(1);
                raw
            }
        };
        metrics::histogram!("live_annotation_seconds")
            .record(annotate_start.elapsed().as_secs_f64());

        ctx.shared.publish(published);
        metrics::counter!("live_frames_published_total").increment(1);
        frame_number = frame_number.wrapping_add(1);
        if frame_number % 30 == 0 {
            debug!("Capture heartbeat: frame #{frame_number}");
        }

        pause(ctx.timing.capture_interval);
    }
}

fn pause(interval: Duration) {
    if !interval.is_zero() {
        thread::sleep(interval);
    }
}
