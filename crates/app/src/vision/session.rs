//! Live session controller.
//!
//! `LiveSession` owns the frame buffer, the stop signal, and the handle of the
//! capture thread. It is created once at startup and shared with the HTTP
//! handlers. The state machine is Idle → Running → StopRequested → Idle, where
//! the final transition is performed by the capture loop itself on exit.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use video_ingest::DeviceOpener;

use crate::vision::{
    annotation::Annotator,
    config::LiveTiming,
    data::{FrameBuffer, SessionState, StartOutcome, StopOutcome},
    pipeline::{CaptureContext, run_capture_loop},
    telemetry,
};

struct Lifecycle {
    state: SessionState,
    device: Option<i32>,
}

/// State shared between the controller, the capture thread, and stream handlers.
pub(crate) struct SessionShared {
    lifecycle: Mutex<Lifecycle>,
    stop: AtomicBool,
    buffer: FrameBuffer,
    frames_published: AtomicU64,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Idle,
                device: None,
            }),
            stop: AtomicBool::new(false),
            buffer: FrameBuffer::new(),
            frames_published: AtomicU64::new(0),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub(crate) fn publish(&self, frame: video_ingest::Frame) {
        self.buffer.write(frame);
        self.frames_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Return to Idle. Only the capture loop's exit path calls this.
    pub(crate) fn mark_idle(&self) {
        let mut lifecycle = self.lifecycle();
        lifecycle.state = SessionState::Idle;
        lifecycle.device = None;
    }
}

/// Controller for the single live capture session.
pub(crate) struct LiveSession {
    shared: Arc<SessionShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    opener: Arc<dyn DeviceOpener>,
    annotator: Arc<dyn Annotator>,
    timing: LiveTiming,
}

impl LiveSession {
    pub(crate) fn new(
        opener: Arc<dyn DeviceOpener>,
        annotator: Arc<dyn Annotator>,
        timing: LiveTiming,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared::new()),
            worker: Mutex::new(None),
            opener,
            annotator,
            timing,
        }
    }

    /// Start capturing from `device` unless a session is already alive.
    pub(crate) fn start(&self, device: i32) -> Result<StartOutcome> {
        let mut lifecycle = self.shared.lifecycle();
        if lifecycle.state != SessionState::Idle {
            let active = lifecycle.device.unwrap_or(device);
            debug!(device = active, "start ignored, session already running");
            return Ok(StartOutcome::AlreadyRunning { device: active });
        }

        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = worker.take() {
            // Idle is only reached once the previous loop has released its device.
            if previous.join().is_err() {
                warn!("previous capture thread panicked");
            }
        }

        self.shared.stop.store(false, Ordering::SeqCst);
        lifecycle.state = SessionState::Running;
        lifecycle.device = Some(device);

        let ctx = CaptureContext {
            shared: self.shared.clone(),
            opener: self.opener.clone(),
            annotator: self.annotator.clone(),
            timing: self.timing,
        };
        let spawned = telemetry::spawn_thread(format!("live-capture-{device}"), move || {
            run_capture_loop(ctx, device)
        });
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                metrics::counter!("live_sessions_started_total").increment(1);
                info!(device, "live session started");
                Ok(StartOutcome::Started { device })
            }
            Err(err) => {
                lifecycle.state = SessionState::Idle;
                lifecycle.device = None;
                Err(err).context("Failed to spawn capture thread")
            }
        }
    }

    /// Signal the capture loop and every stream to stop. Does not wait.
    pub(crate) fn stop(&self) -> StopOutcome {
        // `start` clears the flag under the same lock.
        let mut lifecycle = self.shared.lifecycle();
        self.shared.stop.store(true, Ordering::SeqCst);
        if lifecycle.state == SessionState::Running {
            lifecycle.state = SessionState::StopRequested;
            info!(device = ?lifecycle.device, "live session stop requested");
        }
        StopOutcome::StopRequested
    }

    /// Stop and wait for the capture thread so the device is released.
    pub(crate) fn shutdown(&self) {
        self.stop();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("capture thread panicked during shutdown");
            }
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.shared.lifecycle().state
    }

    pub(crate) fn device(&self) -> Option<i32> {
        self.shared.lifecycle().device
    }

    pub(crate) fn frames_published(&self) -> u64 {
        self.shared.frames_published.load(Ordering::Relaxed)
    }

    pub(crate) fn buffer(&self) -> &FrameBuffer {
        self.shared.buffer()
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.shared.stop_requested()
    }

    pub(crate) fn timing(&self) -> LiveTiming {
        self.timing
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::vision::testing::{
        GateAnnotator, InvertAnnotator, ScriptedOpener, session_with, solid_frame, wait_until,
    };

    #[test]
    fn second_start_reports_already_running_and_opens_one_device() {
        let opener = ScriptedOpener::with_frames(vec![solid_frame(1)]);
        let device_log = opener.device_log.clone();
        let session = session_with(opener, InvertAnnotator);

        assert_eq!(
            session.start(0).unwrap(),
            StartOutcome::Started { device: 0 }
        );
        assert_eq!(
            session.start(3).unwrap(),
            StartOutcome::AlreadyRunning { device: 0 }
        );
        assert!(wait_until(|| device_log.opened.load(Ordering::SeqCst) == 1));
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.device(), Some(0));

        session.shutdown();
        assert_eq!(device_log.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_while_idle_is_a_no_op() {
        let session = session_with(ScriptedOpener::with_frames(Vec::new()), InvertAnnotator);
        assert_eq!(session.stop(), StopOutcome::StopRequested);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.stop_requested());

        assert_eq!(
            session.start(1).unwrap(),
            StartOutcome::Started { device: 1 }
        );
        assert!(!session.stop_requested());
    }

    #[test]
    fn stop_returns_to_idle_and_releases_device() {
        let opener = ScriptedOpener::with_frames(vec![solid_frame(5), solid_frame(6)]);
        let device_log = opener.device_log.clone();
        let session = session_with(opener, InvertAnnotator);

        session.start(0).unwrap();
        assert!(wait_until(|| session.buffer().read().is_some()));

        assert_eq!(session.stop(), StopOutcome::StopRequested);
        assert!(wait_until(|| session.state() == SessionState::Idle));
        assert!(device_log.released.load(Ordering::SeqCst));
        assert!(session.buffer().is_empty());
        assert_eq!(session.device(), None);
    }

    #[test]
    fn start_during_teardown_is_refused_until_loop_exits() {
        let opener = ScriptedOpener::with_frames(vec![solid_frame(1); 4]);
        let device_log = opener.device_log.clone();
        let annotator = Arc::new(GateAnnotator::default());
        let session = LiveSession::new(
            Arc::new(opener),
            annotator.clone(),
            crate::vision::testing::fast_timing(),
        );

        session.start(0).unwrap();
        assert!(wait_until(|| device_log.reads.load(Ordering::SeqCst) >= 1));

        session.stop();
        assert_eq!(session.state(), SessionState::StopRequested);
        assert_eq!(
            session.start(0).unwrap(),
            StartOutcome::AlreadyRunning { device: 0 }
        );

        *annotator.open.lock().unwrap() = true;
        assert!(wait_until(|| session.state() == SessionState::Idle));
        assert!(device_log.released.load(Ordering::SeqCst));

        assert_eq!(
            session.start(2).unwrap(),
            StartOutcome::Started { device: 2 }
        );
        assert!(wait_until(|| device_log.opened.load(Ordering::SeqCst) == 2));
    }

    #[test]
    fn restart_after_stop_opens_a_fresh_device() {
        let opener = ScriptedOpener::with_frames(vec![solid_frame(1)]);
        let device_log = opener.device_log.clone();
        let session = session_with(opener, InvertAnnotator);

        session.start(0).unwrap();
        assert!(wait_until(|| device_log.opened.load(Ordering::SeqCst) == 1));
        session.stop();
        assert!(wait_until(|| session.state() == SessionState::Idle));

        assert_eq!(
            session.start(0).unwrap(),
            StartOutcome::Started { device: 0 }
        );
        assert!(wait_until(|| device_log.opened.load(Ordering::SeqCst) == 2));
        session.shutdown();
        assert!(device_log.released.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_during_an_in_flight_start_still_reaches_idle() {
        let opener = ScriptedOpener::with_frames(vec![solid_frame(1)]);
        let device_log = opener.device_log.clone();
        let session = session_with(opener, InvertAnnotator);

        thread::scope(|scope| {
            // Park `start` after it has taken the lifecycle lock.
            let worker = session.worker.lock().unwrap();
            let starter = scope.spawn(|| session.start(0).unwrap());
            thread::sleep(Duration::from_millis(30));
            let stopper = scope.spawn(|| session.stop());
            thread::sleep(Duration::from_millis(30));
            drop(worker);

            assert_eq!(
                starter.join().unwrap(),
                StartOutcome::Started { device: 0 }
            );
            assert_eq!(stopper.join().unwrap(), StopOutcome::StopRequested);
        });

        assert!(session.stop_requested());
        assert!(wait_until(|| session.state() == SessionState::Idle));
        assert!(device_log.released.load(Ordering::SeqCst));
    }
}
