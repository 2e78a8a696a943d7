use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use video_ingest::Frame;

/// Single-slot holder for the most recently published frame.
///
/// Writes replace the stored frame and reads hand out a shared handle to it;
/// nothing is queued, so a reader only ever sees the latest write.
#[derive(Default)]
pub(crate) struct FrameBuffer {
    slot: Mutex<Option<Arc<Frame>>>,
}

impl FrameBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn write(&self, frame: Frame) {
        let frame = Arc::new(frame);
        let mut guard = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(frame);
    }

    pub(crate) fn read(&self) -> Option<Arc<Frame>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn clear(&self) {
        let stale = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(stale);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Lifecycle of the live capture session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SessionState {
    Idle,
    Running,
    StopRequested,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum StartOutcome {
    Started { device: i32 },
    AlreadyRunning { device: i32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum StopOutcome {
    StopRequested,
}

#[derive(Serialize)]
pub(crate) struct StatusResponse {
    pub(crate) state: SessionState,
    pub(crate) device: Option<i32>,
    pub(crate) has_frame: bool,
    pub(crate) frames_published: u64,
}
