use std::fmt;

use anyhow::Error;
use chrono::Utc;
use thiserror::Error;

/// Raw BGR8 frame produced by a capture device or an annotator.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Wrap a BGR8 buffer stamped with the current wall-clock time.
    pub fn bgr8(data: Vec<u8>, width: i32, height: i32) -> Self {
        Self {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        }
    }

    /// Number of bytes a well-formed frame of these dimensions carries.
    pub fn expected_len(&self) -> usize {
        let width = self.width.max(0) as usize;
        let height = self.height.max(0) as usize;
        width * height * self.format.channels()
    }

    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.expected_len()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn channels(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video device {device}")]
    Open { device: i32 },
    #[error("device returned an empty frame")]
    EmptyFrame,
    #[error(transparent)]
    Other(#[from] Error),
}

/// An opened capture device. Owned by exactly one capture loop at a time.
pub trait CaptureDevice: Send {
    /// Read the next frame. Errors are treated as transient by callers.
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Release the underlying handle. Must be safe to call more than once.
    fn release(&mut self);
}

/// Factory for capture devices addressed by a numeric id.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, device: i32) -> Result<Box<dyn CaptureDevice>, CaptureError>;
}
