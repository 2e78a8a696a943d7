//! Capture-side building blocks for the live pipeline.
//!
//! The crate exposes the [`Frame`] type shared with the rest of the workspace
//! and two seams: [`DeviceOpener`] turns a numeric device id into an owned
//! [`CaptureDevice`], which the capture loop then reads until it is released.

#[cfg(feature = "with-opencv")]
mod camera;
mod pattern;
mod types;

#[cfg(feature = "with-opencv")]
pub use camera::OpenCvOpener;
pub use pattern::{TestPatternCamera, TestPatternOpener};
pub use types::{CaptureDevice, CaptureError, DeviceOpener, Frame, FrameFormat};
