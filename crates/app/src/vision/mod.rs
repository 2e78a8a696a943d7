//! Live capture session served over HTTP as an MJPEG stream.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `session`: Start/stop controller and session state machine.
//! - `pipeline`: Capture loop run on the dedicated capture thread.
//! - `annotation`: Frame annotators and drawing primitives.
//! - `encoding`: JPEG encode and multipart framing.
//! - `server`: Actix Web endpoints and the per-connection stream publisher.
//! - `telemetry`: Tracing subscriber and Prometheus recorder setup.
//! - `data`: Frame buffer and response types shared between the above.
//! - `error`: Typed failures of the capture and publish paths.

/// Re-export server settings so callers can configure runs without reaching
/// into submodules.
pub use config::{CaptureBackend, LiveConfig, LiveServerArgs};
/// Launch the live server with a ready-made configuration.
pub use server::run;

mod annotation;
mod config;
mod data;
mod encoding;
mod error;
mod pipeline;
mod server;
mod session;
mod telemetry;

#[cfg(test)]
mod testing;
