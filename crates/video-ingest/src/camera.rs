//! OpenCV-backed camera capture.

use anyhow::anyhow;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{debug, warn};

use crate::types::{CaptureDevice, CaptureError, DeviceOpener, Frame};

/// Opens local cameras by index and resizes frames to `target_size`.
#[derive(Clone, Debug)]
pub struct OpenCvOpener {
    target_size: (i32, i32),
    fps: f64,
}

impl OpenCvOpener {
    pub fn new(target_size: (i32, i32)) -> Self {
        Self {
            target_size,
            fps: 30.0,
        }
    }
}

impl DeviceOpener for OpenCvOpener {
    fn open(&self, device: i32) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let mut cap = open_video_capture(device)?;
        configure_camera(&mut cap, self.target_size, self.fps);
        Ok(Box::new(OpenCvCamera {
            cap,
            device,
            target_size: self.target_size,
            frame: Mat::default(),
            scratch: Mat::default(),
            released: false,
        }))
    }
}

struct OpenCvCamera {
    cap: VideoCapture,
    device: i32,
    target_size: (i32, i32),
    frame: Mat,
    scratch: Mat,
    released: bool,
}

impl CaptureDevice for OpenCvCamera {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let grabbed = self
            .cap
            .read(&mut self.frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed {
            return Err(CaptureError::EmptyFrame);
        }

        let size = self
            .frame
            .size()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 || size.height <= 0 {
            return Err(CaptureError::EmptyFrame);
        }

        let (target_w, target_h) = self.target_size;
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();
        if data.len() != (target_w as usize) * (target_h as usize) * 3 {
            return Err(CaptureError::Other(anyhow!(
                "device #{} produced {} bytes for a {target_w}x{target_h} BGR frame",
                self.device,
                data.len()
            )));
        }

        Ok(Frame::bgr8(data, target_w, target_h))
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.cap.release() {
            warn!("failed to release video device #{}: {err}", self.device);
        } else {
            debug!("released video device #{}", self.device);
        }
    }
}

impl Drop for OpenCvCamera {
    fn drop(&mut self) {
        self.release();
    }
}

/// Attempt to open a camera by index, preferring V4L.
fn open_video_capture(index: i32) -> Result<VideoCapture, CaptureError> {
    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::new(index, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open device #{index} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open { device: index })
}

/// Apply common capture settings (resolution, fps, preferred pixel format).
fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
