//! Synthetic capture backend used when no camera stack is compiled in.

use tracing::debug;

use crate::types::{CaptureDevice, CaptureError, DeviceOpener, Frame};

const BAR_COLORS_BGR: [[u8; 3]; 8] = [
    [255, 255, 255],
    [0, 255, 255],
    [255, 255, 0],
    [0, 255, 0],
    [255, 0, 255],
    [0, 0, 255],
    [255, 0, 0],
    [16, 16, 16],
];

/// Produces [`TestPatternCamera`]s for any non-negative device id.
#[derive(Clone, Debug)]
pub struct TestPatternOpener {
    width: i32,
    height: i32,
}

impl TestPatternOpener {
    pub fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }
}

impl DeviceOpener for TestPatternOpener {
    fn open(&self, device: i32) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        if device < 0 || self.width <= 0 || self.height <= 0 {
            return Err(CaptureError::Open { device });
        }
        debug!(
            "opened test pattern #{device} ({}x{})",
            self.width, self.height
        );
        Ok(Box::new(TestPatternCamera::new(self.width, self.height)))
    }
}

/// Colour bars scrolling one column per frame.
pub struct TestPatternCamera {
    width: i32,
    height: i32,
    offset: usize,
    released: bool,
}

impl TestPatternCamera {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            offset: 0,
            released: false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn render(&self) -> Vec<u8> {
        let width = self.width as usize;
        let height = self.height as usize;
        let bar_width = (width / BAR_COLORS_BGR.len()).max(1);
        let mut row = Vec::with_capacity(width * 3);
        for x in 0..width {
            let bar = ((x + self.offset) / bar_width) % BAR_COLORS_BGR.len();
            row.extend_from_slice(&BAR_COLORS_BGR[bar]);
        }
        let mut data = Vec::with_capacity(row.len() * height);
        for _ in 0..height {
            data.extend_from_slice(&row);
        }
        data
    }
}

impl CaptureDevice for TestPatternCamera {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if self.released {
            return Err(CaptureError::EmptyFrame);
        }
        let data = self.render();
        self.offset = self.offset.wrapping_add(1);
        Ok(Frame::bgr8(data, self.width, self.height))
    }

    fn release(&mut self) {
        self.released = true;
    }
}
