//! Annotators applied to every captured frame before it is published.
//!
//! Annotators draw directly onto the BGR8 buffer. The palette only uses colours
//! whose channels read the same in BGR and RGB order so no swizzle is needed.

use std::{
    sync::{Mutex, PoisonError},
    time::Instant,
};

use image::{ImageBuffer, Rgb};
use ml_core::Detection;
use video_ingest::Frame;

use crate::vision::error::AnnotationError;

type BgrImage = ImageBuffer<Rgb<u8>, Vec<u8>>;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BACKDROP_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const GLYPH_ADVANCE: i32 = 6;

/// Frame-in, frame-out transformation run by the capture loop.
pub(crate) trait Annotator: Send + Sync {
    fn annotate(&self, frame: &Frame) -> Result<Frame, AnnotationError>;
}

/// Stamps a `FRAME nnnnnn  FPS xx.x` info bar onto each frame.
#[derive(Default)]
pub(crate) struct OverlayAnnotator {
    state: Mutex<OverlayState>,
}

#[derive(Default)]
struct OverlayState {
    frame_number: u64,
    smoothed_fps: f32,
    last_instant: Option<Instant>,
}

impl OverlayState {
    fn tick(&mut self) -> (u64, f32) {
        let now = Instant::now();
        if let Some(last) = self.last_instant {
            let elapsed = now.duration_since(last).as_secs_f32();
            if elapsed > 0.0 {
                let instant = 1.0 / elapsed;
                self.smoothed_fps = if self.smoothed_fps == 0.0 {
                    instant
                } else {
                    0.9 * self.smoothed_fps + 0.1 * instant
                };
            }
        }
        self.last_instant = Some(now);
        self.frame_number = self.frame_number.wrapping_add(1);
        (self.frame_number, self.smoothed_fps)
    }
}

impl OverlayAnnotator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn next_tick(&self) -> (u64, f32) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tick()
    }
}

impl Annotator for OverlayAnnotator {
    fn annotate(&self, frame: &Frame) -> Result<Frame, AnnotationError> {
        let mut image = to_image(frame)?;
        let (frame_number, fps) = self.next_tick();
        draw_info_bar(&mut image, frame_number, fps);
        Ok(from_image(image, frame))
    }
}

/// Runs the TorchScript detector and draws labelled boxes plus the info bar.
#[cfg(feature = "with-tch")]
pub(crate) struct DetectorAnnotator {
    detector: Mutex<ml_core::detector::Detector>,
    overlay: OverlayAnnotator,
}

#[cfg(feature = "with-tch")]
impl DetectorAnnotator {
    pub(crate) fn new(detector: ml_core::detector::Detector) -> Self {
        Self {
            detector: Mutex::new(detector),
            overlay: OverlayAnnotator::new(),
        }
    }
}

#[cfg(feature = "with-tch")]
impl Annotator for DetectorAnnotator {
    fn annotate(&self, frame: &Frame) -> Result<Frame, AnnotationError> {
        let mut image = to_image(frame)?;
        let detections = {
            let detector = self
                .detector
                .lock()
                .map_err(|_| anyhow::anyhow!("detector lock poisoned"))?;
            let input = detector.bgr_to_tensor(&frame.data, frame.width, frame.height)?;
            detector
                .infer(&input)?
                .scaled_to(detector.input_size(), frame.width, frame.height)
        };
        if !detections.is_empty() {
            tracing::debug!("{} detection(s)", detections.len());
        }
        draw_detections(&mut image, &detections);
        let (frame_number, fps) = self.overlay.next_tick();
        draw_info_bar(&mut image, frame_number, fps);
        Ok(from_image(image, frame))
    }
}

fn to_image(frame: &Frame) -> Result<BgrImage, AnnotationError> {
    let malformed = || AnnotationError::MalformedFrame {
        width: frame.width,
        height: frame.height,
        actual: frame.data.len(),
        expected: frame.expected_len(),
    };
    if !frame.is_well_formed() {
        return Err(malformed());
    }
    BgrImage::from_raw(frame.width as u32, frame.height as u32, frame.data.clone())
        .ok_or_else(malformed)
}

fn from_image(image: BgrImage, source: &Frame) -> Frame {
    Frame {
        data: image.into_raw(),
        width: source.width,
        height: source.height,
        timestamp_ms: source.timestamp_ms,
        format: source.format,
    }
}

#[cfg_attr(not(feature = "with-tch"), allow(dead_code))]
pub(crate) fn draw_detections(image: &mut BgrImage, detections: &[Detection]) {
    for det in detections {
        draw_rectangle(
            image,
            det.bbox[0].round() as i32,
            det.bbox[1].round() as i32,
            det.bbox[2].round() as i32,
            det.bbox[3].round() as i32,
            BOX_COLOR,
        );
    }

    for det in detections {
        let label = format!("{} {:.0}%", det.label(), det.score * 100.0);
        let label_x = det.bbox[0].round() as i32;
        let label_y = (det.bbox[1].round() as i32 - 12).max(0);
        let text_width = label.chars().count() as i32 * GLYPH_ADVANCE;
        fill_rect(
            image,
            label_x,
            label_y,
            label_x + text_width,
            label_y + 8,
            BACKDROP_COLOR,
        );
        draw_label(image, label_x, label_y, &label, BOX_COLOR);
    }
}

fn draw_info_bar(image: &mut BgrImage, frame_number: u64, fps: f32) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let info = format!("FRAME {:06}  FPS {:4.1}", frame_number, fps);
    let info_width = (info.chars().count() as i32 * GLYPH_ADVANCE).min(width);
    let info_x = (width - info_width - 4).max(0);
    let info_y = (height - 12).max(0);
    fill_rect(
        image,
        info_x,
        info_y,
        info_x + info_width + 4,
        info_y + 8,
        BACKDROP_COLOR,
    );
    draw_label(image, info_x + 2, info_y, &info, TEXT_COLOR);
}

fn draw_rectangle(
    image: &mut BgrImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 {
        return;
    }
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for x in left..=right {
        *image.get_pixel_mut(x as u32, top as u32) = color;
        *image.get_pixel_mut(x as u32, bottom as u32) = color;
    }
    for y in top..=bottom {
        *image.get_pixel_mut(left as u32, y as u32) = color;
        *image.get_pixel_mut(right as u32, y as u32) = color;
    }
}

fn fill_rect(
    image: &mut BgrImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 {
        return;
    }
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for y in top..=bottom {
        for x in left..=right {
            *image.get_pixel_mut(x as u32, y as u32) = color;
        }
    }
}

fn draw_label(image: &mut BgrImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col;
                        if px >= 0 && px < width {
                            *image.get_pixel_mut(px as u32, py as u32) = color;
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        'A' => Some([
            0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001,
        ]),
        'B' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110,
        ]),
        'C' => Some([
            0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110,
        ]),
        'D' => Some([
            0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110,
        ]),
        'E' => Some([
            0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111,
        ]),
        'F' => Some([
            0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000,
        ]),
        'H' => Some([
            0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001,
        ]),
        'J' => Some([
            0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100,
        ]),
        'L' => Some([
            0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111,
        ]),
        'M' => Some([
            0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001,
        ]),
        'N' => Some([
            0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001,
        ]),
        'O' => Some([
            0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110,
        ]),
        'P' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000,
        ]),
        'R' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001,
        ]),
        'S' => Some([
            0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110,
        ]),
        'T' => Some([
            0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100,
        ]),
        '0' => Some([
            0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110,
        ]),
        '1' => Some([
            0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110,
        ]),
        '2' => Some([
            0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111,
        ]),
        '3' => Some([
            0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110,
        ]),
        '4' => Some([
            0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010,
        ]),
        '5' => Some([
            0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110,
        ]),
        '6' => Some([
            0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110,
        ]),
        '7' => Some([
            0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000,
        ]),
        '8' => Some([
            0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110,
        ]),
        '9' => Some([
            0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100,
        ]),
        '%' => Some([
            0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000,
        ]),
        '.' => Some([0, 0, 0, 0, 0, 0b00110, 0b00110]),
        ' ' => Some([0; 7]),
        _ => None,
    }
}
