//! Object-detection primitives consumed by the live annotator.
//!
//! The detection result types are always available so annotation code can be
//! exercised without a model. Enable the `with-tch` feature to pull in the
//! TorchScript-backed [`detector::Detector`].

#[cfg(feature = "with-tch")]
pub mod detector;

#[cfg(feature = "with-tch")]
pub use tch;

use anyhow::{Result, bail};

/// Confidence below which candidates are discarded.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
/// IoU above which a lower-scoring box of the same class is suppressed.
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
/// Upper bound on detections kept per frame.
pub const MAX_DETECTIONS: usize = 300;

/// Single detection in detector input coordinates (`[x1, y1, x2, y2]`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: i64,
}

impl Detection {
    /// Display label; class names live in the model, so only the id is known.
    pub fn label(&self) -> String {
        format!("CLASS {}", self.class_id)
    }

    fn area(&self) -> f32 {
        (self.bbox[2] - self.bbox[0]).max(0.0) * (self.bbox[3] - self.bbox[1]).max(0.0)
    }

    fn iou(&self, other: &Detection) -> f32 {
        let w = (self.bbox[2].min(other.bbox[2]) - self.bbox[0].max(other.bbox[0])).max(0.0);
        let h = (self.bbox[3].min(other.bbox[3]) - self.bbox[1].max(other.bbox[1])).max(0.0);
        let intersection = w * h;
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// Decode a YOLOv8 detection head laid out channel-major as `[4 + nc, anchors]`.
///
/// Channels 0..4 hold `cx, cy, w, h`; the remaining `nc` channels hold one
/// score per class. There is no objectness column: each anchor takes its
/// best class score. Surviving boxes are converted to corners and pruned with
/// per-class NMS.
pub fn decode_yolov8(
    data: &[f32],
    channels: usize,
    anchors: usize,
    confidence_threshold: f32,
    iou_threshold: f32,
) -> Result<DetectionBatch> {
    if channels < 5 {
        bail!("YOLOv8 output needs box channels plus at least one class, got {channels} channels");
    }
    if data.len() != channels * anchors {
        bail!(
            "YOLOv8 output holds {} values, expected {channels}x{anchors}",
            data.len()
        );
    }

    let at = |channel: usize, anchor: usize| data[channel * anchors + anchor];
    let mut candidates = Vec::new();
    for anchor in 0..anchors {
        let (class_id, score) = (4..channels)
            .map(|channel| (channel - 4, at(channel, anchor)))
            .fold((0, f32::NEG_INFINITY), |best, current| {
                if current.1 > best.1 { current } else { best }
            });
        // Also rejects NaN scores.
        if !(score >= confidence_threshold) {
            continue;
        }
        let (cx, cy) = (at(0, anchor), at(1, anchor));
        let (half_w, half_h) = (at(2, anchor) / 2.0, at(3, anchor) / 2.0);
        candidates.push(Detection {
            bbox: [cx - half_w, cy - half_h, cx + half_w, cy + half_h],
            score,
            class_id: class_id as i64,
        });
    }

    Ok(DetectionBatch {
        detections: non_max_suppression(candidates, iou_threshold, MAX_DETECTIONS),
    })
}

/// Greedy per-class NMS, highest score first, keeping at most `limit` boxes.
pub fn non_max_suppression(
    mut candidates: Vec<Detection>,
    iou_threshold: f32,
    limit: usize,
) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        if kept.len() >= limit {
            break;
        }
        let suppressed = kept.iter().any(|existing| {
            existing.class_id == candidate.class_id && existing.iou(&candidate) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// Detections for a single frame.
#[derive(Debug, Clone, Default)]
pub struct DetectionBatch {
    pub detections: Vec<Detection>,
}

impl DetectionBatch {
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Scale boxes from detector input space into a `width`x`height` frame.
    pub fn scaled_to(&self, input_size: (i64, i64), width: i32, height: i32) -> Vec<Detection> {
        let (in_w, in_h) = input_size;
        let scale_x = if in_w > 0 { width as f32 / in_w as f32 } else { 1.0 };
        let scale_y = if in_h > 0 { height as f32 / in_h as f32 } else { 1.0 };
        let max_x = (width - 1).max(0) as f32;
        let max_y = (height - 1).max(0) as f32;

        self.detections
            .iter()
            .map(|det| Detection {
                bbox: [
                    (det.bbox[0] * scale_x).clamp(0.0, max_x),
                    (det.bbox[1] * scale_y).clamp(0.0, max_y),
                    (det.bbox[2] * scale_x).clamp(0.0, max_x),
                    (det.bbox[3] * scale_y).clamp(0.0, max_y),
                ],
                score: det.score,
                class_id: det.class_id,
            })
            .collect()
    }
}
