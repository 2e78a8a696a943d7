use std::{convert::TryFrom, path::Path};

use anyhow::{Result, bail};
use tch::{self, Device, Kind, Tensor};

use crate::{DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_IOU_THRESHOLD, DetectionBatch, decode_yolov8};

/// TorchScript-backed detector wrapper.
pub struct Detector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl Detector {
    /// Load a TorchScript module onto `device`.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
    ) -> Result<Self> {
        let module = tch::CModule::load_on_device(model_path, device)?;
        Ok(Self {
            module,
            device,
            input_size,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        })
    }

    /// Override the confidence threshold used for filtering detections.
    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    /// Override the IoU used by non-maximum suppression.
    pub fn with_iou_threshold(mut self, iou: f32) -> Self {
        self.iou_threshold = iou;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn input_size(&self) -> (i64, i64) {
        self.input_size
    }

    /// Convert a BGR8 frame into a normalized NCHW RGB tensor at the detector
    /// input size.
    pub fn bgr_to_tensor(&self, bgr: &[u8], width: i32, height: i32) -> Result<Tensor> {
        let expected = (width as usize) * (height as usize) * 3;
        if bgr.len() != expected {
            bail!(
                "unexpected frame buffer size: got {} bytes, expected {}",
                bgr.len(),
                expected
            );
        }

        let (in_w, in_h) = self.input_size;
        let tensor = Tensor::from_slice(bgr)
            .to_device(self.device)
            .view([height as i64, width as i64, 3])
            .flip([2])
            .permute([2, 0, 1])
            .unsqueeze(0)
            .to_kind(Kind::Float)
            / 255.0;

        if (width as i64, height as i64) == (in_w, in_h) {
            Ok(tensor)
        } else {
            Ok(tensor.upsample_bilinear2d([in_h, in_w], false, None, None))
        }
    }

    /// Run the TorchScript module and decode its YOLOv8 head.
    pub fn infer(&self, input: &Tensor) -> Result<DetectionBatch> {
        let output = self.module.forward_ts(&[input])?;
        decode_output(&output, self.confidence_threshold, self.iou_threshold)
    }
}

/// Decode a `[1, 4 + nc, anchors]` YOLOv8 output tensor.
pub fn decode_output(
    output: &Tensor,
    confidence_threshold: f32,
    iou_threshold: f32,
) -> Result<DetectionBatch> {
    let shape = output.size();
    if shape.len() != 3 {
        bail!("unexpected detector output shape: {shape:?}");
    }
    if shape[0] != 1 {
        bail!("detector expected batch=1 but received {}", shape[0]);
    }
    let (channels, anchors) = (shape[1] as usize, shape[2] as usize);

    let flat = output
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .contiguous()
        .view([-1]);
    let data = Vec::<f32>::try_from(&flat)?;
    decode_yolov8(&data, channels, anchors, confidence_threshold, iou_threshold)
}
