//! JPEG encoding and multipart framing for the MJPEG endpoints.

use std::sync::{Arc, Mutex, PoisonError};

use actix_web::web::Bytes;
use image::{ImageBuffer, Rgb, codecs::jpeg::JpegEncoder};
use video_ingest::{Frame, FrameFormat};

use crate::vision::error::LiveError;

pub(crate) const MULTIPART_BOUNDARY: &str = "frame";
pub(crate) const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Encode a BGR8 frame as JPEG.
pub(crate) fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, LiveError> {
    if !matches!(frame.format, FrameFormat::Bgr8) {
        return Err(LiveError::EncodingFailed("unsupported frame format".into()));
    }
    if !frame.is_well_formed() {
        return Err(LiveError::EncodingFailed(format!(
            "frame {}x{} carries {} bytes, expected {}",
            frame.width,
            frame.height,
            frame.data.len(),
            frame.expected_len()
        )));
    }

    let rgb = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(
        frame.width as u32,
        frame.height as u32,
        bgr_to_rgb(&frame.data),
    )
    .ok_or_else(|| LiveError::EncodingFailed("failed to build image buffer".into()))?;

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|err| LiveError::EncodingFailed(err.to_string()))?;
    Ok(buffer)
}

/// JPEG of the most recently encoded frame, shared by every viewer.
///
/// Frames are matched by `Arc` identity, so each published frame is encoded at
/// most once however many connections read it.
#[derive(Default)]
pub(crate) struct JpegCache {
    slot: Mutex<Option<(Arc<Frame>, Bytes)>>,
}

impl JpegCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Return the cached JPEG for `frame`, encoding it on a miss. Blocks while
    /// another caller encodes.
    pub(crate) fn get_or_encode(
        &self,
        frame: &Arc<Frame>,
        quality: u8,
    ) -> Result<Bytes, LiveError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached, jpeg)) = slot.as_ref() {
            if Arc::ptr_eq(cached, frame) {
                return Ok(jpeg.clone());
            }
        }
        let jpeg = Bytes::from(encode_jpeg(frame, quality)?);
        *slot = Some((frame.clone(), jpeg.clone()));
        Ok(jpeg)
    }
}

/// Wrap one JPEG payload as a `multipart/x-mixed-replace` part.
pub(crate) fn multipart_part(jpeg: &[u8]) -> Bytes {
    let mut payload = Vec::with_capacity(jpeg.len() + 64);
    payload.extend_from_slice(b"--");
    payload.extend_from_slice(MULTIPART_BOUNDARY.as_bytes());
    payload.extend_from_slice(b"\r\n");
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
    }
    output
}
