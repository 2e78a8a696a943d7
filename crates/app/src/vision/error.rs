use thiserror::Error;
use video_ingest::CaptureError;

/// Failures contained inside the live subsystem. None of them are fatal to the
/// process; each is recovered at the component where it occurs.
#[derive(Debug, Error)]
pub(crate) enum LiveError {
    #[error("capture device {device} unavailable: {source}")]
    DeviceUnavailable {
        device: i32,
        #[source]
        source: CaptureError,
    },
    #[error("frame read failed: {0}")]
    FrameReadTransientFailure(#[source] CaptureError),
    #[error("annotation failed: {0}")]
    AnnotationFailed(#[source] AnnotationError),
    #[error("frame encoding failed: {0}")]
    EncodingFailed(String),
}

/// Error surfaced by an [`Annotator`](crate::vision::annotation::Annotator).
#[derive(Debug, Error)]
pub(crate) enum AnnotationError {
    #[error("frame {width}x{height} carries {actual} bytes, expected {expected}")]
    MalformedFrame {
        width: i32,
        height: i32,
        actual: usize,
        expected: usize,
    },
    #[error(transparent)]
    Model(#[from] anyhow::Error),
}
