use crate::codec::ImageData;

use super::{CaptureResult, CaptureSource};

pub const UNKNOWN_LABEL: &str = "Unknown";

/// 8×8 grey baseline JPEG.
static PLACEHOLDER_JPEG: &[u8] = include_bytes!("../../assets/placeholder.jpg");

/// The capture handed out when nothing better is available. Infallible.
pub fn placeholder() -> CaptureResult {
    CaptureResult {
        image: ImageData::from_jpeg(PLACEHOLDER_JPEG),
        label: UNKNOWN_LABEL.to_string(),
        confidences: None,
        source: CaptureSource::Placeholder,
    }
}
