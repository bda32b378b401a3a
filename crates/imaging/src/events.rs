use crate::error::ImagingError;
use std::sync::Arc;

/// Notifications from a decoder whose bytes are still arriving.
#[derive(Debug, Clone)]
pub enum DecoderEvent {
    DownloadProgress(u8),
    DownloadCompleted,
    DownloadFailed(Arc<ImagingError>),
}

/// Notifications from frames and bitmap images.
#[derive(Debug, Clone)]
pub enum BitmapEvent {
    /// Content could not be decoded and was replaced by a 1×1 transparent pixel.
    DecodeFailed(Arc<ImagingError>),
    /// A placeholder frame now points at the real decoder.
    Rebound,
    /// Replaced content will be rebuilt on next access.
    ContentInvalidated,
}
