use crate::format::ContainerFormat;
use crate::native::NativeError;
use std::io;
use std::sync::PoisonError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Container format mismatch: expected {expected}, found {found}")]
    FormatMismatch {
        expected: ContainerFormat,
        found: ContainerFormat,
    },

    #[error("No decoder recognises this content")]
    UnknownFormat,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Codec engine error: {0}")]
    Native(NativeError),

    #[error("Decode failed: {0}")]
    DecodeFailure(String),

    #[error("Download failed: {0}")]
    Network(String),

    #[error("Color profile rejected: {0}")]
    ColorProfile(String),
}

pub type ImagingResult<T> = Result<T, ImagingError>;

impl ImagingError {
    /// Content problems that are replaced by a placeholder instead of surfacing.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ImagingError::Io(_)
                | ImagingError::FormatMismatch { .. }
                | ImagingError::InvalidArgument(_)
                | ImagingError::InvalidOperation(_)
        )
    }
}

impl From<NativeError> for ImagingError {
    fn from(err: NativeError) -> Self {
        match err {
            NativeError::Io(io) => ImagingError::Io(io),
            NativeError::Corrupt(message) => ImagingError::DecodeFailure(message),
            NativeError::BadColorProfile(message) => ImagingError::ColorProfile(message),
            other => ImagingError::Native(other),
        }
    }
}

impl<T> From<PoisonError<T>> for ImagingError {
    fn from(_: PoisonError<T>) -> Self {
        ImagingError::InvalidOperation("a lock was poisoned by a panicking thread".to_string())
    }
}
