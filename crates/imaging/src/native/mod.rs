mod handle;
mod stream;

pub use handle::{HandleKind, NativeHandle};
pub use stream::{BackingStream, ReadSeek, SourceStream};

use imaging_types::CacheOption;
use thiserror::Error;

/// Errors returned across the codec engine seam. `NotPresent` is a sentinel, not a
/// failure: callers turn it into an absent value.
#[derive(Debug, Error)]
pub enum NativeError {
    #[error("Component not present")]
    NotPresent,
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("Malformed color profile: {0}")]
    BadColorProfile(String),
    #[error("Corrupt image data: {0}")]
    Corrupt(String),
    #[error("Stream error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Engine error: {0}")]
    Engine(String),
}

pub type NativeResult<T> = Result<T, NativeError>;

pub trait NativeResultExt<T> {
    /// Maps the not-present sentinel to `Ok(None)`.
    fn present(self) -> NativeResult<Option<T>>;
}

impl<T> NativeResultExt<T> for NativeResult<T> {
    fn present(self) -> NativeResult<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(NativeError::NotPresent) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// How the engine should materialize pixels behind a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheHint {
    OnDemand,
    OnLoad,
    None,
}

impl From<CacheOption> for CacheHint {
    fn from(option: CacheOption) -> Self {
        match option.effective() {
            CacheOption::OnLoad => CacheHint::OnLoad,
            CacheOption::None => CacheHint::None,
            _ => CacheHint::OnDemand,
        }
    }
}
