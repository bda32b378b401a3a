use crate::error::{ImagingError, ImagingResult};
use crate::native::SourceStream;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

/// Where a decoder's bytes come from.
#[derive(Debug)]
pub enum BitmapSource {
    /// Absolute URI, or a file path written as a string.
    Uri(String),
    Path(PathBuf),
    Stream(SourceStream),
    Bytes(Arc<[u8]>),
}

impl From<&str> for BitmapSource {
    fn from(uri: &str) -> Self {
        BitmapSource::Uri(uri.to_string())
    }
}

impl From<String> for BitmapSource {
    fn from(uri: String) -> Self {
        BitmapSource::Uri(uri)
    }
}

impl From<Url> for BitmapSource {
    fn from(url: Url) -> Self {
        BitmapSource::Uri(url.into())
    }
}

impl From<PathBuf> for BitmapSource {
    fn from(path: PathBuf) -> Self {
        BitmapSource::Path(path)
    }
}

impl From<&Path> for BitmapSource {
    fn from(path: &Path) -> Self {
        BitmapSource::Path(path.to_path_buf())
    }
}

impl From<SourceStream> for BitmapSource {
    fn from(stream: SourceStream) -> Self {
        BitmapSource::Stream(stream)
    }
}

impl From<Vec<u8>> for BitmapSource {
    fn from(bytes: Vec<u8>) -> Self {
        BitmapSource::Bytes(bytes.into())
    }
}

static NEXT_STREAM_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Normalized identity of a source. Only URI identities are shared through the
/// decoder cache; every stream gets a fresh token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceIdentity {
    Uri(Url),
    Stream(u64),
}

impl SourceIdentity {
    pub fn from_uri(uri: &str) -> ImagingResult<Self> {
        Ok(SourceIdentity::Uri(normalize_uri(uri)?))
    }

    pub fn from_path(path: &Path) -> ImagingResult<Self> {
        Ok(SourceIdentity::Uri(path_to_url(path)?))
    }

    pub(crate) fn next_stream() -> Self {
        SourceIdentity::Stream(NEXT_STREAM_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn url(&self) -> Option<&Url> {
        match self {
            SourceIdentity::Uri(url) => Some(url),
            SourceIdentity::Stream(_) => None,
        }
    }

    pub fn is_network(&self) -> bool {
        self.url()
            .is_some_and(|url| matches!(url.scheme(), "http" | "https"))
    }

    pub fn is_cacheable(&self) -> bool {
        matches!(self, SourceIdentity::Uri(_))
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        self.url()
            .filter(|url| url.scheme() == "file")
            .and_then(|url| url.to_file_path().ok())
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceIdentity::Uri(url) => write!(f, "{url}"),
            SourceIdentity::Stream(token) => write!(f, "stream#{token}"),
        }
    }
}

fn path_to_url(path: &Path) -> ImagingResult<Url> {
    let absolute = std::path::absolute(path)?;
    Url::from_file_path(&absolute).map_err(|()| {
        ImagingError::InvalidArgument(format!("{} cannot be expressed as a URI", path.display()))
    })
}

/// Parses an absolute URI, falling back to treating the text as a file path.
fn normalize_uri(uri: &str) -> ImagingResult<Url> {
    let trimmed = uri.trim();
    if trimmed.is_empty() {
        return Err(ImagingError::InvalidArgument("empty URI".to_string()));
    }

    match Url::parse(trimmed) {
        // Single-letter schemes are Windows drive letters.
        Ok(url) if url.scheme().len() > 1 => {
            let mut url = url;
            url.set_fragment(None);
            match url.scheme() {
                "file" | "http" | "https" => Ok(url),
                other => Err(ImagingError::InvalidArgument(format!(
                    "unsupported URI scheme '{other}'"
                ))),
            }
        }
        _ => path_to_url(Path::new(trimmed)),
    }
}
