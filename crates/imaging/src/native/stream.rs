use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Caller-supplied stream source.
pub enum SourceStream {
    Seekable(Box<dyn ReadSeek>),
    /// Drained off-thread before decoding.
    NonSeekable(Box<dyn Read + Send>),
}

impl SourceStream {
    pub fn seekable(reader: impl ReadSeek + 'static) -> Self {
        Self::Seekable(Box::new(reader))
    }

    pub fn non_seekable(reader: impl Read + Send + 'static) -> Self {
        Self::NonSeekable(Box::new(reader))
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self, Self::Seekable(_))
    }
}

impl fmt::Debug for SourceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seekable(_) => f.write_str("SourceStream::Seekable"),
            Self::NonSeekable(_) => f.write_str("SourceStream::NonSeekable"),
        }
    }
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

struct StreamInner {
    id: u64,
    description: String,
    reader: Mutex<Option<Box<dyn ReadSeek>>>,
    closed: AtomicBool,
    reads: AtomicUsize,
}

/// Seekable stream backing an open container. Clones share the same reader.
///
/// `close` runs at most once no matter how many owners call it; every read after
/// that fails with an I/O error.
#[derive(Clone)]
pub struct BackingStream {
    inner: Arc<StreamInner>,
}

impl BackingStream {
    pub fn new(reader: impl ReadSeek + 'static, description: impl Into<String>) -> Self {
        Self::from_boxed(Box::new(reader), description)
    }

    pub fn from_boxed(reader: Box<dyn ReadSeek>, description: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
                description: description.into(),
                reader: Mutex::new(Some(reader)),
                closed: AtomicBool::new(false),
                reads: AtomicUsize::new(0),
            }),
        }
    }

    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>, description: impl Into<String>) -> Self {
        let bytes: Arc<[u8]> = bytes.into();
        Self::new(Cursor::new(bytes), description)
    }

    pub fn open_file(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file), path.display().to_string()))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    fn with_reader<R>(&self, f: impl FnOnce(&mut dyn ReadSeek) -> io::Result<R>) -> io::Result<R> {
        let mut guard = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let reader = guard.as_mut().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("stream {} is closed", self.inner.description),
            )
        })?;
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
        f(reader.as_mut())
    }

    /// Reads up to `len` bytes from the start of the stream.
    pub fn read_header(&self, len: usize) -> io::Result<Vec<u8>> {
        self.with_reader(|reader| {
            reader.seek(SeekFrom::Start(0))?;
            let mut header = Vec::with_capacity(len);
            reader.take(len as u64).read_to_end(&mut header)?;
            Ok(header)
        })
    }

    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        self.with_reader(|reader| {
            reader.seek(SeekFrom::Start(0))?;
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            Ok(bytes)
        })
    }

    /// Returns true for the call that actually closed the stream.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let reader = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(reader);
        tracing::debug!(stream = %self.inner.description, "backing stream closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of read operations issued against the stream so far.
    pub fn read_count(&self) -> usize {
        self.inner.reads.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for BackingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackingStream")
            .field("id", &self.inner.id)
            .field("description", &self.inner.description)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_rewind() {
        let stream = BackingStream::from_bytes(vec![1, 2, 3, 4, 5], "memory");
        assert_eq!(stream.read_header(2).unwrap(), vec![1, 2]);
        assert_eq!(stream.read_all().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(stream.read_header(16).unwrap().len(), 5);
        assert_eq!(stream.read_count(), 3);
    }

    #[test]
    fn test_close_happens_once() {
        let stream = BackingStream::from_bytes(vec![0; 4], "memory");
        let clone = stream.clone();

        assert!(stream.close());
        assert!(!clone.close());
        assert!(clone.is_closed());

        let err = clone.read_all().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(stream.read_count(), 0);
    }
}
