//! Background fetching for sources that cannot be decoded in place.

use crate::error::ImagingError;
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadCachePolicy {
    #[default]
    Default,
    /// Bypass intermediate HTTP caches.
    NoCache,
}

pub struct DownloadRequest {
    pub uri: Option<Url>,
    pub cache_policy: DownloadCachePolicy,
    /// A non-seekable stream to drain instead of fetching `uri`.
    pub existing_stream: Option<Box<dyn Read + Send>>,
}

impl DownloadRequest {
    pub fn for_uri(uri: Url, cache_policy: DownloadCachePolicy) -> Self {
        Self {
            uri: Some(uri),
            cache_policy,
            existing_stream: None,
        }
    }

    pub fn for_stream(stream: Box<dyn Read + Send>) -> Self {
        Self {
            uri: None,
            cache_policy: DownloadCachePolicy::Default,
            existing_stream: Some(stream),
        }
    }
}

impl fmt::Debug for DownloadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadRequest")
            .field("uri", &self.uri.as_ref().map(Url::as_str))
            .field("cache_policy", &self.cache_policy)
            .field("existing_stream", &self.existing_stream.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub enum DownloadEvent {
    Progress(u8),
    Completed(Arc<[u8]>),
    Failed(ImagingError),
}

/// Producer side of a download. Sends are dropped once the decoder is gone.
#[derive(Debug, Clone)]
pub struct DownloadSender {
    tx: UnboundedSender<DownloadEvent>,
}

impl DownloadSender {
    pub fn progress(&self, percent: u8) -> bool {
        self.tx.send(DownloadEvent::Progress(percent.min(100))).is_ok()
    }

    pub fn complete(&self, bytes: Vec<u8>) -> bool {
        self.tx.send(DownloadEvent::Completed(bytes.into())).is_ok()
    }

    pub fn fail(&self, error: ImagingError) -> bool {
        self.tx.send(DownloadEvent::Failed(error)).is_ok()
    }

    /// True once the receiving decoder has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub(crate) fn download_channel() -> (DownloadSender, UnboundedReceiver<DownloadEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DownloadSender { tx }, rx)
}

/// Starts fetching bytes for a late-bound decoder. Must not block: results arrive
/// through `events`, from any thread.
pub trait Downloader: Send + Sync {
    fn begin_download(&self, request: DownloadRequest, events: DownloadSender);
}

#[derive(Debug, Clone)]
pub struct DefaultDownloader {
    chunk_size: usize,
    user_agent: String,
}

impl DefaultDownloader {
    pub fn new(chunk_size: usize, user_agent: impl Into<String>) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            user_agent: user_agent.into(),
        }
    }
}

impl Downloader for DefaultDownloader {
    fn begin_download(&self, request: DownloadRequest, events: DownloadSender) {
        let chunk_size = self.chunk_size;
        match (request.existing_stream, request.uri) {
            (Some(stream), _) => {
                rayon::spawn(move || drain(stream, None, chunk_size, &events));
            }
            (None, Some(uri)) if matches!(uri.scheme(), "http" | "https") => {
                fetch_http(uri, request.cache_policy, self.user_agent.clone(), chunk_size, events);
            }
            (None, Some(uri)) => {
                events.fail(ImagingError::Network(format!(
                    "cannot download '{}' scheme",
                    uri.scheme()
                )));
            }
            (None, None) => {
                events.fail(ImagingError::InvalidArgument(
                    "download request has neither a URI nor a stream".into(),
                ));
            }
        }
    }
}

/// Reads `reader` to the end in `chunk_size` pieces, reporting progress when the
/// total length is known. Stops early once nobody is listening.
fn drain(mut reader: impl Read, total: Option<u64>, chunk_size: usize, events: &DownloadSender) {
    let mut bytes = Vec::with_capacity(total.unwrap_or(0).min(64 << 20) as usize);
    let mut chunk = vec![0u8; chunk_size];
    let mut last_percent = 0u8;

    loop {
        if events.is_closed() {
            tracing::debug!(read = bytes.len(), "download abandoned by its decoder");
            return;
        }
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                bytes.extend_from_slice(&chunk[..n]);
                if let Some(total) = total.filter(|t| *t > 0) {
                    let percent = ((bytes.len() as u64 * 100) / total).min(100) as u8;
                    if percent > last_percent {
                        last_percent = percent;
                        events.progress(percent);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                events.fail(ImagingError::Io(e));
                return;
            }
        }
    }

    if last_percent < 100 {
        events.progress(100);
    }
    tracing::debug!(bytes = bytes.len(), "download finished");
    events.complete(bytes);
}

#[cfg(feature = "http")]
fn fetch_http(
    uri: Url,
    cache_policy: DownloadCachePolicy,
    user_agent: String,
    chunk_size: usize,
    events: DownloadSender,
) {
    std::thread::spawn(move || {
        let client = match reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                events.fail(ImagingError::Network(e.to_string()));
                return;
            }
        };

        let mut request = client.get(uri.as_str());
        if cache_policy == DownloadCachePolicy::NoCache {
            request = request
                .header(reqwest::header::CACHE_CONTROL, "no-cache")
                .header(reqwest::header::PRAGMA, "no-cache");
        }

        tracing::info!(uri = %uri, "downloading image");
        match request.send().and_then(|response| response.error_for_status()) {
            Ok(response) => {
                let total = response.content_length();
                drain(response, total, chunk_size, &events);
            }
            Err(e) => {
                tracing::warn!(uri = %uri, "download failed: {}", e);
                events.fail(ImagingError::Network(e.to_string()));
            }
        }
    });
}

#[cfg(not(feature = "http"))]
fn fetch_http(
    uri: Url,
    _cache_policy: DownloadCachePolicy,
    _user_agent: String,
    _chunk_size: usize,
    events: DownloadSender,
) {
    events.fail(ImagingError::Network(format!(
        "{uri}: built without HTTP support"
    )));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_drain_reports_progress_then_completes() {
        let (sender, mut rx) = download_channel();
        drain(Cursor::new(vec![7u8; 10]), Some(10), 4, &sender);

        let mut progress = Vec::new();
        let mut completed = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                DownloadEvent::Progress(p) => progress.push(p),
                DownloadEvent::Completed(bytes) => completed = Some(bytes),
                DownloadEvent::Failed(e) => panic!("unexpected failure: {e}"),
            }
        }
        assert_eq!(progress, vec![40, 80, 100]);
        assert_eq!(completed.as_deref(), Some(&[7u8; 10][..]));
    }

    #[test]
    fn test_drain_stops_when_receiver_dropped() {
        let (sender, rx) = download_channel();
        drop(rx);
        drain(Cursor::new(vec![0u8; 10]), None, 2, &sender);
        assert!(sender.is_closed());
    }

    #[test]
    fn test_unsupported_scheme_fails() {
        let (sender, mut rx) = download_channel();
        let uri = Url::parse("file:///tmp/x.png").unwrap();
        DefaultDownloader::new(1024, "test").begin_download(
            DownloadRequest::for_uri(uri, DownloadCachePolicy::Default),
            sender,
        );
        assert!(matches!(
            rx.try_recv(),
            Ok(DownloadEvent::Failed(ImagingError::Network(_)))
        ));
    }

    #[test]
    fn test_streams_drain_off_thread() {
        let (sender, mut rx) = download_channel();
        DefaultDownloader::new(3, "test").begin_download(
            DownloadRequest::for_stream(Box::new(Cursor::new(vec![1u8, 2, 3, 4]))),
            sender,
        );

        loop {
            match rx.blocking_recv() {
                Some(DownloadEvent::Completed(bytes)) => {
                    assert_eq!(&bytes[..], &[1, 2, 3, 4]);
                    break;
                }
                Some(DownloadEvent::Progress(_)) => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }
}
