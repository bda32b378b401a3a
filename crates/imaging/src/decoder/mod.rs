//! Container decoders, the weak decoder cache and late-bound (downloading) decoders.

mod cache;
mod context;
mod late_bound;

pub use cache::DecoderCache;
pub(crate) use context::DecodeContext;

use crate::context::Imaging;
use crate::download::{DownloadCachePolicy, DownloadRequest};
use crate::error::{ImagingError, ImagingResult};
use crate::events::DecoderEvent;
use crate::format::{CodecInfo, ContainerFormat};
use crate::frame::{FrameBinding, FrameSource};
use crate::identity::{BitmapSource, SourceIdentity};
use crate::native::{
    BackingStream, CacheHint, NativeError, NativeHandle, NativeResultExt, SourceStream,
};
use crate::sync::lock;
use imaging_types::{BitmapMetadata, CacheOption, ColorContext, CreateOptions, Palette};
use late_bound::LateBound;
use once_cell::sync::OnceCell;
use shared::{DownloadState, EventHub};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc::UnboundedReceiver;

/// Bytes handed to the engine's format probe.
const HEADER_PROBE_LEN: usize = 32;

struct ContainerDecoder {
    context: Arc<DecodeContext>,
    frames: OnceCell<Vec<FrameSource>>,
    /// Placeholder frames from a late-bound decoder, spliced in by index.
    adopted: Mutex<Vec<FrameSource>>,
    thumbnail: OnceCell<Option<FrameSource>>,
    preview: OnceCell<Option<FrameSource>>,
    metadata: OnceCell<Option<BitmapMetadata>>,
    palette: OnceCell<Option<Palette>>,
    color_contexts: OnceCell<Vec<ColorContext>>,
}

impl ContainerDecoder {
    fn new(context: Arc<DecodeContext>, adopted: Vec<FrameSource>) -> Self {
        Self {
            context,
            frames: OnceCell::new(),
            adopted: Mutex::new(adopted),
            thumbnail: OnceCell::new(),
            preview: OnceCell::new(),
            metadata: OnceCell::new(),
            palette: OnceCell::new(),
            color_contexts: OnceCell::new(),
        }
    }
}

enum DecoderKind {
    Container(ContainerDecoder),
    LateBound(LateBound),
}

struct DecoderInner {
    imaging: Imaging,
    identity: SourceIdentity,
    create_options: CreateOptions,
    cache_option: CacheOption,
    expected_format: Option<ContainerFormat>,
    /// Frame list captured by `seal`; served from here afterwards.
    sealed: OnceCell<Vec<FrameSource>>,
    events: EventHub<DecoderEvent>,
    kind: DecoderKind,
}

/// A decoded (or downloading) image container.
///
/// Clones share one decoder. Decoders created from a URI are shared through the
/// context's [`DecoderCache`] for as long as some clone is alive.
#[derive(Clone)]
pub struct Decoder {
    inner: Arc<DecoderInner>,
}

/// Non-owning reference to a [`Decoder`].
#[derive(Clone, Default)]
pub struct WeakDecoder {
    inner: Weak<DecoderInner>,
}

impl WeakDecoder {
    pub fn upgrade(&self) -> Option<Decoder> {
        self.inner.upgrade().map(|inner| Decoder { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl fmt::Debug for WeakDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakDecoder")
            .field("alive", &self.is_alive())
            .finish()
    }
}

struct Settings {
    create_options: CreateOptions,
    cache_option: CacheOption,
    expected_format: Option<ContainerFormat>,
}

impl Decoder {
    /// Opens `source` through the process-wide [`Imaging`] context.
    pub fn create(
        source: impl Into<BitmapSource>,
        create_options: CreateOptions,
        cache_option: CacheOption,
    ) -> ImagingResult<Decoder> {
        Self::create_in(Imaging::global(), source, create_options, cache_option)
    }

    pub fn create_in(
        imaging: &Imaging,
        source: impl Into<BitmapSource>,
        create_options: CreateOptions,
        cache_option: CacheOption,
    ) -> ImagingResult<Decoder> {
        Self::create_with(imaging, source.into(), create_options, cache_option, None)
    }

    /// Like [`Decoder::create`], but fails with [`ImagingError::FormatMismatch`] unless
    /// the content is `format`.
    pub fn create_for_format(
        source: impl Into<BitmapSource>,
        format: ContainerFormat,
        create_options: CreateOptions,
        cache_option: CacheOption,
    ) -> ImagingResult<Decoder> {
        Self::create_for_format_in(Imaging::global(), source, format, create_options, cache_option)
    }

    pub fn create_for_format_in(
        imaging: &Imaging,
        source: impl Into<BitmapSource>,
        format: ContainerFormat,
        create_options: CreateOptions,
        cache_option: CacheOption,
    ) -> ImagingResult<Decoder> {
        Self::create_with(imaging, source.into(), create_options, cache_option, Some(format))
    }

    fn create_with(
        imaging: &Imaging,
        source: BitmapSource,
        create_options: CreateOptions,
        cache_option: CacheOption,
        expected_format: Option<ContainerFormat>,
    ) -> ImagingResult<Decoder> {
        let config = imaging.config();
        let settings = Settings {
            create_options: create_options | config.default_create_options,
            cache_option: config.resolve_cache_option(cache_option),
            expected_format,
        };

        match source {
            BitmapSource::Uri(uri) => {
                Self::from_identity(imaging, SourceIdentity::from_uri(&uri)?, settings)
            }
            BitmapSource::Path(path) => {
                Self::from_identity(imaging, SourceIdentity::from_path(&path)?, settings)
            }
            BitmapSource::Stream(SourceStream::Seekable(reader)) => {
                let identity = SourceIdentity::next_stream();
                let stream = BackingStream::from_boxed(reader, identity.to_string());
                Self::open_container(imaging, identity, stream, &settings, Vec::new())
            }
            BitmapSource::Stream(SourceStream::NonSeekable(reader)) => Ok(Self::late_bound(
                imaging,
                SourceIdentity::next_stream(),
                DownloadRequest::for_stream(reader),
                settings,
            )),
            BitmapSource::Bytes(bytes) => {
                let identity = SourceIdentity::next_stream();
                let stream = BackingStream::from_bytes(bytes, identity.to_string());
                Self::open_container(imaging, identity, stream, &settings, Vec::new())
            }
        }
    }

    fn from_identity(
        imaging: &Imaging,
        identity: SourceIdentity,
        settings: Settings,
    ) -> ImagingResult<Decoder> {
        let cache = imaging.decoder_cache();
        let use_cache = imaging.config().decoder_cache_enabled;

        if settings.create_options.contains(CreateOptions::IGNORE_IMAGE_CACHE) {
            cache.invalidate(&identity);
        } else if use_cache {
            if let Some(decoder) = cache.lookup(&identity) {
                if decoder.matches(&settings) {
                    return Ok(decoder);
                }
                tracing::debug!(%identity, "cached decoder was opened with other options");
            }
        }

        let decoder = if identity.is_network() {
            let Some(uri) = identity.url().cloned() else {
                return Err(ImagingError::InvalidArgument(format!(
                    "{identity} has no URI to download"
                )));
            };
            let policy = if settings.create_options.contains(CreateOptions::IGNORE_IMAGE_CACHE) {
                DownloadCachePolicy::NoCache
            } else {
                DownloadCachePolicy::Default
            };
            Self::late_bound(
                imaging,
                identity.clone(),
                DownloadRequest::for_uri(uri, policy),
                settings,
            )
        } else {
            let path = identity.file_path().ok_or_else(|| {
                ImagingError::InvalidArgument(format!("{identity} is not a local file"))
            })?;
            let stream = BackingStream::open_file(&path)?;
            Self::open_container(imaging, identity.clone(), stream, &settings, Vec::new())?
        };

        if use_cache {
            cache.insert(identity, &decoder);
        }
        Ok(decoder)
    }

    fn matches(&self, settings: &Settings) -> bool {
        let ours = self
            .inner
            .create_options
            .without(CreateOptions::IGNORE_IMAGE_CACHE);
        let theirs = settings
            .create_options
            .without(CreateOptions::IGNORE_IMAGE_CACHE);
        ours == theirs
            && self.inner.cache_option == settings.cache_option
            && self.inner.expected_format == settings.expected_format
    }

    fn with_kind(
        imaging: &Imaging,
        identity: SourceIdentity,
        settings: &Settings,
        kind: DecoderKind,
    ) -> Decoder {
        Decoder {
            inner: Arc::new(DecoderInner {
                imaging: imaging.clone(),
                identity,
                create_options: settings.create_options,
                cache_option: settings.cache_option,
                expected_format: settings.expected_format,
                sealed: OnceCell::new(),
                events: EventHub::new(),
                kind,
            }),
        }
    }

    fn late_bound(
        imaging: &Imaging,
        identity: SourceIdentity,
        request: DownloadRequest,
        settings: Settings,
    ) -> Decoder {
        tracing::info!(%identity, "starting download for late-bound decoder");
        let kind = DecoderKind::LateBound(LateBound::start(imaging, request));
        Self::with_kind(imaging, identity, &settings, kind)
    }

    /// Probes `stream`, opens it with the engine and, for on-load caching, builds every
    /// frame before returning.
    fn open_container(
        imaging: &Imaging,
        identity: SourceIdentity,
        stream: BackingStream,
        settings: &Settings,
        adopted: Vec<FrameSource>,
    ) -> ImagingResult<Decoder> {
        let engine = imaging.engine();
        let header = stream.read_header(HEADER_PROBE_LEN)?;
        let format = engine.probe(&header);

        if let Some(expected) = settings.expected_format {
            if expected != format {
                return Err(ImagingError::FormatMismatch {
                    expected,
                    found: format,
                });
            }
        }

        let container = match engine.open(&stream, format, CacheHint::from(settings.cache_option)) {
            Ok(container) => container,
            Err(NativeError::Unsupported(_)) if format == ContainerFormat::Unknown => {
                return Err(ImagingError::UnknownFormat);
            }
            Err(err) => return Err(err.into()),
        };
        tracing::debug!(%identity, %format, cache = %settings.cache_option, "opened container");

        let context = Arc::new(DecodeContext::new(imaging.clone(), format, container, stream));
        let decoder = Self::with_kind(
            imaging,
            identity,
            settings,
            DecoderKind::Container(ContainerDecoder::new(context, adopted)),
        );

        if settings.cache_option.is_on_load()
            && !settings.create_options.contains(CreateOptions::DELAY_CREATION)
        {
            decoder.frames()?;
        }
        Ok(decoder)
    }

    pub fn downgrade(&self) -> WeakDecoder {
        WeakDecoder {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn identity(&self) -> &SourceIdentity {
        &self.inner.identity
    }

    pub fn create_options(&self) -> CreateOptions {
        self.inner.create_options
    }

    pub fn cache_option(&self) -> CacheOption {
        self.inner.cache_option
    }

    pub fn ptr_eq(&self, other: &Decoder) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_late_bound(&self) -> bool {
        matches!(self.inner.kind, DecoderKind::LateBound(_))
    }

    /// Every frame in the container, built on first access. Frames after the first
    /// are delayed unless the decoder caches on load.
    pub fn frames(&self) -> ImagingResult<Vec<FrameSource>> {
        if let Some(sealed) = self.inner.sealed.get() {
            return Ok(sealed.clone());
        }
        match &self.inner.kind {
            DecoderKind::Container(container) => {
                Ok(self.container_frames(container)?.to_vec())
            }
            DecoderKind::LateBound(late) => late.frames(self),
        }
    }

    pub fn frame(&self, index: usize) -> ImagingResult<FrameSource> {
        let frames = self.frames()?;
        let count = frames.len();
        frames.into_iter().nth(index).ok_or_else(|| {
            ImagingError::InvalidArgument(format!("frame {index} out of range (count {count})"))
        })
    }

    pub fn frame_count(&self) -> ImagingResult<usize> {
        Ok(self.frames()?.len())
    }

    fn container_frames<'a>(
        &self,
        container: &'a ContainerDecoder,
    ) -> ImagingResult<&'a [FrameSource]> {
        container
            .frames
            .get_or_try_init(|| self.build_frames(container))
            .map(Vec::as_slice)
    }

    fn build_frames(&self, container: &ContainerDecoder) -> ImagingResult<Vec<FrameSource>> {
        let inner = &self.inner;
        let context = &container.context;
        let count = context.with_container(|engine, handle| engine.frame_count(handle))?;
        tracing::debug!(identity = %inner.identity, count, "building frames");

        let mut adopted = lock(&container.adopted);
        let mut frames = Vec::with_capacity(count as usize);
        for index in 0..count {
            let mut create_options = inner.create_options;
            if index > 0 && !inner.cache_option.is_on_load() {
                create_options.insert(CreateOptions::DELAY_CREATION);
            }
            let binding = FrameBinding::Bound {
                context: context.clone(),
                decoder: self.downgrade(),
                index,
            };

            let frame = match adopted.iter().position(|frame| frame.index() == Some(index)) {
                Some(position) => {
                    let frame = adopted.remove(position);
                    frame.rebind(binding, create_options, inner.cache_option);
                    frame
                }
                None => FrameSource::new(
                    inner.imaging.clone(),
                    binding,
                    create_options,
                    inner.cache_option,
                ),
            };
            frames.push(frame);
        }
        adopted.clear();
        drop(adopted);

        for frame in &frames {
            if !frame.create_options().contains(CreateOptions::DELAY_CREATION) {
                frame.finalize()?;
            }
        }

        if inner.cache_option.is_on_load()
            && !inner.create_options.contains(CreateOptions::DELAY_CREATION)
            && context.close_stream()
        {
            tracing::debug!(identity = %inner.identity, "closed backing stream after loading frames");
        }
        Ok(frames)
    }

    pub fn thumbnail(&self) -> ImagingResult<Option<FrameSource>> {
        match &self.inner.kind {
            DecoderKind::LateBound(late) => match late.real(self)? {
                Some(real) => real.thumbnail(),
                None => Ok(None),
            },
            DecoderKind::Container(container) => {
                if !container.context.format().capabilities().container_thumbnail {
                    return Ok(None);
                }
                fetch_once(&container.thumbnail, || {
                    let handle = container
                        .context
                        .with_container(|engine, handle| engine.get_thumbnail(handle))
                        .present()?;
                    Ok(handle.map(|handle| self.detached_frame(container, handle)))
                })
            }
        }
    }

    pub fn preview(&self) -> ImagingResult<Option<FrameSource>> {
        match &self.inner.kind {
            DecoderKind::LateBound(late) => match late.real(self)? {
                Some(real) => real.preview(),
                None => Ok(None),
            },
            DecoderKind::Container(container) => {
                if !container.context.format().capabilities().preview {
                    return Ok(None);
                }
                fetch_once(&container.preview, || {
                    let handle = container
                        .context
                        .with_container(|engine, handle| engine.get_preview(handle))
                        .present()?;
                    Ok(handle.map(|handle| self.detached_frame(container, handle)))
                })
            }
        }
    }

    pub fn metadata(&self) -> ImagingResult<Option<BitmapMetadata>> {
        match &self.inner.kind {
            DecoderKind::LateBound(late) => match late.real(self)? {
                Some(real) => real.metadata(),
                None => Ok(None),
            },
            DecoderKind::Container(container) => {
                if !container.context.format().capabilities().container_metadata {
                    return Ok(None);
                }
                fetch_once(&container.metadata, || {
                    Ok(container
                        .context
                        .with_container(|engine, handle| engine.get_metadata(handle))
                        .present()?)
                })
            }
        }
    }

    pub fn palette(&self) -> ImagingResult<Option<Palette>> {
        match &self.inner.kind {
            DecoderKind::LateBound(late) => match late.real(self)? {
                Some(real) => real.palette(),
                None => Ok(None),
            },
            DecoderKind::Container(container) => {
                if !container.context.format().capabilities().container_palette {
                    return Ok(None);
                }
                fetch_once(&container.palette, || {
                    Ok(container
                        .context
                        .with_container(|engine, handle| engine.get_palette(handle))
                        .present()?)
                })
            }
        }
    }

    pub fn color_contexts(&self) -> ImagingResult<Vec<ColorContext>> {
        match &self.inner.kind {
            DecoderKind::LateBound(late) => match late.real(self)? {
                Some(real) => real.color_contexts(),
                None => Ok(Vec::new()),
            },
            DecoderKind::Container(container) => {
                if !container
                    .context
                    .format()
                    .capabilities()
                    .container_color_contexts
                {
                    return Ok(Vec::new());
                }
                fetch_once(&container.color_contexts, || {
                    Ok(container
                        .context
                        .with_container(|engine, handle| engine.get_color_contexts(handle))
                        .present()?
                        .unwrap_or_default())
                })
            }
        }
    }

    /// The container format, or `None` while downloading or after a failed download.
    pub fn format(&self) -> Option<ContainerFormat> {
        match &self.inner.kind {
            DecoderKind::Container(container) => Some(container.context.format()),
            DecoderKind::LateBound(late) => late.real(self).ok().flatten()?.format(),
        }
    }

    pub fn codec_info(&self) -> Option<&'static CodecInfo> {
        self.format().map(ContainerFormat::codec_info)
    }

    fn detached_frame(
        &self,
        container: &ContainerDecoder,
        handle: NativeHandle,
    ) -> FrameSource {
        FrameSource::detached(
            &container.context,
            handle,
            self.inner.create_options,
            self.inner.cache_option,
        )
    }

    /// True while a late-bound decoder is still waiting for its bytes.
    pub fn is_downloading(&self) -> bool {
        self.download_state().is_downloading()
    }

    pub fn download_state(&self) -> DownloadState {
        match &self.inner.kind {
            DecoderKind::Container(_) => DownloadState::Completed,
            DecoderKind::LateBound(late) => {
                if let Err(err) = late.resolve(self) {
                    tracing::debug!("download state read without pumping events: {}", err);
                }
                late.state()
            }
        }
    }

    /// The error that ended a failed download or its decode.
    pub fn download_error(&self) -> Option<Arc<ImagingError>> {
        match &self.inner.kind {
            DecoderKind::Container(_) => None,
            DecoderKind::LateBound(late) => late.failure(),
        }
    }

    /// Blocks until the download finishes and returns the terminal state. Returns at
    /// once for decoders that never downloaded.
    pub fn wait_for_download(&self) -> ImagingResult<DownloadState> {
        match &self.inner.kind {
            DecoderKind::Container(_) => Ok(DownloadState::Completed),
            DecoderKind::LateBound(late) => late.wait(self),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<DecoderEvent> {
        self.inner.events.subscribe()
    }

    /// Fixes the frame list: later calls to [`Decoder::frames`] return exactly the
    /// frames seen here. Fails while the content is still downloading.
    pub fn seal(&self) -> ImagingResult<()> {
        if self.is_downloading() {
            return Err(ImagingError::InvalidOperation(
                "cannot seal a decoder while it is downloading".into(),
            ));
        }
        let frames = self.frames()?;
        let _ = self.inner.sealed.set(frames);
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.sealed.get().is_some()
    }

    /// Lets a late-bound decoder turn downloaded bytes into its real decoder.
    pub(crate) fn resolve_late_bound(&self) -> ImagingResult<()> {
        match &self.inner.kind {
            DecoderKind::Container(_) => Ok(()),
            DecoderKind::LateBound(late) => late.resolve(self),
        }
    }
}

fn fetch_once<T: Clone>(
    cell: &OnceCell<T>,
    init: impl FnOnce() -> ImagingResult<T>,
) -> ImagingResult<T> {
    cell.get_or_try_init(init).cloned()
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoder")
            .field("identity", &self.inner.identity)
            .field("create_options", &self.inner.create_options)
            .field("cache_option", &self.inner.cache_option)
            .field("late_bound", &self.is_late_bound())
            .finish()
    }
}
