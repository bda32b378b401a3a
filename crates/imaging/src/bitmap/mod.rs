//! `BitmapImage`: a render-ready pixel source built from a frame or raw pixels.

pub(crate) mod pipeline;

use crate::compositor::{CompositorAdapter, RenderResource};
use crate::context::Imaging;
use crate::decoder::Decoder;
use crate::engine::SourceInfo;
use crate::error::{ImagingError, ImagingResult};
use crate::events::BitmapEvent;
use crate::frame::FrameSource;
use crate::native::NativeHandle;
use crate::sync::{GuardedInit, SyncObject, lock, lock_sync, new_sync_object};
use imaging_types::{CacheOption, CreateOptions, Palette, PixelBuffer, PixelFormat, PixelRect};
use pipeline::{MaterializeRequest, Materialized};
use shared::EventHub;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc::UnboundedReceiver;

/// What a [`BitmapImage`] draws its pixels from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Frame(FrameSource),
    Pixels(PixelBuffer),
    /// Decoded through a [`Decoder`] on end-init; the image shows frame 0.
    Uri(String),
}

impl From<FrameSource> for ImageSource {
    fn from(frame: FrameSource) -> Self {
        ImageSource::Frame(frame)
    }
}

impl From<PixelBuffer> for ImageSource {
    fn from(pixels: PixelBuffer) -> Self {
        ImageSource::Pixels(pixels)
    }
}

impl From<&str> for ImageSource {
    fn from(uri: &str) -> Self {
        ImageSource::Uri(uri.to_string())
    }
}

impl From<String> for ImageSource {
    fn from(uri: String) -> Self {
        ImageSource::Uri(uri)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapPhase {
    Uninitialized,
    Initializing,
    /// Initialized with delayed creation; materializes on first read.
    DelayedPending,
    Finalized,
}

#[derive(Debug, Clone)]
struct BitmapProps {
    source: Option<ImageSource>,
    create_options: CreateOptions,
    cache_option: CacheOption,
    source_rect: Option<PixelRect>,
    decode_width: Option<u32>,
    decode_height: Option<u32>,
}

impl Default for BitmapProps {
    fn default() -> Self {
        Self {
            source: None,
            create_options: CreateOptions::NONE,
            cache_option: CacheOption::Default,
            source_rect: None,
            decode_width: None,
            decode_height: None,
        }
    }
}

struct BitmapContent {
    render: NativeHandle,
    info: SourceInfo,
    palette: Option<Palette>,
    source_cached: bool,
    sync: SyncObject,
    /// Built from a placeholder frame; rebuilt once that frame becomes real.
    from_placeholder: bool,
}

struct BitmapInner {
    imaging: Imaging,
    phase: Mutex<BitmapPhase>,
    props: RwLock<BitmapProps>,
    content: GuardedInit<Arc<BitmapContent>>,
    events: EventHub<BitmapEvent>,
    adapters: Mutex<Vec<Arc<dyn CompositorAdapter>>>,
    version: AtomicU64,
}

/// A bitmap that materializes, at most once per content version, into an immutable
/// render-compatible buffer.
///
/// Configure it between [`begin_init`](BitmapImage::begin_init) and
/// [`end_init`](BitmapImage::end_init), or use one of the `create`/`from_*`
/// constructors. Cloning shares the image.
#[derive(Clone)]
pub struct BitmapImage {
    inner: Arc<BitmapInner>,
}

impl Default for BitmapImage {
    fn default() -> Self {
        Self::new()
    }
}

impl BitmapImage {
    pub fn new() -> Self {
        Self::with_imaging(Imaging::global())
    }

    pub fn with_imaging(imaging: &Imaging) -> Self {
        Self {
            inner: Arc::new(BitmapInner {
                imaging: imaging.clone(),
                phase: Mutex::new(BitmapPhase::Uninitialized),
                props: RwLock::new(BitmapProps::default()),
                content: GuardedInit::new(),
                events: EventHub::new(),
                adapters: Mutex::new(Vec::new()),
                version: AtomicU64::new(0),
            }),
        }
    }

    pub fn create(
        source: impl Into<ImageSource>,
        create_options: CreateOptions,
        cache_option: CacheOption,
    ) -> ImagingResult<Self> {
        Self::create_in(Imaging::global(), source, create_options, cache_option)
    }

    pub fn create_in(
        imaging: &Imaging,
        source: impl Into<ImageSource>,
        create_options: CreateOptions,
        cache_option: CacheOption,
    ) -> ImagingResult<Self> {
        let image = Self::with_imaging(imaging);
        image.begin_init()?;
        image.set_source(source)?;
        image.set_create_options(create_options)?;
        image.set_cache_option(cache_option)?;
        image.end_init()?;
        Ok(image)
    }

    pub fn from_pixels(
        pixels: PixelBuffer,
        create_options: CreateOptions,
        cache_option: CacheOption,
    ) -> ImagingResult<Self> {
        Self::create(pixels, create_options, cache_option)
    }

    /// Wraps `frame` in the frame's own context.
    pub fn from_frame(
        frame: FrameSource,
        create_options: CreateOptions,
        cache_option: CacheOption,
    ) -> ImagingResult<Self> {
        let imaging = frame.imaging().clone();
        Self::create_in(&imaging, frame, create_options, cache_option)
    }

    pub fn from_uri(
        uri: &str,
        create_options: CreateOptions,
        cache_option: CacheOption,
    ) -> ImagingResult<Self> {
        Self::create(uri, create_options, cache_option)
    }

    pub fn phase(&self) -> BitmapPhase {
        *lock(&self.inner.phase)
    }

    pub fn begin_init(&self) -> ImagingResult<()> {
        let mut phase = lock(&self.inner.phase);
        if *phase != BitmapPhase::Uninitialized {
            return Err(ImagingError::InvalidOperation(
                "begin_init called more than once".into(),
            ));
        }
        *phase = BitmapPhase::Initializing;
        Ok(())
    }

    fn update_props(&self, update: impl FnOnce(&mut BitmapProps)) -> ImagingResult<()> {
        if self.phase() != BitmapPhase::Initializing {
            return Err(ImagingError::InvalidOperation(
                "properties can only be set between begin_init and end_init".into(),
            ));
        }
        update(
            &mut self
                .inner
                .props
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        Ok(())
    }

    fn props(&self) -> BitmapProps {
        self.inner
            .props
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_source(&self, source: impl Into<ImageSource>) -> ImagingResult<()> {
        let source = source.into();
        self.update_props(|props| props.source = Some(source))
    }

    pub fn set_create_options(&self, create_options: CreateOptions) -> ImagingResult<()> {
        self.update_props(|props| props.create_options = create_options)
    }

    pub fn set_cache_option(&self, cache_option: CacheOption) -> ImagingResult<()> {
        self.update_props(|props| props.cache_option = cache_option)
    }

    pub fn set_source_rect(&self, rect: PixelRect) -> ImagingResult<()> {
        self.update_props(|props| props.source_rect = Some(rect).filter(|r| !r.is_empty()))
    }

    pub fn set_decode_pixel_width(&self, width: u32) -> ImagingResult<()> {
        self.update_props(|props| props.decode_width = Some(width).filter(|w| *w > 0))
    }

    pub fn set_decode_pixel_height(&self, height: u32) -> ImagingResult<()> {
        self.update_props(|props| props.decode_height = Some(height).filter(|h| *h > 0))
    }

    /// Validates the configuration, resolves a URI source to its first frame and
    /// either materializes now or, with delayed creation, on first read.
    pub fn end_init(&self) -> ImagingResult<()> {
        if self.phase() != BitmapPhase::Initializing {
            return Err(ImagingError::InvalidOperation(
                "end_init called without begin_init".into(),
            ));
        }

        let props = self.props();
        let source = match props.source {
            None => {
                return Err(ImagingError::InvalidOperation(
                    "a bitmap image needs a source".into(),
                ));
            }
            Some(ImageSource::Pixels(pixels)) => {
                pixels.validate().map_err(ImagingError::InvalidArgument)?;
                ImageSource::Pixels(pixels)
            }
            Some(ImageSource::Uri(uri)) => {
                let decoder = Decoder::create_in(
                    &self.inner.imaging,
                    uri.as_str(),
                    props.create_options,
                    props.cache_option,
                )?;
                ImageSource::Frame(decoder.frame(0)?)
            }
            Some(frame @ ImageSource::Frame(_)) => frame,
        };
        self.inner
            .props
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .source = Some(source);

        *lock(&self.inner.phase) = BitmapPhase::DelayedPending;
        if props.create_options.contains(CreateOptions::DELAY_CREATION) {
            return Ok(());
        }
        self.content().map(|_| ())
    }

    /// Materializes the image if it has not been yet. Concurrent callers wait for
    /// the one thread doing the work.
    pub fn finalize(&self) -> ImagingResult<()> {
        self.content().map(|_| ())
    }

    fn content(&self) -> ImagingResult<Arc<BitmapContent>> {
        match self.phase() {
            BitmapPhase::Uninitialized | BitmapPhase::Initializing => {
                return Err(ImagingError::InvalidOperation(
                    "bitmap image is not initialized".into(),
                ));
            }
            BitmapPhase::DelayedPending | BitmapPhase::Finalized => {}
        }

        let content = self.inner.content.get_or_try_init(|| self.materialize())?;
        if content.from_placeholder && self.source_frame_rebound() {
            let invalidated = self.invalidate();
            let rebuilt = self.content()?;
            if invalidated && !lock(&self.inner.adapters).is_empty() {
                self.notify_adapters()?;
            }
            return Ok(rebuilt);
        }
        *lock(&self.inner.phase) = BitmapPhase::Finalized;
        Ok(content)
    }

    fn source_frame_rebound(&self) -> bool {
        let Some(ImageSource::Frame(frame)) = self.props().source else {
            return false;
        };
        // Pumps a late-bound owner so a finished download is noticed.
        if let Err(err) = frame.finalize() {
            tracing::debug!("source frame not ready: {}", err);
        }
        !frame.is_placeholder()
    }

    fn materialize(&self) -> ImagingResult<Arc<BitmapContent>> {
        let props = self.props();
        let engine = self.inner.imaging.engine();
        let cache_option = self.inner.imaging.config().resolve_cache_option(props.cache_option);
        let mut request = MaterializeRequest::new(props.create_options, cache_option);
        request.source_rect = props.source_rect;
        request.decode_width = props.decode_width;
        request.decode_height = props.decode_height;
        tracing::debug!(create_options = %props.create_options, cache = %props.cache_option, "finalizing bitmap image");

        let (source, sync, from_placeholder) = match &props.source {
            Some(ImageSource::Pixels(pixels)) => {
                request.input_cached = true;
                (engine.create_bitmap_from_memory(pixels)?, new_sync_object(), false)
            }
            Some(ImageSource::Frame(frame)) => {
                let frame_content = frame.render_content()?;
                if let Some(failure) = &frame_content.failure {
                    self.inner
                        .events
                        .emit(BitmapEvent::DecodeFailed(failure.clone()));
                }
                request.input_cached = frame_content.source_cached;
                (
                    frame_content.render.add_ref(),
                    frame_content.sync.clone(),
                    frame.is_placeholder(),
                )
            }
            Some(ImageSource::Uri(_)) | None => {
                return Err(ImagingError::InvalidOperation(
                    "bitmap image source was not resolved".into(),
                ));
            }
        };

        let outcome = {
            let _guard = lock_sync(&sync);
            pipeline::materialize(engine, &source, &request)
        };
        let materialized = match outcome {
            Ok(materialized) => materialized,
            Err(err) if err.is_recoverable() => {
                tracing::warn!("bitmap image failed to materialize, using a placeholder: {}", err);
                self.inner
                    .events
                    .emit(BitmapEvent::DecodeFailed(Arc::new(err)));
                pipeline::placeholder(engine)?
            }
            Err(err) => return Err(err),
        };
        Ok(Arc::new(content_from(materialized, sync, from_placeholder)))
    }

    /// Drops the materialized content so the next read rebuilds it.
    fn invalidate(&self) -> bool {
        if self.inner.content.reset().is_none() {
            return false;
        }
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        *lock(&self.inner.phase) = BitmapPhase::DelayedPending;
        self.inner.events.emit(BitmapEvent::ContentInvalidated);
        tracing::debug!("bitmap image content invalidated");
        true
    }

    /// Replaces the pixels of a pixel-backed image. Attached compositors receive the
    /// rebuilt resource right away; otherwise it is rebuilt on the next read.
    pub fn replace_pixels(&self, pixels: PixelBuffer) -> ImagingResult<()> {
        match self.phase() {
            BitmapPhase::DelayedPending | BitmapPhase::Finalized => {}
            _ => {
                return Err(ImagingError::InvalidOperation(
                    "bitmap image is not initialized".into(),
                ));
            }
        }
        pixels.validate().map_err(ImagingError::InvalidArgument)?;
        {
            let mut props = self
                .inner
                .props
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if !matches!(props.source, Some(ImageSource::Pixels(_))) {
                return Err(ImagingError::InvalidOperation(
                    "only pixel-backed images can replace their content".into(),
                ));
            }
            props.source = Some(ImageSource::Pixels(pixels));
        }

        self.inner.content.reset();
        *lock(&self.inner.phase) = BitmapPhase::DelayedPending;
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        self.inner.events.emit(BitmapEvent::ContentInvalidated);

        if !lock(&self.inner.adapters).is_empty() {
            self.notify_adapters()?;
        }
        Ok(())
    }

    /// Registers `adapter` and hands it the current resource.
    pub fn attach_compositor(&self, adapter: Arc<dyn CompositorAdapter>) -> ImagingResult<()> {
        let resource = self.render_resource()?;
        adapter.update_resource(&resource);
        lock(&self.inner.adapters).push(adapter);
        Ok(())
    }

    fn notify_adapters(&self) -> ImagingResult<()> {
        let resource = self.render_resource()?;
        let adapters = lock(&self.inner.adapters).clone();
        for adapter in adapters {
            adapter.update_resource(&resource);
        }
        Ok(())
    }

    pub fn render_resource(&self) -> ImagingResult<RenderResource> {
        let content = self.content()?;
        Ok(RenderResource {
            handle: content.render.add_ref(),
            width: content.info.width,
            height: content.info.height,
            format: content.info.format,
            resolution: content.info.resolution,
            version: self.version(),
        })
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub fn pixel_width(&self) -> ImagingResult<u32> {
        Ok(self.content()?.info.width)
    }

    pub fn pixel_height(&self) -> ImagingResult<u32> {
        Ok(self.content()?.info.height)
    }

    pub fn format(&self) -> ImagingResult<PixelFormat> {
        Ok(self.content()?.info.format)
    }

    pub fn dpi_x(&self) -> ImagingResult<f64> {
        Ok(self.content()?.info.resolution.dpi_x)
    }

    pub fn dpi_y(&self) -> ImagingResult<f64> {
        Ok(self.content()?.info.resolution.dpi_y)
    }

    pub fn palette(&self) -> ImagingResult<Option<Palette>> {
        Ok(self.content()?.palette.clone())
    }

    /// Copies `rect` (the whole image when empty) into `buffer` starting at `offset`,
    /// `stride` bytes per row.
    pub fn copy_pixels(
        &self,
        rect: PixelRect,
        buffer: &mut [u8],
        stride: usize,
        offset: usize,
    ) -> ImagingResult<()> {
        let content = self.content()?;
        let result = pipeline::copy_pixels(
            self.inner.imaging.engine(),
            &content.render,
            &content.info,
            &content.sync,
            rect,
            buffer,
            stride,
            offset,
        );
        match result {
            Err(err) if err.is_recoverable() => self.recover_from_read(&content, err),
            other => other,
        }
    }

    /// Swaps undecodable lazy content for the placeholder. The caller's region has
    /// already been cleared.
    fn recover_from_read(&self, failed: &Arc<BitmapContent>, err: ImagingError) -> ImagingResult<()> {
        tracing::warn!("bitmap image pixel read failed, using a placeholder: {}", err);
        let placeholder = Arc::new(content_from(
            pipeline::placeholder(self.inner.imaging.engine())?,
            failed.sync.clone(),
            false,
        ));
        if !self
            .inner
            .content
            .replace_done(|current| Arc::ptr_eq(current, failed), placeholder)
        {
            return Ok(());
        }
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        self.inner
            .events
            .emit(BitmapEvent::DecodeFailed(Arc::new(err)));
        if !lock(&self.inner.adapters).is_empty() {
            self.notify_adapters()?;
        }
        Ok(())
    }

    pub fn is_source_cached(&self) -> bool {
        self.inner
            .content
            .get()
            .is_some_and(|content| content.source_cached)
    }

    pub fn is_creation_complete(&self) -> bool {
        self.inner.content.is_done()
    }

    /// Materializations performed so far, across content replacements.
    pub fn creation_count(&self) -> usize {
        self.inner.content.runs()
    }

    pub fn create_options(&self) -> CreateOptions {
        self.props().create_options
    }

    pub fn cache_option(&self) -> CacheOption {
        self.props().cache_option
    }

    /// The frame this image draws from, once a URI source has been resolved.
    pub fn source_frame(&self) -> Option<FrameSource> {
        match self.props().source {
            Some(ImageSource::Frame(frame)) => Some(frame),
            _ => None,
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<BitmapEvent> {
        self.inner.events.subscribe()
    }

    pub fn ptr_eq(&self, other: &BitmapImage) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn content_from(materialized: Materialized, sync: SyncObject, from_placeholder: bool) -> BitmapContent {
    BitmapContent {
        render: materialized.handle,
        info: materialized.info,
        palette: materialized.palette,
        source_cached: materialized.source_cached,
        sync,
        from_placeholder,
    }
}

impl fmt::Debug for BitmapImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapImage")
            .field("phase", &self.phase())
            .field("version", &self.version())
            .field("complete", &self.is_creation_complete())
            .finish()
    }
}
