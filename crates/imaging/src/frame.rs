use crate::bitmap::pipeline::{self, Materialized, MaterializeRequest};
use crate::context::Imaging;
use crate::decoder::{DecodeContext, Decoder, WeakDecoder};
use crate::engine::SourceInfo;
use crate::error::{ImagingError, ImagingResult};
use crate::events::BitmapEvent;
use crate::native::{NativeHandle, NativeResultExt};
use crate::sync::{GuardedInit, SyncObject, lock, lock_sync, new_sync_object};
use imaging_types::{
    BitmapMetadata, CacheOption, ColorContext, CreateOptions, Palette, PixelFormat, PixelRect,
    Resolution,
};
use once_cell::sync::OnceCell;
use shared::EventHub;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::mpsc::UnboundedReceiver;

pub(crate) enum FrameBinding {
    /// Stand-in handed out while a late-bound decoder downloads.
    Placeholder { decoder: WeakDecoder },
    Bound {
        context: Arc<DecodeContext>,
        decoder: WeakDecoder,
        index: u32,
    },
    /// Thumbnails and previews: a ready engine handle with no frame index.
    Detached {
        context: Arc<DecodeContext>,
        handle: NativeHandle,
    },
}

impl Clone for FrameBinding {
    fn clone(&self) -> Self {
        match self {
            FrameBinding::Placeholder { decoder } => FrameBinding::Placeholder {
                decoder: decoder.clone(),
            },
            FrameBinding::Bound {
                context,
                decoder,
                index,
            } => FrameBinding::Bound {
                context: context.clone(),
                decoder: decoder.clone(),
                index: *index,
            },
            FrameBinding::Detached { context, handle } => FrameBinding::Detached {
                context: context.clone(),
                handle: handle.add_ref(),
            },
        }
    }
}

/// Finalized state of a frame. Never mutated once published.
pub(crate) struct FrameContent {
    pub(crate) source: Option<NativeHandle>,
    pub(crate) render: NativeHandle,
    pub(crate) info: SourceInfo,
    pub(crate) palette: Option<Palette>,
    pub(crate) source_cached: bool,
    pub(crate) failure: Option<Arc<ImagingError>>,
    pub(crate) sync: SyncObject,
    /// Keeps the backing stream open for lazily decoded pixels.
    context: Option<Arc<DecodeContext>>,
}

#[derive(Debug, Clone, Copy)]
struct FrameSettings {
    create_options: CreateOptions,
    cache_option: CacheOption,
}

struct FrameInner {
    imaging: Imaging,
    binding: RwLock<FrameBinding>,
    settings: RwLock<FrameSettings>,
    content: GuardedInit<Arc<FrameContent>>,
    placeholder: OnceCell<Arc<FrameContent>>,
    thumbnail: OnceCell<Option<FrameSource>>,
    metadata: OnceCell<Option<BitmapMetadata>>,
    color_contexts: OnceCell<Vec<ColorContext>>,
    observers: Mutex<Vec<Weak<FrameInner>>>,
    events: EventHub<BitmapEvent>,
}

/// One decodable frame of a container.
///
/// Cloning shares the frame. Use [`FrameSource::duplicate`] for an independent copy
/// that still follows a downloading original.
#[derive(Clone)]
pub struct FrameSource {
    inner: Arc<FrameInner>,
}

impl FrameSource {
    pub(crate) fn new(
        imaging: Imaging,
        binding: FrameBinding,
        create_options: CreateOptions,
        cache_option: CacheOption,
    ) -> Self {
        Self {
            inner: Arc::new(FrameInner {
                imaging,
                binding: RwLock::new(binding),
                settings: RwLock::new(FrameSettings {
                    create_options,
                    cache_option,
                }),
                content: GuardedInit::new(),
                placeholder: OnceCell::new(),
                thumbnail: OnceCell::new(),
                metadata: OnceCell::new(),
                color_contexts: OnceCell::new(),
                observers: Mutex::new(Vec::new()),
                events: EventHub::new(),
            }),
        }
    }

    pub(crate) fn detached(
        context: &Arc<DecodeContext>,
        handle: NativeHandle,
        create_options: CreateOptions,
        cache_option: CacheOption,
    ) -> Self {
        Self::new(
            context.imaging().clone(),
            FrameBinding::Detached {
                context: context.clone(),
                handle,
            },
            create_options.without(CreateOptions::DELAY_CREATION),
            cache_option,
        )
    }

    fn binding(&self) -> FrameBinding {
        self.inner
            .binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn settings(&self) -> FrameSettings {
        *self
            .inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Binding after giving a downloading owner the chance to become real.
    fn resolved_binding(&self) -> ImagingResult<FrameBinding> {
        let binding = self.binding();
        if let FrameBinding::Placeholder { decoder } = &binding {
            if let Some(decoder) = decoder.upgrade() {
                decoder.resolve_late_bound()?;
                return Ok(self.binding());
            }
        }
        Ok(binding)
    }

    /// Moves a placeholder onto the real decoder, then does the same for every live
    /// duplicate taken while it was a placeholder.
    pub(crate) fn rebind(
        &self,
        binding: FrameBinding,
        create_options: CreateOptions,
        cache_option: CacheOption,
    ) {
        *self
            .inner
            .binding
            .write()
            .unwrap_or_else(PoisonError::into_inner) = binding.clone();
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = FrameSettings {
            create_options,
            cache_option,
        };
        self.inner.content.reset();
        self.inner.events.emit(BitmapEvent::Rebound);

        let observers = std::mem::take(&mut *lock(&self.inner.observers));
        for observer in observers {
            if let Some(inner) = observer.upgrade() {
                FrameSource { inner }.rebind(binding.clone(), create_options, cache_option);
            }
        }
    }

    pub(crate) fn imaging(&self) -> &Imaging {
        &self.inner.imaging
    }

    pub fn index(&self) -> Option<u32> {
        match self.binding() {
            FrameBinding::Bound { index, .. } => Some(index),
            FrameBinding::Placeholder { .. } => Some(0),
            FrameBinding::Detached { .. } => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.binding(), FrameBinding::Placeholder { .. })
    }

    /// The owning decoder, if it is still alive.
    pub fn decoder(&self) -> Option<Decoder> {
        match self.binding() {
            FrameBinding::Placeholder { decoder } | FrameBinding::Bound { decoder, .. } => {
                decoder.upgrade()
            }
            FrameBinding::Detached { .. } => None,
        }
    }

    pub fn create_options(&self) -> CreateOptions {
        self.settings().create_options
    }

    pub fn cache_option(&self) -> CacheOption {
        self.settings().cache_option
    }

    pub fn is_creation_complete(&self) -> bool {
        self.inner.content.is_done()
    }

    pub fn is_source_cached(&self) -> bool {
        self.inner
            .content
            .get()
            .is_some_and(|content| content.source_cached)
    }

    /// Native creation runs performed so far. Stays at one once finalized.
    pub fn creation_count(&self) -> usize {
        self.inner.content.runs()
    }

    pub fn ptr_eq(&self, other: &FrameSource) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn subscribe(&self) -> UnboundedReceiver<BitmapEvent> {
        self.inner.events.subscribe()
    }

    /// Materializes the frame. Idempotent: concurrent callers wait for the first.
    pub fn finalize(&self) -> ImagingResult<()> {
        self.render_content().map(|_| ())
    }

    pub(crate) fn render_content(&self) -> ImagingResult<Arc<FrameContent>> {
        match self.resolved_binding()? {
            FrameBinding::Placeholder { .. } => self
                .inner
                .placeholder
                .get_or_try_init(|| {
                    let sync = new_sync_object();
                    Ok(Arc::new(content_from(
                        pipeline::placeholder(self.inner.imaging.engine())?,
                        None,
                        None,
                        sync,
                        None,
                    )))
                })
                .cloned(),
            FrameBinding::Bound { context, index, .. } => self
                .inner
                .content
                .get_or_try_init(|| self.materialize(&context, None, index)),
            FrameBinding::Detached { context, handle } => self
                .inner
                .content
                .get_or_try_init(|| self.materialize(&context, Some(&handle), 0)),
        }
    }

    fn materialize(
        &self,
        context: &Arc<DecodeContext>,
        detached: Option<&NativeHandle>,
        index: u32,
    ) -> ImagingResult<Arc<FrameContent>> {
        let settings = self.settings();
        let engine = context.engine();
        tracing::debug!(index, format = %context.format(), "finalizing frame");

        let _guard = lock_sync(context.sync());
        let source = match detached {
            Some(handle) => handle.add_ref(),
            None => engine.get_frame(context.container(), index)?,
        };
        let color_contexts = engine
            .get_color_contexts(&source)
            .present()?
            .unwrap_or_default();
        let _ = self.inner.color_contexts.set(color_contexts.clone());

        let request = MaterializeRequest {
            color_contexts: &color_contexts,
            ..MaterializeRequest::new(settings.create_options, settings.cache_option)
        };
        let outcome = pipeline::materialize(engine, &source, &request);

        match outcome {
            Ok(materialized) => Ok(Arc::new(content_from(
                materialized,
                Some(source),
                None,
                context.sync().clone(),
                Some(context.clone()),
            ))),
            Err(err) if err.is_recoverable() => {
                tracing::warn!(index, "frame decode failed, substituting a placeholder: {}", err);
                let failure = Arc::new(err);
                let content = content_from(
                    pipeline::placeholder(engine)?,
                    Some(source),
                    Some(failure.clone()),
                    context.sync().clone(),
                    Some(context.clone()),
                );
                self.inner.events.emit(BitmapEvent::DecodeFailed(failure));
                Ok(Arc::new(content))
            }
            Err(err) => Err(err),
        }
    }

    pub fn pixel_width(&self) -> ImagingResult<u32> {
        Ok(self.render_content()?.info.width)
    }

    pub fn pixel_height(&self) -> ImagingResult<u32> {
        Ok(self.render_content()?.info.height)
    }

    pub fn format(&self) -> ImagingResult<PixelFormat> {
        Ok(self.render_content()?.info.format)
    }

    pub fn resolution(&self) -> ImagingResult<Resolution> {
        Ok(self.render_content()?.info.resolution)
    }

    pub fn dpi_x(&self) -> ImagingResult<f64> {
        Ok(self.resolution()?.dpi_x)
    }

    pub fn dpi_y(&self) -> ImagingResult<f64> {
        Ok(self.resolution()?.dpi_y)
    }

    pub fn palette(&self) -> ImagingResult<Option<Palette>> {
        Ok(self.render_content()?.palette.clone())
    }

    /// The error that replaced this frame's pixels with a placeholder, if any.
    pub fn decode_failure(&self) -> Option<Arc<ImagingError>> {
        self.inner
            .content
            .get()
            .and_then(|content| content.failure.clone())
    }

    pub fn copy_pixels(
        &self,
        rect: PixelRect,
        buffer: &mut [u8],
        stride: usize,
        offset: usize,
    ) -> ImagingResult<()> {
        let content = self.render_content()?;
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

    /// Lazily decoded pixels turned out to be undecodable: publish the placeholder in
    /// place of `failed`, the same as a failure during finalize.
    fn recover_from_read(&self, failed: &Arc<FrameContent>, err: ImagingError) -> ImagingResult<()> {
        tracing::warn!(index = ?self.index(), "pixel read failed, substituting a placeholder: {}", err);
        let failure = Arc::new(err);
        let placeholder = Arc::new(content_from(
            pipeline::placeholder(self.inner.imaging.engine())?,
            failed.source.as_ref().map(NativeHandle::add_ref),
            Some(failure.clone()),
            failed.sync.clone(),
            failed.context.clone(),
        ));
        if self
            .inner
            .content
            .replace_done(|current| Arc::ptr_eq(current, failed), placeholder)
        {
            self.inner.events.emit(BitmapEvent::DecodeFailed(failure));
        }
        Ok(())
    }

    pub fn thumbnail(&self) -> ImagingResult<Option<FrameSource>> {
        let context = match self.resolved_binding()? {
            FrameBinding::Placeholder { .. } => return Ok(None),
            FrameBinding::Bound { context, .. } | FrameBinding::Detached { context, .. } => context,
        };
        if !context.format().capabilities().frame_thumbnail {
            return Ok(None);
        }

        let content = self.render_content()?;
        self.inner
            .thumbnail
            .get_or_try_init(|| {
                let Some(source) = &content.source else {
                    return Ok(None);
                };
                let handle = {
                    let _guard = lock_sync(&content.sync);
                    context.engine().get_thumbnail(source).present()?
                };
                let settings = self.settings();
                Ok(handle.map(|handle| {
                    FrameSource::detached(&context, handle, settings.create_options, settings.cache_option)
                }))
            })
            .cloned()
    }

    pub fn metadata(&self) -> ImagingResult<Option<BitmapMetadata>> {
        let context = match self.resolved_binding()? {
            FrameBinding::Placeholder { .. } => return Ok(None),
            FrameBinding::Bound { context, .. } | FrameBinding::Detached { context, .. } => context,
        };
        if !context.format().capabilities().frame_metadata {
            return Ok(None);
        }

        let content = self.render_content()?;
        self.inner
            .metadata
            .get_or_try_init(|| {
                let Some(source) = &content.source else {
                    return Ok(None);
                };
                let _guard = lock_sync(&content.sync);
                Ok::<_, ImagingError>(context.engine().get_metadata(source).present()?)
            })
            .cloned()
    }

    pub fn color_contexts(&self) -> ImagingResult<Vec<ColorContext>> {
        if matches!(self.resolved_binding()?, FrameBinding::Placeholder { .. }) {
            return Ok(Vec::new());
        }
        let content = self.render_content()?;
        if let Some(contexts) = self.inner.color_contexts.get() {
            return Ok(contexts.clone());
        }

        let fetched = match &content.source {
            Some(source) => {
                let _guard = lock_sync(&content.sync);
                self.inner
                    .imaging
                    .engine()
                    .get_color_contexts(source)
                    .present()?
                    .unwrap_or_default()
            }
            None => Vec::new(),
        };
        Ok(self.inner.color_contexts.get_or_init(|| fetched).clone())
    }

    /// Independent frame over the same source. A duplicate of a placeholder follows
    /// the original onto the real decoder once the download completes.
    pub fn duplicate(&self) -> FrameSource {
        let settings = self.settings();
        let binding = self.binding();
        let is_placeholder = matches!(binding, FrameBinding::Placeholder { .. });

        let copy = FrameSource::new(
            self.inner.imaging.clone(),
            binding,
            settings.create_options,
            settings.cache_option,
        );
        if is_placeholder {
            lock(&self.inner.observers).push(Arc::downgrade(&copy.inner));
        } else if let Some(content) = self.inner.content.get() {
            copy.inner.content.set_if_pending(content);
        }
        copy
    }
}

fn content_from(
    materialized: Materialized,
    source: Option<NativeHandle>,
    failure: Option<Arc<ImagingError>>,
    sync: SyncObject,
    context: Option<Arc<DecodeContext>>,
) -> FrameContent {
    FrameContent {
        source,
        render: materialized.handle,
        info: materialized.info,
        palette: materialized.palette,
        source_cached: materialized.source_cached,
        failure,
        sync,
        context,
    }
}

impl fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSource")
            .field("index", &self.index())
            .field("placeholder", &self.is_placeholder())
            .field("complete", &self.is_creation_complete())
            .finish()
    }
}
