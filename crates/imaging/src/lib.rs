//! Bitmap decoding and caching.
//!
//! A [`Decoder`] opens a container from a URI, path, stream or byte buffer and hands
//! out [`FrameSource`]s. A [`BitmapImage`] turns a frame or raw pixels into an
//! immutable render-compatible buffer, honouring the [`CacheOption`] and
//! [`CreateOptions`] it was configured with. Pixel work happens behind the
//! [`CodecEngine`] trait; [`ImageEngine`] is the bundled implementation.

pub mod bitmap;
pub mod compositor;
pub mod context;
pub mod decoder;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod format;
pub mod frame;
pub mod identity;
pub mod native;
mod sync;

pub use bitmap::{BitmapImage, BitmapPhase, ImageSource};
pub use compositor::{CompositorAdapter, RenderResource};
pub use context::{Imaging, ImagingBuilder};
pub use decoder::{Decoder, DecoderCache, WeakDecoder};
pub use download::{
    DefaultDownloader, DownloadCachePolicy, DownloadEvent, DownloadRequest, DownloadSender,
    Downloader,
};
pub use engine::{CodecEngine, ImageEngine, SourceInfo};
pub use error::{ImagingError, ImagingResult};
pub use events::{BitmapEvent, DecoderEvent};
pub use format::{CodecInfo, ContainerFormat, FormatCapabilities};
pub use frame::FrameSource;
pub use identity::{BitmapSource, SourceIdentity};
pub use imaging_config::EngineConfig;
pub use imaging_types::{
    BitmapMetadata, CacheOption, ColorContext, ColorSpace, CreateOptions, Palette, PaletteColor,
    PixelBuffer, PixelFormat, PixelRect, Resolution,
};
pub use native::{
    BackingStream, CacheHint, HandleKind, NativeError, NativeHandle, NativeResult,
    NativeResultExt, SourceStream,
};
pub use shared::DownloadState;
