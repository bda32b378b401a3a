//! The seam between the decoding layer and whatever actually decodes pixels.

mod convert;
mod image_engine;

pub use image_engine::ImageEngine;

use crate::format::ContainerFormat;
use crate::native::{BackingStream, CacheHint, NativeError, NativeHandle, NativeResult};
use imaging_types::{
    BitmapMetadata, ColorContext, Palette, PixelBuffer, PixelFormat, PixelRect, Resolution,
};

/// Geometry and pixel layout of an engine object that yields pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub resolution: Resolution,
}

impl SourceInfo {
    pub fn bounds(&self) -> PixelRect {
        PixelRect::full(self.width, self.height)
    }
}

/// A codec engine. Every method may be called from any thread, but callers serialise
/// calls that touch one container through that container's lock.
///
/// Optional components report [`NativeError::NotPresent`] rather than failing.
pub trait CodecEngine: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Identifies the container format from the first bytes of a stream.
    fn probe(&self, header: &[u8]) -> ContainerFormat;

    fn open(
        &self,
        stream: &BackingStream,
        format: ContainerFormat,
        hint: CacheHint,
    ) -> NativeResult<NativeHandle>;

    fn frame_count(&self, container: &NativeHandle) -> NativeResult<u32>;

    fn get_frame(&self, container: &NativeHandle, index: u32) -> NativeResult<NativeHandle>;

    /// Works for containers and frames.
    fn get_thumbnail(&self, source: &NativeHandle) -> NativeResult<NativeHandle>;

    fn get_preview(&self, container: &NativeHandle) -> NativeResult<NativeHandle>;

    fn get_metadata(&self, source: &NativeHandle) -> NativeResult<BitmapMetadata>;

    fn get_color_contexts(&self, source: &NativeHandle) -> NativeResult<Vec<ColorContext>>;

    fn get_palette(&self, source: &NativeHandle) -> NativeResult<Palette>;

    fn describe(&self, source: &NativeHandle) -> NativeResult<SourceInfo>;

    /// Copies `rect` into `buffer`, `stride` bytes per row, starting at bit 0 of each
    /// row. The rect is already validated against the source bounds.
    fn copy_pixels(
        &self,
        source: &NativeHandle,
        rect: PixelRect,
        stride: usize,
        buffer: &mut [u8],
    ) -> NativeResult<()>;

    fn create_format_converter(
        &self,
        source: &NativeHandle,
        format: PixelFormat,
        palette: Option<&Palette>,
    ) -> NativeResult<NativeHandle>;

    fn create_bitmap_from_source(
        &self,
        source: &NativeHandle,
        hint: CacheHint,
    ) -> NativeResult<NativeHandle>;

    fn create_bitmap_from_memory(&self, pixels: &PixelBuffer) -> NativeResult<NativeHandle>;

    fn destination_color_context(&self, _format: PixelFormat) -> NativeResult<ColorContext> {
        Ok(ColorContext::srgb())
    }

    fn create_color_transform(
        &self,
        _source: &NativeHandle,
        _from: &ColorContext,
        _to: &ColorContext,
        format: PixelFormat,
    ) -> NativeResult<NativeHandle> {
        Err(NativeError::Unsupported(format!(
            "color transforms for {format}"
        )))
    }

    fn create_scaler(
        &self,
        _source: &NativeHandle,
        _width: u32,
        _height: u32,
    ) -> NativeResult<NativeHandle> {
        Err(NativeError::Unsupported("scaling".into()))
    }

    fn create_clipper(&self, _source: &NativeHandle, _rect: PixelRect) -> NativeResult<NativeHandle> {
        Err(NativeError::Unsupported("clipping".into()))
    }
}
