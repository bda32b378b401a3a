//! The materialization steps shared by frames and bitmap images: scale, clip, color
//! conversion, format mapping and caching, in that order.

use crate::engine::{CodecEngine, SourceInfo};
use crate::error::{ImagingError, ImagingResult};
use crate::native::{CacheHint, NativeError, NativeHandle, NativeResultExt};
use crate::sync::lock_sync;
use imaging_types::{
    CacheOption, ColorContext, CreateOptions, Palette, PixelBuffer, PixelFormat, PixelRect,
};
use std::sync::Mutex;

pub(crate) struct MaterializeRequest<'a> {
    pub create_options: CreateOptions,
    pub cache_option: CacheOption,
    pub color_contexts: &'a [ColorContext],
    pub source_rect: Option<PixelRect>,
    pub decode_width: Option<u32>,
    pub decode_height: Option<u32>,
    /// The input handle already holds fully cached pixels.
    pub input_cached: bool,
}

impl MaterializeRequest<'_> {
    pub(crate) fn new(create_options: CreateOptions, cache_option: CacheOption) -> Self {
        Self {
            create_options,
            cache_option,
            color_contexts: &[],
            source_rect: None,
            decode_width: None,
            decode_height: None,
            input_cached: false,
        }
    }
}

pub(crate) struct Materialized {
    pub handle: NativeHandle,
    pub info: SourceInfo,
    pub palette: Option<Palette>,
    pub color_converted: bool,
    pub source_cached: bool,
}

/// Target size for decode-time scaling. A single dimension keeps the aspect ratio.
pub(crate) fn decode_size(
    width: u32,
    height: u32,
    decode_width: Option<u32>,
    decode_height: Option<u32>,
) -> Option<(u32, u32)> {
    let scale = |value: u32, num: u32, den: u32| {
        ((value as u64 * num as u64 + den as u64 / 2) / den.max(1) as u64).max(1) as u32
    };
    match (decode_width.filter(|w| *w > 0), decode_height.filter(|h| *h > 0)) {
        (None, None) => None,
        (Some(w), Some(h)) => Some((w, h)),
        (Some(w), None) => Some((w, scale(height, w, width))),
        (None, Some(h)) => Some((scale(width, h, height), h)),
    }
}

fn needs_alpha(format: PixelFormat, palette: Option<&Palette>) -> bool {
    format.has_alpha() || palette.is_some_and(Palette::has_alpha)
}

pub(crate) fn materialize(
    engine: &dyn CodecEngine,
    source: &NativeHandle,
    request: &MaterializeRequest<'_>,
) -> ImagingResult<Materialized> {
    let mut handle = source.add_ref();
    let mut info = engine.describe(&handle)?;

    if let Some((width, height)) =
        decode_size(info.width, info.height, request.decode_width, request.decode_height)
    {
        if (width, height) != (info.width, info.height) {
            handle = engine.create_scaler(&handle, width, height)?;
            info = engine.describe(&handle)?;
        }
    }

    if let Some(rect) = request.source_rect.filter(|rect| !rect.is_empty()) {
        if !rect.fits_within(info.width, info.height) {
            return Err(ImagingError::InvalidArgument(format!(
                "source rect {}x{} at ({}, {}) exceeds {}x{}",
                rect.width, rect.height, rect.x, rect.y, info.width, info.height
            )));
        }
        handle = engine.create_clipper(&handle, rect)?;
        info = engine.describe(&handle)?;
    }

    let palette = engine.get_palette(&handle).present()?;
    let target = if request.create_options.contains(CreateOptions::PRESERVE_PIXEL_FORMAT) {
        info.format
    } else {
        info.format
            .closest_render_compatible(needs_alpha(info.format, palette.as_ref()))
    };

    let mut color_converted = false;
    let profile = request
        .color_contexts
        .first()
        .filter(|_| !request.create_options.contains(CreateOptions::IGNORE_COLOR_PROFILE));
    if let Some(profile) = profile {
        match engine.destination_color_context(target).present() {
            Ok(Some(destination)) => {
                (handle, info, color_converted) = convert_color(
                    engine,
                    handle,
                    info,
                    profile,
                    &destination,
                    target,
                    palette.as_ref(),
                )?;
            }
            Ok(None) | Err(NativeError::Unsupported(_)) => {
                tracing::debug!(%target, "no destination color context, skipping color conversion");
            }
            Err(err) => return Err(err.into()),
        }
    }

    if info.format != target {
        handle = engine.create_format_converter(&handle, target, palette.as_ref())?;
        info = engine.describe(&handle)?;
    }

    let wrapped = !handle.same_object(source);
    let (handle, source_cached) = match request.cache_option.effective() {
        CacheOption::None => (handle, false),
        _ if request.input_cached && !wrapped => (handle, true),
        option => (
            engine.create_bitmap_from_source(&handle, CacheHint::from(option))?,
            true,
        ),
    };

    let info = engine.describe(&handle)?;
    let palette = engine.get_palette(&handle).present()?;
    Ok(Materialized {
        handle,
        info,
        palette,
        color_converted,
        source_cached,
    })
}

fn staging_format(target: PixelFormat, alpha: bool) -> PixelFormat {
    match target {
        PixelFormat::Bgr32 | PixelFormat::Bgra32 | PixelFormat::Pbgra32 => target,
        _ if alpha => PixelFormat::Bgra32,
        _ => PixelFormat::Bgr32,
    }
}

/// Tries the transform on the raw format, then on a 32bpp copy. When the second
/// attempt is also refused, the 32bpp copy is kept without color correction.
fn convert_color(
    engine: &dyn CodecEngine,
    handle: NativeHandle,
    info: SourceInfo,
    profile: &ColorContext,
    destination: &ColorContext,
    target: PixelFormat,
    palette: Option<&Palette>,
) -> ImagingResult<(NativeHandle, SourceInfo, bool)> {
    match engine.create_color_transform(&handle, profile, destination, info.format) {
        Ok(transform) => {
            let info = engine.describe(&transform)?;
            return Ok((transform, info, true));
        }
        Err(NativeError::BadColorProfile(reason)) => {
            tracing::warn!(%reason, "skipping color conversion: embedded profile is malformed");
            return Ok((handle, info, false));
        }
        Err(NativeError::NotPresent) => return Ok((handle, info, false)),
        Err(NativeError::Unsupported(reason)) => {
            tracing::debug!(%reason, format = %info.format, "converting format before color conversion");
        }
        Err(err) => return Err(err.into()),
    }

    let staging = staging_format(target, needs_alpha(info.format, palette));
    let converted = engine.create_format_converter(&handle, staging, palette)?;
    let converted_info = engine.describe(&converted)?;

    match engine.create_color_transform(&converted, profile, destination, staging) {
        Ok(transform) => {
            let info = engine.describe(&transform)?;
            Ok((transform, info, true))
        }
        Err(NativeError::BadColorProfile(reason)) => {
            tracing::warn!(%reason, "skipping color conversion: embedded profile is malformed");
            Ok((converted, converted_info, false))
        }
        Err(NativeError::Unsupported(reason)) | Err(NativeError::Engine(reason)) => {
            tracing::warn!(%reason, format = %staging, "color conversion unavailable, keeping format-converted pixels");
            Ok((converted, converted_info, false))
        }
        Err(NativeError::NotPresent) => Ok((converted, converted_info, false)),
        Err(err) => Err(err.into()),
    }
}

/// The 1×1 transparent stand-in used while downloading and after failures.
pub(crate) fn placeholder(engine: &dyn CodecEngine) -> ImagingResult<Materialized> {
    let handle = engine.create_bitmap_from_memory(&PixelBuffer::transparent_pixel())?;
    let info = engine.describe(&handle)?;
    Ok(Materialized {
        handle,
        info,
        palette: None,
        color_converted: false,
        source_cached: true,
    })
}

/// Validates a caller's copy request and copies under the chain lock. An empty rect
/// means the whole source.
#[allow(clippy::too_many_arguments)]
pub(crate) fn copy_pixels(
    engine: &dyn CodecEngine,
    handle: &NativeHandle,
    info: &SourceInfo,
    sync: &Mutex<()>,
    rect: PixelRect,
    buffer: &mut [u8],
    stride: usize,
    offset: usize,
) -> ImagingResult<()> {
    let rect = if rect.is_empty() { info.bounds() } else { rect };
    if !rect.fits_within(info.width, info.height) {
        return Err(ImagingError::InvalidArgument(format!(
            "rect {}x{} at ({}, {}) exceeds {}x{}",
            rect.width, rect.height, rect.x, rect.y, info.width, info.height
        )));
    }

    let row_bytes = info.format.min_stride(rect.width);
    if stride < row_bytes {
        return Err(ImagingError::InvalidArgument(format!(
            "stride {stride} is smaller than the {row_bytes} bytes one row needs"
        )));
    }
    let needed = stride
        .checked_mul(rect.height as usize - 1)
        .and_then(|rows| rows.checked_add(row_bytes))
        .ok_or_else(|| {
            ImagingError::InvalidArgument(format!(
                "stride {stride} over {} rows overflows the address space",
                rect.height
            ))
        })?;
    let available = buffer.len().checked_sub(offset).ok_or_else(|| {
        ImagingError::InvalidArgument(format!("offset {offset} is past the end of the buffer"))
    })?;
    if available < needed {
        return Err(ImagingError::InvalidArgument(format!(
            "buffer holds {available} bytes after the offset but {needed} are required"
        )));
    }

    let target = &mut buffer[offset..offset + needed];
    let result = {
        let _guard = lock_sync(sync);
        engine.copy_pixels(handle, rect, stride, target)
    };
    result.map_err(|err| {
        // A failed read leaves the requested rows transparent.
        for row in target.chunks_mut(stride) {
            let len = row.len().min(row_bytes);
            row[..len].fill(0);
        }
        ImagingError::from(err)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_size_keeps_aspect() {
        assert_eq!(decode_size(400, 200, None, None), None);
        assert_eq!(decode_size(400, 200, Some(100), None), Some((100, 50)));
        assert_eq!(decode_size(400, 200, None, Some(50)), Some((100, 50)));
        assert_eq!(decode_size(400, 200, Some(10), Some(10)), Some((10, 10)));
        assert_eq!(decode_size(400, 2, Some(10), None), Some((10, 1)));
        assert_eq!(decode_size(400, 200, Some(0), None), None);
    }

    #[test]
    fn test_staging_format() {
        assert_eq!(staging_format(PixelFormat::Pbgra32, true), PixelFormat::Pbgra32);
        assert_eq!(staging_format(PixelFormat::Indexed8, true), PixelFormat::Bgra32);
        assert_eq!(staging_format(PixelFormat::Gray8, false), PixelFormat::Bgr32);
    }
}
