use super::convert;
use super::{CodecEngine, SourceInfo};
use crate::format::ContainerFormat;
use crate::native::{BackingStream, CacheHint, HandleKind, NativeError, NativeHandle, NativeResult};
use fast_image_resize::images::Image;
use fast_image_resize::{PixelType, Resizer};
use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, ColorType, DynamicImage, ImageDecoder, ImageError, ImageFormat};
use imaging_config::EngineConfig;
use imaging_types::{
    BitmapMetadata, ColorContext, Palette, PixelBuffer, PixelFormat, PixelRect, Resolution,
};
use once_cell::sync::OnceCell;
use shared::BandCache;
use std::io::Cursor;
use std::sync::Arc;

const DEFAULT_BAND_HEIGHT: u32 = 64;
const DEFAULT_MAX_BANDS: usize = 32;

/// [`CodecEngine`] backed by the `image` crate, with EXIF metadata and thumbnails from
/// `kamadak-exif` and scaling through `fast_image_resize`.
#[derive(Debug, Clone)]
pub struct ImageEngine {
    band_height: u32,
    max_bands: usize,
}

impl Default for ImageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageEngine {
    pub fn new() -> Self {
        Self {
            band_height: DEFAULT_BAND_HEIGHT,
            max_bands: DEFAULT_MAX_BANDS,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            band_height: config.on_demand_band_height.max(1),
            max_bands: config.on_demand_max_bands.max(1),
        }
    }

    fn raster<'h>(&self, handle: &'h NativeHandle) -> NativeResult<&'h Arc<dyn Raster>> {
        handle
            .downcast_ref::<RasterObject>()
            .map(|object| &object.0)
            .ok_or_else(|| NativeError::Engine(format!("{:?} does not carry pixels", handle.kind())))
    }

    fn read_full(&self, source: &NativeHandle, info: &SourceInfo) -> NativeResult<Vec<u8>> {
        let stride = info.format.min_stride(info.width);
        let mut data = vec![0u8; stride * info.height as usize];
        self.copy_pixels(source, info.bounds(), stride, &mut data)?;
        Ok(data)
    }
}

fn image_error(err: ImageError) -> NativeError {
    match err {
        ImageError::IoError(io) => NativeError::Io(io),
        ImageError::Unsupported(unsupported) => NativeError::Unsupported(unsupported.to_string()),
        other => NativeError::Corrupt(other.to_string()),
    }
}

fn to_image_format(format: ContainerFormat) -> Option<ImageFormat> {
    match format {
        ContainerFormat::Bmp => Some(ImageFormat::Bmp),
        ContainerFormat::Png => Some(ImageFormat::Png),
        ContainerFormat::Jpeg => Some(ImageFormat::Jpeg),
        ContainerFormat::Gif => Some(ImageFormat::Gif),
        ContainerFormat::Tiff => Some(ImageFormat::Tiff),
        ContainerFormat::Ico => Some(ImageFormat::Ico),
        ContainerFormat::WebP => Some(ImageFormat::WebP),
        ContainerFormat::Unknown => None,
    }
}

fn from_image_format(format: ImageFormat) -> ContainerFormat {
    match format {
        ImageFormat::Bmp => ContainerFormat::Bmp,
        ImageFormat::Png => ContainerFormat::Png,
        ImageFormat::Jpeg => ContainerFormat::Jpeg,
        ImageFormat::Gif => ContainerFormat::Gif,
        ImageFormat::Tiff => ContainerFormat::Tiff,
        ImageFormat::Ico => ContainerFormat::Ico,
        ImageFormat::WebP => ContainerFormat::WebP,
        _ => ContainerFormat::Unknown,
    }
}

fn native_format(color: ColorType) -> PixelFormat {
    match color {
        ColorType::L8 => PixelFormat::Gray8,
        ColorType::Rgb8 => PixelFormat::Rgb24,
        ColorType::L16 => PixelFormat::Gray16,
        ColorType::Rgb16 => PixelFormat::Rgb48,
        ColorType::La16 | ColorType::Rgba16 => PixelFormat::Rgba64,
        ColorType::Rgb32F | ColorType::Rgba32F => PixelFormat::Rgba128Float,
        _ => PixelFormat::Rgba32,
    }
}

fn raster_bytes(image: DynamicImage, format: PixelFormat) -> Vec<u8> {
    match format {
        PixelFormat::Gray8 => image.into_luma8().into_raw(),
        PixelFormat::Rgb24 => image.into_rgb8().into_raw(),
        PixelFormat::Gray16 => image
            .into_luma16()
            .into_raw()
            .into_iter()
            .flat_map(u16::to_le_bytes)
            .collect(),
        PixelFormat::Rgb48 => image
            .into_rgb16()
            .into_raw()
            .into_iter()
            .flat_map(u16::to_le_bytes)
            .collect(),
        PixelFormat::Rgba64 => image
            .into_rgba16()
            .into_raw()
            .into_iter()
            .flat_map(u16::to_le_bytes)
            .collect(),
        PixelFormat::Rgba128Float => image
            .into_rgba32f()
            .into_raw()
            .into_iter()
            .flat_map(f32::to_le_bytes)
            .collect(),
        _ => image.into_rgba8().into_raw(),
    }
}

struct ExifData {
    metadata: BitmapMetadata,
    thumbnail: Option<Arc<[u8]>>,
    resolution: Option<Resolution>,
}

fn read_exif(bytes: &[u8]) -> Option<ExifData> {
    let mut cursor = Cursor::new(bytes);
    let exif = exif::Reader::new().read_from_container(&mut cursor).ok()?;

    let mut metadata = BitmapMetadata::new("exif");
    for field in exif.fields() {
        let prefix = if field.ifd_num == exif::In::THUMBNAIL {
            "/thumb"
        } else {
            "/exif"
        };
        metadata.entries.insert(
            format!("{}/{}", prefix, field.tag),
            field.display_value().with_unit(&exif).to_string(),
        );
    }

    let thumbnail = {
        let offset = exif
            .get_field(exif::Tag::JPEGInterchangeFormat, exif::In::THUMBNAIL)
            .and_then(|f| f.value.get_uint(0));
        let len = exif
            .get_field(exif::Tag::JPEGInterchangeFormatLength, exif::In::THUMBNAIL)
            .and_then(|f| f.value.get_uint(0));
        match (offset, len) {
            (Some(offset), Some(len)) => exif
                .buf()
                .get(offset as usize..offset as usize + len as usize)
                .map(Arc::from),
            _ => None,
        }
    };

    let rational = |tag: exif::Tag| {
        exif.get_field(tag, exif::In::PRIMARY).and_then(|f| match f.value {
            exif::Value::Rational(ref values) => values
                .first()
                .filter(|r| r.denom != 0)
                .map(|r| r.num as f64 / r.denom as f64),
            _ => None,
        })
    };
    let unit = exif
        .get_field(exif::Tag::ResolutionUnit, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .unwrap_or(2);
    let resolution = match (rational(exif::Tag::XResolution), rational(exif::Tag::YResolution)) {
        (Some(x), Some(y)) => match unit {
            2 => Some(Resolution::new(x, y).sanitized()),
            3 => Some(Resolution::new(x * 2.54, y * 2.54).sanitized()),
            _ => None,
        },
        _ => None,
    };

    Some(ExifData {
        metadata,
        thumbnail,
        resolution,
    })
}

#[derive(Clone)]
enum FrameData {
    Memory(Arc<[u8]>),
    Stream(BackingStream),
}

impl FrameData {
    fn bytes(&self) -> NativeResult<Arc<[u8]>> {
        match self {
            FrameData::Memory(bytes) => Ok(bytes.clone()),
            FrameData::Stream(stream) => Ok(stream.read_all()?.into()),
        }
    }
}

struct ContainerObject {
    format: ContainerFormat,
    image_format: ImageFormat,
    data: FrameData,
    frame_count: u32,
    info: SourceInfo,
    icc: Option<Arc<[u8]>>,
    exif: Option<Arc<ExifData>>,
}

trait Raster: Send + Sync {
    fn info(&self) -> SourceInfo;

    fn copy(
        &self,
        engine: &ImageEngine,
        rect: PixelRect,
        stride: usize,
        buffer: &mut [u8],
    ) -> NativeResult<()>;

    fn palette(&self) -> Option<Palette> {
        None
    }

    fn thumbnail(&self) -> NativeResult<NativeHandle> {
        Err(NativeError::NotPresent)
    }

    fn metadata(&self) -> NativeResult<BitmapMetadata> {
        Err(NativeError::NotPresent)
    }

    fn color_contexts(&self) -> NativeResult<Vec<ColorContext>> {
        Err(NativeError::NotPresent)
    }
}

struct RasterObject(Arc<dyn Raster>);

fn raster_handle(kind: HandleKind, raster: impl Raster + 'static) -> NativeHandle {
    NativeHandle::new(kind, RasterObject(Arc::new(raster)))
}

struct FrameObject {
    data: FrameData,
    image_format: ImageFormat,
    index: u32,
    info: SourceInfo,
    icc: Option<Arc<[u8]>>,
    exif: Option<Arc<ExifData>>,
}

impl FrameObject {
    fn decode(&self) -> NativeResult<Vec<u8>> {
        let bytes = self.data.bytes()?;
        tracing::trace!(index = self.index, format = ?self.image_format, "decoding frame");

        if self.image_format == ImageFormat::Gif {
            let decoder = GifDecoder::new(Cursor::new(bytes)).map_err(image_error)?;
            let frame = decoder
                .into_frames()
                .nth(self.index as usize)
                .ok_or_else(|| NativeError::Corrupt(format!("frame {} vanished", self.index)))?
                .map_err(image_error)?;
            return Ok(frame.into_buffer().into_raw());
        }

        let image =
            image::load_from_memory_with_format(&bytes, self.image_format).map_err(image_error)?;
        if (image.width(), image.height()) != (self.info.width, self.info.height) {
            return Err(NativeError::Corrupt("decoded size differs from the header".into()));
        }
        Ok(raster_bytes(image, self.info.format))
    }
}

impl Raster for FrameObject {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn copy(&self, _: &ImageEngine, rect: PixelRect, stride: usize, buffer: &mut [u8]) -> NativeResult<()> {
        let pixels = self.decode()?;
        let src_stride = self.info.format.min_stride(self.info.width);
        convert::copy_rect(&pixels, src_stride, self.info.format, rect, buffer, stride)
    }

    fn thumbnail(&self) -> NativeResult<NativeHandle> {
        let bytes = self
            .exif
            .as_ref()
            .and_then(|exif| exif.thumbnail.clone())
            .ok_or(NativeError::NotPresent)?;
        let image = image::load_from_memory(&bytes).map_err(image_error)?;
        let info = SourceInfo {
            width: image.width(),
            height: image.height(),
            format: PixelFormat::Rgba32,
            resolution: Resolution::default(),
        };
        Ok(raster_handle(
            HandleKind::Bitmap,
            MemoryBitmap {
                info,
                stride: PixelFormat::Rgba32.min_stride(info.width),
                data: image.into_rgba8().into_raw().into(),
                palette: None,
            },
        ))
    }

    fn metadata(&self) -> NativeResult<BitmapMetadata> {
        self.exif
            .as_ref()
            .map(|exif| exif.metadata.clone())
            .ok_or(NativeError::NotPresent)
    }

    fn color_contexts(&self) -> NativeResult<Vec<ColorContext>> {
        self.icc
            .as_ref()
            .map(|icc| vec![ColorContext::from_icc(icc.clone())])
            .ok_or(NativeError::NotPresent)
    }
}

struct MemoryBitmap {
    info: SourceInfo,
    stride: usize,
    data: Arc<[u8]>,
    palette: Option<Palette>,
}

impl Raster for MemoryBitmap {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn copy(&self, _: &ImageEngine, rect: PixelRect, stride: usize, buffer: &mut [u8]) -> NativeResult<()> {
        convert::copy_rect(&self.data, self.stride, self.info.format, rect, buffer, stride)
    }

    fn palette(&self) -> Option<Palette> {
        self.palette.clone()
    }
}

struct FormatConverter {
    source: NativeHandle,
    source_info: SourceInfo,
    source_palette: Option<Palette>,
    info: SourceInfo,
    palette: Option<Palette>,
}

impl Raster for FormatConverter {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn copy(&self, engine: &ImageEngine, rect: PixelRect, stride: usize, buffer: &mut [u8]) -> NativeResult<()> {
        let src_stride = self.source_info.format.min_stride(rect.width);
        let mut scratch = vec![0u8; src_stride * rect.height as usize];
        engine.copy_pixels(&self.source, rect, src_stride, &mut scratch)?;
        convert::convert_rows(
            &scratch,
            src_stride,
            self.source_info.format,
            self.source_palette.as_ref(),
            rect.width,
            rect.height,
            buffer,
            stride,
            self.info.format,
            self.palette.as_ref(),
        )
    }

    fn palette(&self) -> Option<Palette> {
        self.palette.clone()
    }
}

/// Decodes full-width row bands on first touch and keeps the most recent ones.
struct OnDemandBitmap {
    source: NativeHandle,
    info: SourceInfo,
    palette: Option<Palette>,
    band_height: u32,
    bands: BandCache,
}

impl Raster for OnDemandBitmap {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn copy(&self, engine: &ImageEngine, rect: PixelRect, stride: usize, buffer: &mut [u8]) -> NativeResult<()> {
        if rect.is_empty() {
            return Ok(());
        }
        let row_bytes = self.info.format.min_stride(self.info.width);
        let first_band = rect.y / self.band_height;
        let last_band = (rect.y + rect.height - 1) / self.band_height;

        for band in first_band..=last_band {
            let band_top = band * self.band_height;
            let band_rows = self.band_height.min(self.info.height - band_top);
            let data = self.bands.get_or_try_insert_with(band, || {
                let mut rows = vec![0u8; row_bytes * band_rows as usize];
                engine.copy_pixels(
                    &self.source,
                    PixelRect::new(0, band_top, self.info.width, band_rows),
                    row_bytes,
                    &mut rows,
                )?;
                Ok::<_, NativeError>(rows)
            })?;

            let top = rect.y.max(band_top);
            let bottom = (rect.y + rect.height).min(band_top + band_rows);
            let out_offset = (top - rect.y) as usize * stride;
            convert::copy_rect(
                &data,
                row_bytes,
                self.info.format,
                PixelRect::new(rect.x, top - band_top, rect.width, bottom - top),
                &mut buffer[out_offset..],
                stride,
            )?;
        }
        Ok(())
    }

    fn palette(&self) -> Option<Palette> {
        self.palette.clone()
    }
}

/// Forwards to its source unchanged.
struct PassThrough {
    source: NativeHandle,
    info: SourceInfo,
    palette: Option<Palette>,
}

impl Raster for PassThrough {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn copy(&self, engine: &ImageEngine, rect: PixelRect, stride: usize, buffer: &mut [u8]) -> NativeResult<()> {
        engine.copy_pixels(&self.source, rect, stride, buffer)
    }

    fn palette(&self) -> Option<Palette> {
        self.palette.clone()
    }
}

struct Scaler {
    source: NativeHandle,
    source_info: SourceInfo,
    info: SourceInfo,
    scaled: OnceCell<Arc<[u8]>>,
}

impl Scaler {
    fn scaled(&self, engine: &ImageEngine) -> NativeResult<&Arc<[u8]>> {
        self.scaled.get_or_try_init(|| {
            let src = self.source_info;
            let mut pixels = engine.read_full(&self.source, &src)?;
            if src.format != self.info.format {
                let palette = engine.get_palette(&self.source).ok();
                let mut rgba = vec![0u8; self.info.format.min_stride(src.width) * src.height as usize];
                convert::convert_rows(
                    &pixels,
                    src.format.min_stride(src.width),
                    src.format,
                    palette.as_ref(),
                    src.width,
                    src.height,
                    &mut rgba,
                    self.info.format.min_stride(src.width),
                    self.info.format,
                    None,
                )?;
                pixels = rgba;
            }

            let src_image = Image::from_vec_u8(src.width, src.height, pixels, PixelType::U8x4)
                .map_err(|e| NativeError::Engine(e.to_string()))?;
            let mut dst_image = Image::new(self.info.width, self.info.height, PixelType::U8x4);
            let mut resizer = Resizer::new();
            resizer
                .resize(&src_image, &mut dst_image, None)
                .map_err(|e| NativeError::Engine(e.to_string()))?;
            Ok(dst_image.into_vec().into())
        })
    }
}

impl Raster for Scaler {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn copy(&self, engine: &ImageEngine, rect: PixelRect, stride: usize, buffer: &mut [u8]) -> NativeResult<()> {
        let scaled = self.scaled(engine)?;
        let src_stride = self.info.format.min_stride(self.info.width);
        convert::copy_rect(scaled, src_stride, self.info.format, rect, buffer, stride)
    }
}

struct Clipper {
    source: NativeHandle,
    origin: PixelRect,
    info: SourceInfo,
    palette: Option<Palette>,
}

impl Raster for Clipper {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn copy(&self, engine: &ImageEngine, rect: PixelRect, stride: usize, buffer: &mut [u8]) -> NativeResult<()> {
        let shifted = PixelRect::new(
            rect.x + self.origin.x,
            rect.y + self.origin.y,
            rect.width,
            rect.height,
        );
        engine.copy_pixels(&self.source, shifted, stride, buffer)
    }

    fn palette(&self) -> Option<Palette> {
        self.palette.clone()
    }
}

fn looks_like_srgb(context: &ColorContext) -> bool {
    context.is_srgb() || context.profile.windows(4).any(|w| w == b"sRGB")
}

impl CodecEngine for ImageEngine {
    fn name(&self) -> &str {
        "image"
    }

    fn probe(&self, header: &[u8]) -> ContainerFormat {
        image::guess_format(header)
            .map(from_image_format)
            .unwrap_or(ContainerFormat::Unknown)
    }

    fn open(
        &self,
        stream: &BackingStream,
        format: ContainerFormat,
        hint: CacheHint,
    ) -> NativeResult<NativeHandle> {
        let bytes: Arc<[u8]> = stream.read_all()?.into();
        let image_format = match to_image_format(format) {
            Some(image_format) => image_format,
            None => image::guess_format(&bytes)
                .map_err(|_| NativeError::Unsupported("no decoder recognises this content".into()))?,
        };

        let (width, height, color, icc) = {
            let mut decoder = image::ImageReader::with_format(Cursor::new(&bytes[..]), image_format)
                .into_decoder()
                .map_err(image_error)?;
            let (width, height) = decoder.dimensions();
            let icc = decoder.icc_profile().ok().flatten().map(Arc::<[u8]>::from);
            (width, height, decoder.color_type(), icc)
        };

        let frame_count = if image_format == ImageFormat::Gif {
            let decoder = GifDecoder::new(Cursor::new(&bytes[..])).map_err(image_error)?;
            decoder.into_frames().count().max(1) as u32
        } else {
            1
        };

        let exif = match image_format {
            ImageFormat::Jpeg | ImageFormat::Tiff | ImageFormat::Png | ImageFormat::WebP => {
                read_exif(&bytes).map(Arc::new)
            }
            _ => None,
        };
        let resolution = exif
            .as_ref()
            .and_then(|exif| exif.resolution)
            .unwrap_or_default();
        let pixel_format = if image_format == ImageFormat::Gif {
            PixelFormat::Rgba32
        } else {
            native_format(color)
        };

        // OnLoad keeps the encoded bytes so frames never go back to the stream.
        let data = match hint {
            CacheHint::OnLoad => FrameData::Memory(bytes),
            _ => FrameData::Stream(stream.clone()),
        };

        tracing::debug!(
            format = %from_image_format(image_format),
            width,
            height,
            frame_count,
            "container opened"
        );

        Ok(NativeHandle::new(
            HandleKind::Container,
            ContainerObject {
                format: from_image_format(image_format),
                image_format,
                data,
                frame_count,
                info: SourceInfo {
                    width,
                    height,
                    format: pixel_format,
                    resolution,
                },
                icc,
                exif,
            },
        ))
    }

    fn frame_count(&self, container: &NativeHandle) -> NativeResult<u32> {
        container
            .downcast_ref::<ContainerObject>()
            .map(|c| c.frame_count)
            .ok_or_else(|| NativeError::Engine("not a container".into()))
    }

    fn get_frame(&self, container: &NativeHandle, index: u32) -> NativeResult<NativeHandle> {
        let container = container
            .downcast_ref::<ContainerObject>()
            .ok_or_else(|| NativeError::Engine("not a container".into()))?;
        if index >= container.frame_count {
            return Err(NativeError::Engine(format!(
                "frame {} out of range ({} frames)",
                index, container.frame_count
            )));
        }
        let first = index == 0;
        Ok(raster_handle(
            HandleKind::Frame,
            FrameObject {
                data: container.data.clone(),
                image_format: container.image_format,
                index,
                info: container.info,
                icc: container.icc.clone().filter(|_| first),
                exif: container.exif.clone().filter(|_| first),
            },
        ))
    }

    fn get_thumbnail(&self, source: &NativeHandle) -> NativeResult<NativeHandle> {
        if source.downcast_ref::<ContainerObject>().is_some() {
            return Err(NativeError::NotPresent);
        }
        self.raster(source)?.thumbnail()
    }

    fn get_preview(&self, _container: &NativeHandle) -> NativeResult<NativeHandle> {
        Err(NativeError::NotPresent)
    }

    fn get_metadata(&self, source: &NativeHandle) -> NativeResult<BitmapMetadata> {
        if let Some(container) = source.downcast_ref::<ContainerObject>() {
            if container.format != ContainerFormat::Gif {
                return Err(NativeError::NotPresent);
            }
            return Ok(BitmapMetadata::new("gif")
                .with_entry("/logscrdesc/Width", container.info.width.to_string())
                .with_entry("/logscrdesc/Height", container.info.height.to_string())
                .with_entry("/frames", container.frame_count.to_string()));
        }
        self.raster(source)?.metadata()
    }

    fn get_color_contexts(&self, source: &NativeHandle) -> NativeResult<Vec<ColorContext>> {
        if source.downcast_ref::<ContainerObject>().is_some() {
            return Err(NativeError::NotPresent);
        }
        self.raster(source)?.color_contexts()
    }

    fn get_palette(&self, source: &NativeHandle) -> NativeResult<Palette> {
        if source.downcast_ref::<ContainerObject>().is_some() {
            return Err(NativeError::NotPresent);
        }
        self.raster(source)?.palette().ok_or(NativeError::NotPresent)
    }

    fn describe(&self, source: &NativeHandle) -> NativeResult<SourceInfo> {
        Ok(self.raster(source)?.info())
    }

    fn copy_pixels(
        &self,
        source: &NativeHandle,
        rect: PixelRect,
        stride: usize,
        buffer: &mut [u8],
    ) -> NativeResult<()> {
        self.raster(source)?.copy(self, rect, stride, buffer)
    }

    fn create_format_converter(
        &self,
        source: &NativeHandle,
        format: PixelFormat,
        palette: Option<&Palette>,
    ) -> NativeResult<NativeHandle> {
        if !convert::can_write(format) {
            return Err(NativeError::Unsupported(format!("conversion into {format}")));
        }
        let raster = self.raster(source)?;
        let source_info = raster.info();
        let source_palette = raster.palette();
        let palette = match palette {
            Some(palette) => Some(palette.clone()),
            None if format.is_palettized() => Some(source_palette.clone().ok_or_else(|| {
                NativeError::Unsupported(format!("{format} output needs a palette"))
            })?),
            None => None,
        };

        Ok(raster_handle(
            HandleKind::FormatConverter,
            FormatConverter {
                source: source.add_ref(),
                source_info,
                source_palette,
                info: SourceInfo {
                    format,
                    ..source_info
                },
                palette,
            },
        ))
    }

    fn create_bitmap_from_source(
        &self,
        source: &NativeHandle,
        hint: CacheHint,
    ) -> NativeResult<NativeHandle> {
        let raster = self.raster(source)?;
        let info = raster.info();
        match hint {
            CacheHint::OnLoad => {
                let data = self.read_full(source, &info)?;
                Ok(raster_handle(
                    HandleKind::Bitmap,
                    MemoryBitmap {
                        info,
                        stride: info.format.min_stride(info.width),
                        data: data.into(),
                        palette: raster.palette(),
                    },
                ))
            }
            CacheHint::OnDemand => Ok(raster_handle(
                HandleKind::Bitmap,
                OnDemandBitmap {
                    source: source.add_ref(),
                    info,
                    palette: raster.palette(),
                    band_height: self.band_height,
                    bands: BandCache::new(self.max_bands),
                },
            )),
            CacheHint::None => Ok(raster_handle(
                HandleKind::Bitmap,
                PassThrough {
                    source: source.add_ref(),
                    info,
                    palette: raster.palette(),
                },
            )),
        }
    }

    fn create_bitmap_from_memory(&self, pixels: &PixelBuffer) -> NativeResult<NativeHandle> {
        pixels.validate().map_err(NativeError::Engine)?;
        Ok(raster_handle(
            HandleKind::Bitmap,
            MemoryBitmap {
                info: SourceInfo {
                    width: pixels.width,
                    height: pixels.height,
                    format: pixels.format,
                    resolution: pixels.resolution.sanitized(),
                },
                stride: pixels.stride,
                data: pixels.data.clone(),
                palette: pixels.palette.clone(),
            },
        ))
    }

    fn create_color_transform(
        &self,
        source: &NativeHandle,
        from: &ColorContext,
        to: &ColorContext,
        format: PixelFormat,
    ) -> NativeResult<NativeHandle> {
        if !from.has_valid_icc_header() {
            return Err(NativeError::BadColorProfile(format!(
                "{} byte profile has no valid ICC header",
                from.profile.len()
            )));
        }
        if format.bits_per_pixel() != 32 || format == PixelFormat::Cmyk32 {
            return Err(NativeError::Unsupported(format!(
                "color transforms need 32bpp RGB input, got {format}"
            )));
        }
        if !(looks_like_srgb(from) && to.is_srgb()) {
            return Err(NativeError::Unsupported(
                "only sRGB to sRGB transforms are available".into(),
            ));
        }

        let raster = self.raster(source)?;
        Ok(raster_handle(
            HandleKind::ColorTransform,
            PassThrough {
                source: source.add_ref(),
                info: raster.info(),
                palette: raster.palette(),
            },
        ))
    }

    fn create_scaler(&self, source: &NativeHandle, width: u32, height: u32) -> NativeResult<NativeHandle> {
        if width == 0 || height == 0 {
            return Err(NativeError::Engine("scaled size must be non-zero".into()));
        }
        let source_info = self.raster(source)?.info();
        let format = match source_info.format {
            PixelFormat::Bgr32 | PixelFormat::Bgra32 | PixelFormat::Pbgra32 | PixelFormat::Rgba32 => {
                source_info.format
            }
            _ => PixelFormat::Rgba32,
        };

        Ok(raster_handle(
            HandleKind::Scaler,
            Scaler {
                source: source.add_ref(),
                source_info,
                info: SourceInfo {
                    width,
                    height,
                    format,
                    resolution: source_info.resolution,
                },
                scaled: OnceCell::new(),
            },
        ))
    }

    fn create_clipper(&self, source: &NativeHandle, rect: PixelRect) -> NativeResult<NativeHandle> {
        let raster = self.raster(source)?;
        let source_info = raster.info();
        if rect.is_empty() || !rect.fits_within(source_info.width, source_info.height) {
            return Err(NativeError::Engine(format!(
                "clip {:?} outside {}x{}",
                rect, source_info.width, source_info.height
            )));
        }
        Ok(raster_handle(
            HandleKind::Clipper,
            Clipper {
                source: source.add_ref(),
                origin: rect,
                info: SourceInfo {
                    width: rect.width,
                    height: rect.height,
                    ..source_info
                },
                palette: raster.palette(),
            },
        ))
    }
}
