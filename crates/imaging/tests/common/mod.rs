#![allow(dead_code)]

use imaging::{
    BackingStream, BitmapMetadata, CacheHint, CodecEngine, ColorContext, CompositorAdapter,
    ContainerFormat, DownloadCachePolicy, DownloadRequest, DownloadSender, Downloader, HandleKind,
    Imaging, NativeError, NativeHandle, NativeResult, Palette, PixelBuffer, PixelFormat,
    PixelRect, RenderResource, Resolution, SourceInfo,
};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const MAGIC: &[u8; 4] = b"FAKE";

/// Encodes a fake container: magic, frame count, width, height.
pub fn fake_image(frames: u8, width: u8, height: u8) -> Vec<u8> {
    let mut bytes = MAGIC.to_vec();
    bytes.extend_from_slice(&[frames, width, height]);
    bytes
}

/// A fake container whose pixel data fails to decode even though its header parses.
pub fn corrupt_image(frames: u8, width: u8, height: u8) -> Vec<u8> {
    let mut bytes = fake_image(frames, width, height);
    bytes.push(CORRUPT);
    bytes
}

const CORRUPT: u8 = 0xff;

/// Value of every colour channel in frame `index`.
pub fn frame_shade(index: u32) -> u8 {
    (index as u8 + 1) * 10
}

#[derive(Default)]
pub struct Counters {
    pub opens: AtomicUsize,
    pub frames_fetched: AtomicUsize,
    pub decodes: AtomicUsize,
    pub bitmaps_created: AtomicUsize,
}

impl Counters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn frames_fetched(&self) -> usize {
        self.frames_fetched.load(Ordering::SeqCst)
    }

    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

/// How the fake engine answers color transform requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransformMode {
    Accept,
    /// Reports the embedded profile as malformed.
    BadProfile,
    /// Only transforms 32bpp input.
    Only32bpp,
    Refuse,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorOp {
    Convert(PixelFormat),
    Transform(PixelFormat),
    Refused(PixelFormat),
}

/// Engine over [`fake_image`] containers that counts every native call of interest
/// and remembers the streams it was handed.
#[derive(Clone)]
pub struct FakeEngine {
    pub counters: Arc<Counters>,
    streams: Arc<Mutex<Vec<BackingStream>>>,
    format: ContainerFormat,
    raw_format: PixelFormat,
    profile: Option<ColorContext>,
    transform: TransformMode,
    converts: bool,
    color_ops: Arc<Mutex<Vec<ColorOp>>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::with_format(ContainerFormat::Tiff)
    }

    pub fn with_format(format: ContainerFormat) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            streams: Arc::new(Mutex::new(Vec::new())),
            format,
            raw_format: PixelFormat::Pbgra32,
            profile: None,
            transform: TransformMode::Refuse,
            converts: false,
            color_ops: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Frames decode to `format`: `Pbgra32` by default, or `Rgb24`.
    pub fn with_raw_format(mut self, format: PixelFormat) -> Self {
        assert!(matches!(format, PixelFormat::Pbgra32 | PixelFormat::Rgb24));
        self.raw_format = format;
        self
    }

    /// Every frame reports `profile` as its embedded color context.
    pub fn with_profile(mut self, profile: ColorContext) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_transform(mut self, mode: TransformMode) -> Self {
        self.transform = mode;
        self
    }

    /// Enables 24bpp to 32bpp format conversion.
    pub fn with_conversions(mut self) -> Self {
        self.converts = true;
        self
    }

    pub fn last_stream(&self) -> Option<BackingStream> {
        self.streams.lock().unwrap().last().cloned()
    }

    pub fn color_ops(&self) -> Vec<ColorOp> {
        self.color_ops.lock().unwrap().clone()
    }
}

#[derive(Clone, Copy)]
struct Header {
    frames: u32,
    width: u32,
    height: u32,
}

fn parse_pixels(bytes: &[u8]) -> NativeResult<Header> {
    let header = parse(bytes)?;
    if bytes.get(7) == Some(&CORRUPT) {
        return Err(NativeError::Corrupt("pixel data is damaged".into()));
    }
    Ok(header)
}

fn parse(bytes: &[u8]) -> NativeResult<Header> {
    if bytes.len() < 7 || &bytes[..4] != MAGIC {
        return Err(NativeError::Corrupt("not a fake container".into()));
    }
    Ok(Header {
        frames: bytes[4] as u32,
        width: bytes[5] as u32,
        height: bytes[6] as u32,
    })
}

#[derive(Clone)]
enum Data {
    Memory(Arc<[u8]>),
    Stream(BackingStream),
}

impl Data {
    fn bytes(&self) -> NativeResult<Arc<[u8]>> {
        match self {
            Data::Memory(bytes) => Ok(bytes.clone()),
            Data::Stream(stream) => Ok(stream.read_all()?.into()),
        }
    }
}

struct FakeContainer {
    header: Header,
    data: Data,
}

struct FakeFrame {
    index: u32,
    header: Header,
    data: Data,
}

struct FakeBitmap {
    width: u32,
    height: u32,
    format: PixelFormat,
    stride: usize,
    pixels: Arc<[u8]>,
}

fn info(width: u32, height: u32, format: PixelFormat) -> SourceInfo {
    SourceInfo {
        width,
        height,
        format,
        resolution: Resolution::default(),
    }
}

impl FakeEngine {
    fn decode(&self, frame: &FakeFrame) -> NativeResult<FakeBitmap> {
        self.counters.decodes.fetch_add(1, Ordering::SeqCst);
        let header = parse_pixels(&frame.data.bytes()?)?;
        let shade = frame_shade(frame.index);
        let pixel: &[u8] = match self.raw_format {
            PixelFormat::Rgb24 => &[shade, shade, shade],
            _ => &[shade, shade, shade, 255],
        };
        let pixels = pixel.repeat((header.width * header.height) as usize);
        Ok(FakeBitmap {
            width: header.width,
            height: header.height,
            format: self.raw_format,
            stride: header.width as usize * pixel.len(),
            pixels: pixels.into(),
        })
    }

    /// Rewrites every pixel of `bitmap` through `map`, which sees the colour channels
    /// and returns the 4-byte result.
    fn map_pixels(
        bitmap: &FakeBitmap,
        format: PixelFormat,
        map: impl Fn(&[u8]) -> [u8; 4],
    ) -> FakeBitmap {
        let bytes_per_pixel = (bitmap.format.bits_per_pixel() / 8) as usize;
        let pixels: Vec<u8> = bitmap
            .pixels
            .chunks(bytes_per_pixel)
            .flat_map(|pixel| map(pixel))
            .collect();
        FakeBitmap {
            width: bitmap.width,
            height: bitmap.height,
            format,
            stride: bitmap.width as usize * 4,
            pixels: pixels.into(),
        }
    }

    fn pixels(&self, source: &NativeHandle) -> NativeResult<FakeBitmap> {
        if let Some(frame) = source.downcast_ref::<FakeFrame>() {
            return self.decode(frame);
        }
        if let Some(bitmap) = source.downcast_ref::<FakeBitmap>() {
            return Ok(FakeBitmap {
                width: bitmap.width,
                height: bitmap.height,
                format: bitmap.format,
                stride: bitmap.stride,
                pixels: bitmap.pixels.clone(),
            });
        }
        Err(NativeError::Engine("handle has no pixels".into()))
    }
}

impl CodecEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    fn probe(&self, header: &[u8]) -> ContainerFormat {
        if header.starts_with(MAGIC) {
            self.format
        } else {
            ContainerFormat::Unknown
        }
    }

    fn open(
        &self,
        stream: &BackingStream,
        format: ContainerFormat,
        hint: CacheHint,
    ) -> NativeResult<NativeHandle> {
        if format == ContainerFormat::Unknown {
            return Err(NativeError::Unsupported("unknown content".into()));
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.streams.lock().unwrap().push(stream.clone());

        let bytes: Arc<[u8]> = stream.read_all()?.into();
        let header = parse(&bytes)?;
        let data = match hint {
            CacheHint::OnLoad => Data::Memory(bytes),
            _ => Data::Stream(stream.clone()),
        };
        Ok(NativeHandle::new(
            HandleKind::Container,
            FakeContainer { header, data },
        ))
    }

    fn frame_count(&self, container: &NativeHandle) -> NativeResult<u32> {
        container
            .downcast_ref::<FakeContainer>()
            .map(|c| c.header.frames)
            .ok_or_else(|| NativeError::Engine("not a container".into()))
    }

    fn get_frame(&self, container: &NativeHandle, index: u32) -> NativeResult<NativeHandle> {
        let container = container
            .downcast_ref::<FakeContainer>()
            .ok_or_else(|| NativeError::Engine("not a container".into()))?;
        if index >= container.header.frames {
            return Err(NativeError::Engine(format!("no frame {index}")));
        }
        self.counters.frames_fetched.fetch_add(1, Ordering::SeqCst);
        Ok(NativeHandle::new(
            HandleKind::Frame,
            FakeFrame {
                index,
                header: container.header,
                data: container.data.clone(),
            },
        ))
    }

    fn get_thumbnail(&self, _source: &NativeHandle) -> NativeResult<NativeHandle> {
        Err(NativeError::NotPresent)
    }

    fn get_preview(&self, _container: &NativeHandle) -> NativeResult<NativeHandle> {
        Err(NativeError::NotPresent)
    }

    fn get_metadata(&self, source: &NativeHandle) -> NativeResult<BitmapMetadata> {
        match source.downcast_ref::<FakeFrame>() {
            Some(frame) => {
                Ok(BitmapMetadata::new("fake").with_entry("/fake/index", frame.index.to_string()))
            }
            None => Err(NativeError::NotPresent),
        }
    }

    fn get_color_contexts(&self, source: &NativeHandle) -> NativeResult<Vec<ColorContext>> {
        match (&self.profile, source.downcast_ref::<FakeFrame>()) {
            (Some(profile), Some(_)) => Ok(vec![profile.clone()]),
            _ => Err(NativeError::NotPresent),
        }
    }

    fn get_palette(&self, _source: &NativeHandle) -> NativeResult<Palette> {
        Err(NativeError::NotPresent)
    }

    fn describe(&self, source: &NativeHandle) -> NativeResult<SourceInfo> {
        if let Some(frame) = source.downcast_ref::<FakeFrame>() {
            return Ok(info(frame.header.width, frame.header.height, self.raw_format));
        }
        if let Some(bitmap) = source.downcast_ref::<FakeBitmap>() {
            return Ok(info(bitmap.width, bitmap.height, bitmap.format));
        }
        Err(NativeError::Engine("handle cannot be described".into()))
    }

    fn copy_pixels(
        &self,
        source: &NativeHandle,
        rect: PixelRect,
        stride: usize,
        buffer: &mut [u8],
    ) -> NativeResult<()> {
        let bitmap = self.pixels(source)?;
        let bytes_per_pixel = (bitmap.format.bits_per_pixel() / 8) as usize;
        let row_bytes = rect.width as usize * bytes_per_pixel;
        for row in 0..rect.height as usize {
            let src = (rect.y as usize + row) * bitmap.stride + rect.x as usize * bytes_per_pixel;
            let dst = row * stride;
            buffer[dst..dst + row_bytes].copy_from_slice(&bitmap.pixels[src..src + row_bytes]);
        }
        Ok(())
    }

    fn create_format_converter(
        &self,
        source: &NativeHandle,
        format: PixelFormat,
        _palette: Option<&Palette>,
    ) -> NativeResult<NativeHandle> {
        if !self.converts || format.bits_per_pixel() != 32 {
            return Err(NativeError::Unsupported(format!("fake engine cannot convert to {format}")));
        }
        let bitmap = self.pixels(source)?;
        self.color_ops.lock().unwrap().push(ColorOp::Convert(format));
        let converted = Self::map_pixels(&bitmap, format, |pixel| {
            [pixel[0], pixel[1], pixel[2], pixel.get(3).copied().unwrap_or(255)]
        });
        Ok(NativeHandle::new(HandleKind::Bitmap, converted))
    }

    fn create_color_transform(
        &self,
        source: &NativeHandle,
        _from: &ColorContext,
        _to: &ColorContext,
        format: PixelFormat,
    ) -> NativeResult<NativeHandle> {
        let refused = match self.transform {
            TransformMode::Accept => None,
            TransformMode::BadProfile => {
                return Err(NativeError::BadColorProfile("truncated header".into()));
            }
            TransformMode::Only32bpp if format.bits_per_pixel() == 32 => None,
            TransformMode::Only32bpp | TransformMode::Refuse => {
                Some(NativeError::Unsupported(format!("no transform for {format}")))
            }
        };
        if let Some(err) = refused {
            self.color_ops.lock().unwrap().push(ColorOp::Refused(format));
            return Err(err);
        }
        let bitmap = self.pixels(source)?;
        self.color_ops.lock().unwrap().push(ColorOp::Transform(format));
        let output = if bitmap.format.bits_per_pixel() == 32 {
            bitmap.format
        } else {
            PixelFormat::Bgr32
        };
        let transformed = Self::map_pixels(&bitmap, output, |pixel| {
            [pixel[0] + 1, pixel[1] + 1, pixel[2] + 1, pixel.get(3).copied().unwrap_or(255)]
        });
        Ok(NativeHandle::new(HandleKind::Bitmap, transformed))
    }

    fn create_bitmap_from_source(
        &self,
        source: &NativeHandle,
        _hint: CacheHint,
    ) -> NativeResult<NativeHandle> {
        self.counters.bitmaps_created.fetch_add(1, Ordering::SeqCst);
        Ok(NativeHandle::new(HandleKind::Bitmap, self.pixels(source)?))
    }

    fn create_bitmap_from_memory(&self, pixels: &PixelBuffer) -> NativeResult<NativeHandle> {
        Ok(NativeHandle::new(
            HandleKind::Bitmap,
            FakeBitmap {
                width: pixels.width,
                height: pixels.height,
                format: pixels.format,
                stride: pixels.stride,
                pixels: pixels.data.clone(),
            },
        ))
    }
}

/// Compositor adapter that records every resource it is handed.
#[derive(Default)]
pub struct RecordingAdapter {
    updates: Mutex<Vec<(u64, u32, u32)>>,
}

impl RecordingAdapter {
    /// `(version, width, height)` of each update, oldest first.
    pub fn updates(&self) -> Vec<(u64, u32, u32)> {
        self.updates.lock().unwrap().clone()
    }
}

impl CompositorAdapter for RecordingAdapter {
    fn update_resource(&self, resource: &RenderResource) {
        self.updates
            .lock()
            .unwrap()
            .push((resource.version, resource.width, resource.height));
    }
}

pub struct PendingDownload {
    pub uri: Option<String>,
    pub cache_policy: DownloadCachePolicy,
    pub stream: Option<Box<dyn Read + Send>>,
    pub sender: DownloadSender,
}

/// Downloader that parks every request until the test completes or fails it.
#[derive(Clone, Default)]
pub struct ManualDownloader {
    pending: Arc<Mutex<Vec<PendingDownload>>>,
}

impl ManualDownloader {
    pub fn take(&self) -> Option<PendingDownload> {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            None
        } else {
            Some(pending.remove(0))
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl Downloader for ManualDownloader {
    fn begin_download(&self, request: DownloadRequest, events: DownloadSender) {
        self.pending.lock().unwrap().push(PendingDownload {
            uri: request.uri.map(|uri| uri.to_string()),
            cache_policy: request.cache_policy,
            stream: request.existing_stream,
            sender: events,
        });
    }
}

pub fn fake_imaging() -> (Imaging, FakeEngine, ManualDownloader) {
    let engine = FakeEngine::new();
    let downloader = ManualDownloader::default();
    let imaging = Imaging::builder(engine.clone())
        .downloader(downloader.clone())
        .build();
    (imaging, engine, downloader)
}

/// Writes `bytes` to a temp file named `name`, returning the directory guard too.
pub fn temp_file(name: &str, bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    (dir, path)
}
