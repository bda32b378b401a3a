mod common;

use common::{
    FakeEngine, RecordingAdapter, corrupt_image, fake_image, fake_imaging, frame_shade,
};
use imaging::{
    BitmapEvent, BitmapImage, BitmapPhase, CacheOption, CreateOptions, Decoder, ImageEngine,
    Imaging, ImagingError, PixelBuffer, PixelFormat, PixelRect,
};
use std::sync::{Arc, Barrier};
use std::thread;

fn engine_imaging() -> Imaging {
    Imaging::new(ImageEngine::new())
}

fn gradient(width: u32, height: u32) -> PixelBuffer {
    let data: Vec<u8> = (0..width * height * 4).map(|v| v as u8).collect();
    PixelBuffer::new(width, height, PixelFormat::Bgra32, data)
}

fn read_all(image: &BitmapImage) -> Vec<u8> {
    let width = image.pixel_width().unwrap();
    let height = image.pixel_height().unwrap();
    let stride = image.format().unwrap().min_stride(width);
    let mut out = vec![0u8; stride * height as usize];
    image.copy_pixels(PixelRect::EMPTY, &mut out, stride, 0).unwrap();
    out
}

#[test]
fn test_preserved_buffer_round_trips() {
    let imaging = engine_imaging();
    let pixels = gradient(3, 2);
    let image = BitmapImage::create_in(
        &imaging,
        pixels.clone(),
        CreateOptions::PRESERVE_PIXEL_FORMAT,
        CacheOption::OnLoad,
    )
    .unwrap();

    assert_eq!(image.phase(), BitmapPhase::Finalized);
    assert_eq!(image.format().unwrap(), PixelFormat::Bgra32);
    assert_eq!(read_all(&image), pixels.data.to_vec());
    assert!(image.is_source_cached());
    assert_eq!(image.dpi_x().unwrap(), 96.0);
}

#[test]
fn test_padded_stride_round_trips() {
    let imaging = engine_imaging();
    let mut data = vec![0u8; 2 * 12];
    data[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    data[12..20].copy_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16]);
    let pixels = PixelBuffer::new(2, 2, PixelFormat::Bgra32, data).with_stride(12);

    let image = BitmapImage::create_in(&imaging, pixels, CreateOptions::PRESERVE_PIXEL_FORMAT, CacheOption::Default).unwrap();
    assert_eq!(read_all(&image), (1..=16).collect::<Vec<u8>>());
}

#[test]
fn test_truecolor_maps_to_render_format() {
    let imaging = engine_imaging();
    let rgb = PixelBuffer::new(1, 1, PixelFormat::Rgb24, vec![10u8, 20, 30]);
    let image = BitmapImage::create_in(&imaging, rgb.clone(), CreateOptions::NONE, CacheOption::OnLoad).unwrap();
    assert_eq!(image.format().unwrap(), PixelFormat::Bgr32);
    assert_eq!(&read_all(&image)[..3], &[30, 20, 10]);

    let preserved = BitmapImage::create_in(&imaging, rgb, CreateOptions::PRESERVE_PIXEL_FORMAT, CacheOption::OnLoad).unwrap();
    assert_eq!(preserved.format().unwrap(), PixelFormat::Rgb24);
}

#[test]
fn test_delay_creation_defers_until_first_read() {
    let imaging = engine_imaging();
    let image = BitmapImage::create_in(&imaging, gradient(2, 2), CreateOptions::DELAY_CREATION, CacheOption::Default).unwrap();

    assert_eq!(image.phase(), BitmapPhase::DelayedPending);
    assert!(!image.is_creation_complete());
    assert_eq!(image.creation_count(), 0);

    assert_eq!(image.pixel_width().unwrap(), 2);
    assert_eq!(image.phase(), BitmapPhase::Finalized);
    assert!(image.is_creation_complete());
    image.finalize().unwrap();
    assert_eq!(image.creation_count(), 1);
}

#[test]
fn test_delayed_finalize_runs_on_one_thread() {
    let imaging = engine_imaging();
    let image = BitmapImage::create_in(&imaging, gradient(16, 16), CreateOptions::DELAY_CREATION, CacheOption::OnLoad).unwrap();
    let barrier = Arc::new(Barrier::new(6));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let image = image.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                image.pixel_height().unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 16);
    }
    assert_eq!(image.creation_count(), 1);
}

#[test]
fn test_init_protocol_is_enforced() {
    let imaging = engine_imaging();
    let image = BitmapImage::with_imaging(&imaging);
    assert!(matches!(image.set_source(gradient(1, 1)), Err(ImagingError::InvalidOperation(_))));
    assert!(matches!(image.pixel_width(), Err(ImagingError::InvalidOperation(_))));

    image.begin_init().unwrap();
    assert!(matches!(image.begin_init(), Err(ImagingError::InvalidOperation(_))));
    assert!(matches!(image.end_init(), Err(ImagingError::InvalidOperation(_))));

    image.set_source(gradient(1, 1)).unwrap();
    image.end_init().unwrap();
    assert!(matches!(
        image.set_cache_option(CacheOption::None),
        Err(ImagingError::InvalidOperation(_))
    ));
}

#[test]
fn test_invalid_buffers_are_rejected() {
    let imaging = engine_imaging();
    let short = PixelBuffer::new(4, 4, PixelFormat::Bgra32, vec![0u8; 10]);
    let err = BitmapImage::create_in(&imaging, short, CreateOptions::NONE, CacheOption::Default).unwrap_err();
    assert!(matches!(err, ImagingError::InvalidArgument(_)));

    let image = BitmapImage::create_in(&imaging, gradient(2, 2), CreateOptions::NONE, CacheOption::Default).unwrap();
    let mut out = vec![0u8; 16];
    assert!(matches!(
        image.copy_pixels(PixelRect::EMPTY, &mut out, 4, 0),
        Err(ImagingError::InvalidArgument(_))
    ));
    assert!(matches!(
        image.copy_pixels(PixelRect::new(0, 0, 3, 1), &mut out, 12, 0),
        Err(ImagingError::InvalidArgument(_))
    ));
}

#[test]
fn test_source_rect_clips() {
    let imaging = engine_imaging();
    let image = BitmapImage::with_imaging(&imaging);
    image.begin_init().unwrap();
    image.set_source(gradient(4, 4)).unwrap();
    image.set_create_options(CreateOptions::PRESERVE_PIXEL_FORMAT).unwrap();
    image.set_source_rect(PixelRect::new(1, 2, 2, 1)).unwrap();
    image.end_init().unwrap();

    assert_eq!((image.pixel_width().unwrap(), image.pixel_height().unwrap()), (2, 1));
    // Row 2 starts at byte 32; column 1 adds 4
    assert_eq!(read_all(&image), (36..44).collect::<Vec<u8>>());
}

#[test]
fn test_out_of_bounds_source_rect_is_an_argument_error() {
    let imaging = engine_imaging();
    let image = BitmapImage::with_imaging(&imaging);
    image.begin_init().unwrap();
    image.set_source(gradient(2, 2)).unwrap();
    image.set_source_rect(PixelRect::new(1, 1, 4, 4)).unwrap();
    assert!(matches!(image.end_init(), Err(ImagingError::InvalidArgument(_))));
}

#[test]
fn test_decode_size_keeps_aspect_ratio() {
    let imaging = engine_imaging();
    let image = BitmapImage::with_imaging(&imaging);
    image.begin_init().unwrap();
    image.set_source(gradient(8, 4)).unwrap();
    image.set_decode_pixel_width(4).unwrap();
    image.end_init().unwrap();

    assert_eq!(image.pixel_width().unwrap(), 4);
    assert_eq!(image.pixel_height().unwrap(), 2);
}

#[test]
fn test_replacing_pixels_notifies_compositor() {
    let imaging = engine_imaging();
    let image = BitmapImage::create_in(&imaging, gradient(2, 2), CreateOptions::NONE, CacheOption::Default).unwrap();
    let adapter = Arc::new(RecordingAdapter::default());
    image.attach_compositor(adapter.clone()).unwrap();
    let mut events = image.subscribe();

    image.replace_pixels(gradient(3, 1)).unwrap();

    assert_eq!(adapter.updates(), vec![(0, 2, 2), (1, 3, 1)]);
    assert!(matches!(events.try_recv(), Ok(BitmapEvent::ContentInvalidated)));
    assert_eq!(image.pixel_width().unwrap(), 3);
    assert_eq!(image.creation_count(), 2);
}

#[test]
fn test_failed_uncached_read_swaps_in_a_placeholder() {
    let (imaging, _, _) = fake_imaging();
    let decoder = Decoder::create_in(&imaging, corrupt_image(1, 3, 2), CreateOptions::NONE, CacheOption::None).unwrap();
    let image = BitmapImage::from_frame(decoder.frame(0).unwrap(), CreateOptions::NONE, CacheOption::None).unwrap();
    let adapter = Arc::new(RecordingAdapter::default());
    image.attach_compositor(adapter.clone()).unwrap();
    let mut events = image.subscribe();

    let mut buffer = vec![0xaau8; 24];
    image.copy_pixels(PixelRect::EMPTY, &mut buffer, 12, 0).unwrap();

    assert!(buffer.iter().all(|byte| *byte == 0));
    assert!(matches!(events.try_recv(), Ok(BitmapEvent::DecodeFailed(_))));
    assert_eq!(image.pixel_width().unwrap(), 1);
    assert_eq!(image.version(), 1);
    assert_eq!(adapter.updates(), vec![(0, 3, 2), (1, 1, 1)]);
}

#[test]
fn test_replacing_pixels_without_compositor_is_lazy() {
    let imaging = engine_imaging();
    let image = BitmapImage::create_in(&imaging, gradient(2, 2), CreateOptions::NONE, CacheOption::Default).unwrap();
    image.replace_pixels(gradient(1, 1)).unwrap();

    assert_eq!(image.phase(), BitmapPhase::DelayedPending);
    assert!(!image.is_creation_complete());
    assert_eq!(image.pixel_width().unwrap(), 1);
    assert_eq!(image.version(), 1);
}

#[test]
fn test_frame_backed_images_cannot_replace_pixels() {
    let (imaging, _, _) = fake_imaging();
    let decoder = Decoder::create_in(&imaging, fake_image(1, 2, 2), CreateOptions::NONE, CacheOption::Default).unwrap();
    let image = BitmapImage::from_frame(decoder.frame(0).unwrap(), CreateOptions::NONE, CacheOption::Default).unwrap();

    assert_eq!(image.pixel_width().unwrap(), 2);
    assert_eq!(read_all(&image)[0], frame_shade(0));
    assert!(matches!(
        image.replace_pixels(gradient(1, 1)),
        Err(ImagingError::InvalidOperation(_))
    ));
}

#[test]
fn test_frame_backed_image_reuses_cached_frame() {
    let (imaging, engine, _) = fake_imaging();
    let decoder = Decoder::create_in(&imaging, fake_image(1, 2, 2), CreateOptions::NONE, CacheOption::OnLoad).unwrap();
    let before = engine.counters.decodes();

    let image = BitmapImage::from_frame(decoder.frame(0).unwrap(), CreateOptions::NONE, CacheOption::OnLoad).unwrap();
    read_all(&image);
    assert!(image.is_source_cached());
    assert_eq!(engine.counters.decodes(), before);
}

#[test]
fn test_uri_source_resolves_first_frame() {
    let (imaging, _, _) = fake_imaging();
    let (_dir, path) = common::temp_file("uri.fake", &fake_image(2, 3, 1));

    let image = BitmapImage::create_in(
        &imaging,
        path.to_string_lossy().into_owned(),
        CreateOptions::NONE,
        CacheOption::Default,
    )
    .unwrap();
    assert_eq!(image.pixel_width().unwrap(), 3);
    assert_eq!(image.source_frame().unwrap().index(), Some(0));
}

#[test]
fn test_failed_conversion_recovers_with_placeholder() {
    // The fake engine cannot convert, so a Bgr24 buffer fails to reach Bgr32
    let imaging = Imaging::new(FakeEngine::new());
    let image = BitmapImage::with_imaging(&imaging);
    let mut events = image.subscribe();
    image.begin_init().unwrap();
    image
        .set_source(PixelBuffer::new(2, 1, PixelFormat::Bgr24, vec![0u8; 6]))
        .unwrap();
    image.end_init().unwrap();

    assert_eq!(image.pixel_width().unwrap(), 1);
    assert_eq!(image.pixel_height().unwrap(), 1);
    assert_eq!(image.format().unwrap(), PixelFormat::Pbgra32);
    assert!(matches!(events.try_recv(), Ok(BitmapEvent::DecodeFailed(_))));
}
