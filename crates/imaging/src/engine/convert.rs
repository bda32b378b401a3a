//! Row-level pixel conversion through a straight-alpha RGBA8 intermediate, and
//! rectangle copies that understand sub-byte packed formats.

use crate::native::{NativeError, NativeResult};
use imaging_types::{Palette, PaletteColor, PixelFormat, PixelRect};

pub(crate) type Rgba8 = [u8; 4];

/// Formats [`write_row`] can produce.
pub(crate) fn can_write(format: PixelFormat) -> bool {
    !matches!(
        format,
        PixelFormat::Gray16
            | PixelFormat::Rgb48
            | PixelFormat::Rgba64
            | PixelFormat::Cmyk32
            | PixelFormat::Rgba128Float
    )
}

fn get_bits(row: &[u8], index: usize, bpp: usize) -> usize {
    let bit = index * bpp;
    let byte = row[bit / 8];
    let shift = 8 - bpp - (bit % 8);
    ((byte >> shift) as usize) & ((1 << bpp) - 1)
}

fn set_bits(row: &mut [u8], index: usize, bpp: usize, value: usize) {
    let bit = index * bpp;
    let shift = 8 - bpp - (bit % 8);
    let mask = (((1usize << bpp) - 1) << shift) as u8;
    let byte = &mut row[bit / 8];
    *byte = (*byte & !mask) | (((value << shift) as u8) & mask);
}

fn le16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn expand5(v: u16) -> u8 {
    let v = (v & 0x1f) as u8;
    (v << 3) | (v >> 2)
}

fn expand6(v: u16) -> u8 {
    let v = (v & 0x3f) as u8;
    (v << 2) | (v >> 4)
}

fn premultiply(c: u8, a: u8) -> u8 {
    ((c as u16 * a as u16 + 127) / 255) as u8
}

fn unpremultiply(c: u8, a: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    ((c as u32 * 255 + a as u32 / 2) / a as u32).min(255) as u8
}

fn luma(px: Rgba8) -> u8 {
    ((px[0] as u32 * 299 + px[1] as u32 * 587 + px[2] as u32 * 114) / 1000) as u8
}

fn palette_entry(palette: Option<&Palette>, index: usize) -> NativeResult<Rgba8> {
    let palette = palette.ok_or_else(|| NativeError::Corrupt("indexed pixels without a palette".into()))?;
    let PaletteColor { r, g, b, a } = palette.get(index);
    Ok([r, g, b, a])
}

fn nearest_palette_index(palette: &Palette, px: Rgba8) -> usize {
    palette
        .colors
        .iter()
        .enumerate()
        .min_by_key(|(_, c)| {
            let d = |x: u8, y: u8| (x as i32 - y as i32).pow(2);
            d(c.r, px[0]) + d(c.g, px[1]) + d(c.b, px[2]) + d(c.a, px[3])
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Decodes `width` pixels of `row` into straight-alpha RGBA8.
pub(crate) fn read_row(
    format: PixelFormat,
    palette: Option<&Palette>,
    row: &[u8],
    width: usize,
    out: &mut Vec<Rgba8>,
) -> NativeResult<()> {
    out.clear();
    if row.len() < format.min_stride(width as u32) {
        return Err(NativeError::Corrupt("row shorter than its pixel width".into()));
    }

    for x in 0..width {
        let px = match format {
            PixelFormat::Indexed1
            | PixelFormat::Indexed2
            | PixelFormat::Indexed4
            | PixelFormat::Indexed8 => {
                let bpp = format.bits_per_pixel() as usize;
                palette_entry(palette, get_bits(row, x, bpp))?
            }
            PixelFormat::BlackWhite | PixelFormat::Gray2 | PixelFormat::Gray4 => {
                let bpp = format.bits_per_pixel() as usize;
                let max = (1usize << bpp) - 1;
                let v = (get_bits(row, x, bpp) * 255 / max) as u8;
                [v, v, v, 255]
            }
            PixelFormat::Gray8 => [row[x], row[x], row[x], 255],
            PixelFormat::Gray16 => {
                let v = (le16(row, x * 2) >> 8) as u8;
                [v, v, v, 255]
            }
            PixelFormat::Bgr555 => {
                let v = le16(row, x * 2);
                [expand5(v >> 10), expand5(v >> 5), expand5(v), 255]
            }
            PixelFormat::Bgr565 => {
                let v = le16(row, x * 2);
                [expand5(v >> 11), expand6(v >> 5), expand5(v), 255]
            }
            PixelFormat::Bgr24 => [row[x * 3 + 2], row[x * 3 + 1], row[x * 3], 255],
            PixelFormat::Rgb24 => [row[x * 3], row[x * 3 + 1], row[x * 3 + 2], 255],
            PixelFormat::Bgr32 => [row[x * 4 + 2], row[x * 4 + 1], row[x * 4], 255],
            PixelFormat::Bgra32 => [row[x * 4 + 2], row[x * 4 + 1], row[x * 4], row[x * 4 + 3]],
            PixelFormat::Pbgra32 => {
                let a = row[x * 4 + 3];
                [
                    unpremultiply(row[x * 4 + 2], a),
                    unpremultiply(row[x * 4 + 1], a),
                    unpremultiply(row[x * 4], a),
                    a,
                ]
            }
            PixelFormat::Rgba32 => [row[x * 4], row[x * 4 + 1], row[x * 4 + 2], row[x * 4 + 3]],
            PixelFormat::Rgb48 => [
                (le16(row, x * 6) >> 8) as u8,
                (le16(row, x * 6 + 2) >> 8) as u8,
                (le16(row, x * 6 + 4) >> 8) as u8,
                255,
            ],
            PixelFormat::Rgba64 => [
                (le16(row, x * 8) >> 8) as u8,
                (le16(row, x * 8 + 2) >> 8) as u8,
                (le16(row, x * 8 + 4) >> 8) as u8,
                (le16(row, x * 8 + 6) >> 8) as u8,
            ],
            PixelFormat::Cmyk32 => {
                let k = 255 - row[x * 4 + 3] as u32;
                let ch = |c: u8| ((255 - c as u32) * k / 255) as u8;
                [ch(row[x * 4]), ch(row[x * 4 + 1]), ch(row[x * 4 + 2]), 255]
            }
            PixelFormat::Rgba128Float => {
                let mut px = [0u8; 4];
                for (c, slot) in px.iter_mut().enumerate() {
                    let at = x * 16 + c * 4;
                    let v = f32::from_le_bytes([row[at], row[at + 1], row[at + 2], row[at + 3]]);
                    *slot = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
                }
                px
            }
        };
        out.push(px);
    }
    Ok(())
}

/// Encodes straight-alpha RGBA8 pixels into `out` using `format`.
pub(crate) fn write_row(
    format: PixelFormat,
    palette: Option<&Palette>,
    pixels: &[Rgba8],
    out: &mut [u8],
) -> NativeResult<()> {
    if out.len() < format.min_stride(pixels.len() as u32) {
        return Err(NativeError::Engine("destination row too short".into()));
    }

    for (x, px) in pixels.iter().copied().enumerate() {
        match format {
            PixelFormat::Indexed1
            | PixelFormat::Indexed2
            | PixelFormat::Indexed4
            | PixelFormat::Indexed8 => {
                let palette = palette.ok_or_else(|| {
                    NativeError::Unsupported(format!("{} output needs a palette", format))
                })?;
                let index = nearest_palette_index(palette, px);
                set_bits(out, x, format.bits_per_pixel() as usize, index);
            }
            PixelFormat::BlackWhite | PixelFormat::Gray2 | PixelFormat::Gray4 => {
                let bpp = format.bits_per_pixel() as usize;
                let max = (1usize << bpp) - 1;
                let level = (luma(px) as usize * max + 127) / 255;
                set_bits(out, x, bpp, level);
            }
            PixelFormat::Gray8 => out[x] = luma(px),
            PixelFormat::Bgr555 => {
                let v = ((px[0] as u16 >> 3) << 10) | ((px[1] as u16 >> 3) << 5) | (px[2] as u16 >> 3);
                out[x * 2..x * 2 + 2].copy_from_slice(&v.to_le_bytes());
            }
            PixelFormat::Bgr565 => {
                let v = ((px[0] as u16 >> 3) << 11) | ((px[1] as u16 >> 2) << 5) | (px[2] as u16 >> 3);
                out[x * 2..x * 2 + 2].copy_from_slice(&v.to_le_bytes());
            }
            PixelFormat::Bgr24 => out[x * 3..x * 3 + 3].copy_from_slice(&[px[2], px[1], px[0]]),
            PixelFormat::Rgb24 => out[x * 3..x * 3 + 3].copy_from_slice(&[px[0], px[1], px[2]]),
            PixelFormat::Bgr32 => out[x * 4..x * 4 + 4].copy_from_slice(&[px[2], px[1], px[0], 255]),
            PixelFormat::Bgra32 => {
                out[x * 4..x * 4 + 4].copy_from_slice(&[px[2], px[1], px[0], px[3]])
            }
            PixelFormat::Pbgra32 => out[x * 4..x * 4 + 4].copy_from_slice(&[
                premultiply(px[2], px[3]),
                premultiply(px[1], px[3]),
                premultiply(px[0], px[3]),
                px[3],
            ]),
            PixelFormat::Rgba32 => out[x * 4..x * 4 + 4].copy_from_slice(&px),
            other => {
                return Err(NativeError::Unsupported(format!(
                    "conversion into {} is not available",
                    other
                )));
            }
        }
    }
    Ok(())
}

/// Copies `rect` out of a tightly described source raster into `dst`, one row per
/// `dst_stride` bytes, starting at bit 0 of each destination row.
pub(crate) fn copy_rect(
    src: &[u8],
    src_stride: usize,
    format: PixelFormat,
    rect: PixelRect,
    dst: &mut [u8],
    dst_stride: usize,
) -> NativeResult<()> {
    let bpp = format.bits_per_pixel() as usize;
    let row_bytes = format.min_stride(rect.width);

    for row in 0..rect.height as usize {
        let src_row_start = (rect.y as usize + row) * src_stride;
        let dst_row_start = row * dst_stride;
        if dst_row_start + row_bytes > dst.len() {
            return Err(NativeError::Engine("destination buffer too small".into()));
        }

        if bpp % 8 == 0 {
            let start = src_row_start + rect.x as usize * bpp / 8;
            let src_row = src
                .get(start..start + row_bytes)
                .ok_or_else(|| NativeError::Corrupt("source raster truncated".into()))?;
            dst[dst_row_start..dst_row_start + row_bytes].copy_from_slice(src_row);
        } else {
            let src_row = src
                .get(src_row_start..)
                .ok_or_else(|| NativeError::Corrupt("source raster truncated".into()))?;
            if src_row.len() < format.min_stride(rect.x + rect.width) {
                return Err(NativeError::Corrupt("source raster truncated".into()));
            }
            let dst_row = &mut dst[dst_row_start..dst_row_start + row_bytes];
            for x in 0..rect.width as usize {
                let value = get_bits(src_row, rect.x as usize + x, bpp);
                set_bits(dst_row, x, bpp, value);
            }
        }
    }
    Ok(())
}

/// Converts a whole raster between formats.
#[allow(clippy::too_many_arguments)]
pub(crate) fn convert_rows(
    src: &[u8],
    src_stride: usize,
    src_format: PixelFormat,
    src_palette: Option<&Palette>,
    width: u32,
    height: u32,
    dst: &mut [u8],
    dst_stride: usize,
    dst_format: PixelFormat,
    dst_palette: Option<&Palette>,
) -> NativeResult<()> {
    let mut scratch = Vec::with_capacity(width as usize);
    for y in 0..height as usize {
        let src_row = src
            .get(y * src_stride..)
            .ok_or_else(|| NativeError::Corrupt("source raster truncated".into()))?;
        read_row(src_format, src_palette, src_row, width as usize, &mut scratch)?;
        let dst_row = dst
            .get_mut(y * dst_stride..)
            .ok_or_else(|| NativeError::Engine("destination buffer too small".into()))?;
        write_row(dst_format, dst_palette, &scratch, dst_row)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_premultiply_round_trip_through_pbgra() {
        let src = [[200u8, 100, 50, 128]];
        let mut packed = [0u8; 4];
        write_row(PixelFormat::Pbgra32, None, &src, &mut packed).unwrap();
        assert_eq!(packed[3], 128);
        assert_eq!(packed[2], premultiply(200, 128));

        let mut back = Vec::new();
        read_row(PixelFormat::Pbgra32, None, &packed, 1, &mut back).unwrap();
        assert!((back[0][0] as i32 - 200).abs() <= 1);
        assert!((back[0][1] as i32 - 100).abs() <= 1);
    }

    #[test]
    fn test_indexed_rows_use_palette() {
        let palette = Palette::new(vec![
            PaletteColor::opaque(0, 0, 0),
            PaletteColor::opaque(255, 0, 0),
        ]);
        // 0b1010_0000 -> pixels 1, 0, 1, 0
        let row = [0b1010_0000u8];
        let mut px = Vec::new();
        read_row(PixelFormat::Indexed1, Some(&palette), &row, 4, &mut px).unwrap();
        assert_eq!(px, vec![[255, 0, 0, 255], [0, 0, 0, 255], [255, 0, 0, 255], [0, 0, 0, 255]]);

        let mut out = [0u8; 1];
        write_row(PixelFormat::Indexed1, Some(&palette), &px, &mut out).unwrap();
        assert_eq!(out, row);
    }

    #[test]
    fn test_indexed_without_palette_is_corrupt() {
        let mut px = Vec::new();
        let err = read_row(PixelFormat::Indexed8, None, &[3], 1, &mut px).unwrap_err();
        assert!(matches!(err, NativeError::Corrupt(_)));
    }

    #[test]
    fn test_copy_rect_sub_byte_offset() {
        // Two rows of Indexed4: [1,2,3,4] and [5,6,7,8]
        let src = [0x12, 0x34, 0x56, 0x78];
        let mut dst = [0u8; 2];
        copy_rect(&src, 2, PixelFormat::Indexed4, PixelRect::new(1, 0, 2, 2), &mut dst, 1).unwrap();
        assert_eq!(dst, [0x23, 0x67]);
    }

    #[test]
    fn test_copy_rect_whole_bytes() {
        let src: Vec<u8> = (0..24).collect(); // 2x3 Bgra32, stride 8
        let mut dst = [0u8; 4];
        copy_rect(&src, 8, PixelFormat::Bgra32, PixelRect::new(1, 2, 1, 1), &mut dst, 4).unwrap();
        assert_eq!(dst, [20, 21, 22, 23]);
    }

    #[test]
    fn test_rgb24_to_bgr32() {
        let src = [10u8, 20, 30, 40, 50, 60];
        let mut dst = [0u8; 8];
        convert_rows(&src, 6, PixelFormat::Rgb24, None, 2, 1, &mut dst, 8, PixelFormat::Bgr32, None)
            .unwrap();
        assert_eq!(dst, [30, 20, 10, 255, 60, 50, 40, 255]);
    }

    #[test]
    fn test_wide_formats_are_read_only() {
        assert!(!can_write(PixelFormat::Rgba64));
        let err = write_row(PixelFormat::Rgba64, None, &[[0; 4]], &mut [0u8; 8]).unwrap_err();
        assert!(matches!(err, NativeError::Unsupported(_)));
    }
}
