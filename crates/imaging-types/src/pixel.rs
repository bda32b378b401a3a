use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel layouts understood by the engine. Byte order in the names is memory order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Indexed1,
    Indexed2,
    Indexed4,
    Indexed8,
    BlackWhite,
    Gray2,
    Gray4,
    Gray8,
    Gray16,
    Bgr555,
    Bgr565,
    Bgr24,
    Rgb24,
    Bgr32,
    Bgra32,
    Pbgra32,
    Rgba32,
    Rgb48,
    Rgba64,
    Cmyk32,
    Rgba128Float,
}

impl PixelFormat {
    pub const ALL: &'static [Self] = &[
        Self::Indexed1,
        Self::Indexed2,
        Self::Indexed4,
        Self::Indexed8,
        Self::BlackWhite,
        Self::Gray2,
        Self::Gray4,
        Self::Gray8,
        Self::Gray16,
        Self::Bgr555,
        Self::Bgr565,
        Self::Bgr24,
        Self::Rgb24,
        Self::Bgr32,
        Self::Bgra32,
        Self::Pbgra32,
        Self::Rgba32,
        Self::Rgb48,
        Self::Rgba64,
        Self::Cmyk32,
        Self::Rgba128Float,
    ];

    /// Formats the compositor consumes without any further conversion.
    pub const RENDER_COMPATIBLE: &'static [Self] = &[
        Self::Indexed1,
        Self::Indexed2,
        Self::Indexed4,
        Self::Indexed8,
        Self::BlackWhite,
        Self::Gray2,
        Self::Gray4,
        Self::Gray8,
        Self::Bgr555,
        Self::Bgr565,
        Self::Bgr32,
        Self::Bgra32,
        Self::Pbgra32,
    ];

    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Indexed1 | PixelFormat::BlackWhite => 1,
            PixelFormat::Indexed2 | PixelFormat::Gray2 => 2,
            PixelFormat::Indexed4 | PixelFormat::Gray4 => 4,
            PixelFormat::Indexed8 | PixelFormat::Gray8 => 8,
            PixelFormat::Gray16 | PixelFormat::Bgr555 | PixelFormat::Bgr565 => 16,
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => 24,
            PixelFormat::Bgr32
            | PixelFormat::Bgra32
            | PixelFormat::Pbgra32
            | PixelFormat::Rgba32
            | PixelFormat::Cmyk32 => 32,
            PixelFormat::Rgb48 => 48,
            PixelFormat::Rgba64 => 64,
            PixelFormat::Rgba128Float => 128,
        }
    }

    pub fn is_palettized(self) -> bool {
        matches!(
            self,
            PixelFormat::Indexed1
                | PixelFormat::Indexed2
                | PixelFormat::Indexed4
                | PixelFormat::Indexed8
        )
    }

    pub fn has_alpha(self) -> bool {
        matches!(
            self,
            PixelFormat::Bgra32
                | PixelFormat::Pbgra32
                | PixelFormat::Rgba32
                | PixelFormat::Rgba64
                | PixelFormat::Rgba128Float
        )
    }

    pub fn is_premultiplied(self) -> bool {
        matches!(self, PixelFormat::Pbgra32)
    }

    pub fn is_render_compatible(self) -> bool {
        Self::RENDER_COMPATIBLE.contains(&self)
    }

    /// Minimum number of bytes one row of `width` pixels occupies.
    pub fn min_stride(self, width: u32) -> usize {
        (width as usize * self.bits_per_pixel() as usize).div_ceil(8)
    }

    /// Closest render-compatible format for `self`.
    ///
    /// Palettized formats map to the smallest indexed width covering their bit depth,
    /// everything else lands on a 32bpp format, premultiplied when `needs_alpha`.
    pub fn closest_render_compatible(self, needs_alpha: bool) -> PixelFormat {
        if self.is_render_compatible() {
            return self;
        }

        if self.is_palettized() {
            return match self.bits_per_pixel() {
                0..=1 => PixelFormat::Indexed1,
                2 => PixelFormat::Indexed2,
                3..=4 => PixelFormat::Indexed4,
                _ => PixelFormat::Indexed8,
            };
        }

        if needs_alpha {
            PixelFormat::Pbgra32
        } else {
            PixelFormat::Bgr32
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Indexed1 => "Indexed1",
            PixelFormat::Indexed2 => "Indexed2",
            PixelFormat::Indexed4 => "Indexed4",
            PixelFormat::Indexed8 => "Indexed8",
            PixelFormat::BlackWhite => "BlackWhite",
            PixelFormat::Gray2 => "Gray2",
            PixelFormat::Gray4 => "Gray4",
            PixelFormat::Gray8 => "Gray8",
            PixelFormat::Gray16 => "Gray16",
            PixelFormat::Bgr555 => "Bgr555",
            PixelFormat::Bgr565 => "Bgr565",
            PixelFormat::Bgr24 => "Bgr24",
            PixelFormat::Rgb24 => "Rgb24",
            PixelFormat::Bgr32 => "Bgr32",
            PixelFormat::Bgra32 => "Bgra32",
            PixelFormat::Pbgra32 => "Pbgra32",
            PixelFormat::Rgba32 => "Rgba32",
            PixelFormat::Rgb48 => "Rgb48",
            PixelFormat::Rgba64 => "Rgba64",
            PixelFormat::Cmyk32 => "Cmyk32",
            PixelFormat::Rgba128Float => "Rgba128Float",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_compatible_formats_map_to_themselves() {
        for format in PixelFormat::RENDER_COMPATIBLE {
            assert_eq!(format.closest_render_compatible(true), *format);
            assert_eq!(format.closest_render_compatible(false), *format);
        }
    }

    #[test]
    fn test_truecolor_mapping() {
        assert_eq!(
            PixelFormat::Rgb24.closest_render_compatible(false),
            PixelFormat::Bgr32
        );
        assert_eq!(
            PixelFormat::Rgba32.closest_render_compatible(true),
            PixelFormat::Pbgra32
        );
        assert_eq!(
            PixelFormat::Rgba64.closest_render_compatible(true),
            PixelFormat::Pbgra32
        );
        assert_eq!(
            PixelFormat::Gray16.closest_render_compatible(false),
            PixelFormat::Bgr32
        );
    }

    #[test]
    fn test_min_stride_rounds_up_packed_rows() {
        assert_eq!(PixelFormat::Indexed1.min_stride(9), 2);
        assert_eq!(PixelFormat::Indexed4.min_stride(3), 2);
        assert_eq!(PixelFormat::Bgr24.min_stride(5), 15);
        assert_eq!(PixelFormat::Pbgra32.min_stride(1), 4);
    }

    #[test]
    fn test_alpha_and_palette_flags() {
        assert!(PixelFormat::Pbgra32.has_alpha());
        assert!(PixelFormat::Pbgra32.is_premultiplied());
        assert!(!PixelFormat::Bgr32.has_alpha());
        assert!(PixelFormat::Indexed8.is_palettized());
        assert!(!PixelFormat::Gray8.is_palettized());
    }
}
