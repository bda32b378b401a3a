pub mod pixel;
pub mod types;

pub use pixel::PixelFormat;
pub use types::{
    BitmapMetadata, CacheOption, ColorContext, ColorSpace, CreateOptions, Palette, PaletteColor,
    PixelBuffer, PixelRect, Resolution,
};
