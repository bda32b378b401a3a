use crate::pixel::PixelFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

/// When decoded pixels get materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CacheOption {
    /// Same as `OnDemand`.
    #[default]
    Default,
    OnDemand,
    OnLoad,
    None,
}

impl CacheOption {
    pub const ALL: &'static [Self] = &[Self::Default, Self::OnDemand, Self::OnLoad, Self::None];

    /// Collapses `Default` into the policy it stands for.
    pub fn effective(self) -> Self {
        match self {
            CacheOption::Default => CacheOption::OnDemand,
            other => other,
        }
    }

    pub fn is_on_load(self) -> bool {
        matches!(self, CacheOption::OnLoad)
    }
}

impl fmt::Display for CacheOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheOption::Default => write!(f, "Default"),
            CacheOption::OnDemand => write!(f, "OnDemand"),
            CacheOption::OnLoad => write!(f, "OnLoad"),
            CacheOption::None => write!(f, "None"),
        }
    }
}

impl std::str::FromStr for CacheOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(CacheOption::Default),
            "ondemand" | "on_demand" | "on-demand" => Ok(CacheOption::OnDemand),
            "onload" | "on_load" | "on-load" => Ok(CacheOption::OnLoad),
            "none" => Ok(CacheOption::None),
            other => Err(format!("unknown cache option `{}`", other)),
        }
    }
}

/// Bitset of creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct CreateOptions(u8);

impl CreateOptions {
    pub const NONE: Self = Self(0);
    pub const PRESERVE_PIXEL_FORMAT: Self = Self(1);
    pub const DELAY_CREATION: Self = Self(1 << 1);
    pub const IGNORE_COLOR_PROFILE: Self = Self(1 << 2);
    pub const IGNORE_IMAGE_CACHE: Self = Self(1 << 3);

    const NAMED: &'static [(Self, &'static str)] = &[
        (Self::PRESERVE_PIXEL_FORMAT, "PreservePixelFormat"),
        (Self::DELAY_CREATION, "DelayCreation"),
        (Self::IGNORE_COLOR_PROFILE, "IgnoreColorProfile"),
        (Self::IGNORE_IMAGE_CACHE, "IgnoreImageCache"),
    ];

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for CreateOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

impl BitOrAssign for CreateOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

impl fmt::Display for CreateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "None");
        }

        let names: Vec<&str> = Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join(" | "))
    }
}

impl std::str::FromStr for CreateOptions {
    type Err = String;

    /// Parses `"DelayCreation | IgnoreColorProfile"` style lists. Separators may be `|` or `,`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = CreateOptions::NONE;
        for part in s.split(['|', ',']).map(str::trim).filter(|p| !p.is_empty()) {
            if part.eq_ignore_ascii_case("none") {
                continue;
            }
            let flag = Self::NAMED
                .iter()
                .find(|(_, name)| name.eq_ignore_ascii_case(part))
                .map(|(flag, _)| *flag)
                .ok_or_else(|| format!("unknown create option `{}`", part))?;
            options.insert(flag);
        }
        Ok(options)
    }
}

/// Integer pixel rectangle. An empty rectangle means "the whole image" wherever a
/// rectangle is optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub const EMPTY: Self = Self {
        x: 0,
        y: 0,
        width: 0,
        height: 0,
    };

    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.right() <= width as u64 && self.bottom() <= height as u64
    }

    /// Overlap of two rectangles, `None` when they do not touch.
    pub fn intersect(&self, other: &PixelRect) -> Option<PixelRect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 as u64 || y1 <= y0 as u64 {
            return None;
        }
        Some(PixelRect::new(x0, y0, (x1 - x0 as u64) as u32, (y1 - y0 as u64) as u32))
    }
}

/// Horizontal and vertical resolution in dots per inch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub dpi_x: f64,
    pub dpi_y: f64,
}

impl Resolution {
    pub const DEFAULT_DPI: f64 = 96.0;

    pub fn new(dpi_x: f64, dpi_y: f64) -> Self {
        Self { dpi_x, dpi_y }
    }

    /// Replaces non-finite or non-positive values with 96 dpi.
    pub fn sanitized(self) -> Self {
        let fix = |v: f64| {
            if v.is_finite() && v > 0.0 {
                v
            } else {
                Self::DEFAULT_DPI
            }
        };
        Self::new(fix(self.dpi_x), fix(self.dpi_y))
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DPI, Self::DEFAULT_DPI)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PaletteColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl PaletteColor {
    pub const TRANSPARENT: Self = Self::new(0, 0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self::new(r, g, b, 255)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Palette {
    pub colors: Vec<PaletteColor>,
}

impl Palette {
    pub fn new(colors: Vec<PaletteColor>) -> Self {
        Self { colors }
    }

    /// Evenly spaced gray ramp with `count` entries.
    pub fn grayscale(count: usize) -> Self {
        let count = count.max(2);
        let colors = (0..count)
            .map(|i| {
                let v = ((i * 255) / (count - 1)) as u8;
                PaletteColor::opaque(v, v, v)
            })
            .collect();
        Self { colors }
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    pub fn has_alpha(&self) -> bool {
        self.colors.iter().any(|c| c.a != 255)
    }

    pub fn get(&self, index: usize) -> PaletteColor {
        self.colors
            .get(index)
            .copied()
            .unwrap_or(PaletteColor::TRANSPARENT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorSpace {
    Srgb,
    Icc,
}

/// A color profile attached to a frame, or the destination profile of a transform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColorContext {
    pub space: ColorSpace,
    pub profile: Arc<[u8]>,
}

impl ColorContext {
    pub fn srgb() -> Self {
        Self {
            space: ColorSpace::Srgb,
            profile: Arc::from(Vec::new()),
        }
    }

    pub fn from_icc(profile: impl Into<Arc<[u8]>>) -> Self {
        Self {
            space: ColorSpace::Icc,
            profile: profile.into(),
        }
    }

    pub fn is_srgb(&self) -> bool {
        matches!(self.space, ColorSpace::Srgb)
    }

    /// ICC header description is not parsed here; this only checks the fixed header
    /// fields (declared size and the `acsp` signature).
    pub fn has_valid_icc_header(&self) -> bool {
        if self.is_srgb() {
            return true;
        }
        let p = &self.profile;
        if p.len() < 128 {
            return false;
        }
        let declared = u32::from_be_bytes([p[0], p[1], p[2], p[3]]) as usize;
        declared <= p.len() && &p[36..40] == b"acsp"
    }
}

/// Flattened metadata entries keyed by a path-like name, e.g. `/exif/Make`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BitmapMetadata {
    pub container: String,
    pub entries: BTreeMap<String, String>,
}

impl BitmapMetadata {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Caller-supplied raw pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: usize,
    pub data: Arc<[u8]>,
    pub palette: Option<Palette>,
    pub resolution: Resolution,
}

impl PixelBuffer {
    /// Tightly packed buffer at 96 dpi.
    pub fn new(width: u32, height: u32, format: PixelFormat, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            width,
            height,
            format,
            stride: format.min_stride(width),
            data: data.into(),
            palette: None,
            resolution: Resolution::default(),
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_palette(mut self, palette: Palette) -> Self {
        self.palette = Some(palette);
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// 1×1 fully transparent premultiplied pixel.
    pub fn transparent_pixel() -> Self {
        Self::new(1, 1, PixelFormat::Pbgra32, vec![0u8; 4])
    }

    /// Bytes required for the declared geometry.
    pub fn required_len(&self) -> usize {
        if self.height == 0 {
            return 0;
        }
        self.stride * (self.height as usize - 1) + self.format.min_stride(self.width)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err("Pixel buffer dimensions must be non-zero".to_string());
        }
        if self.stride < self.format.min_stride(self.width) {
            return Err(format!(
                "Stride {} is smaller than the minimum {} for {} pixels of {}",
                self.stride,
                self.format.min_stride(self.width),
                self.width,
                self.format
            ));
        }
        if self.data.len() < self.required_len() {
            return Err(format!(
                "Buffer holds {} bytes but {} are required",
                self.data.len(),
                self.required_len()
            ));
        }
        if self.format.is_palettized() && self.palette.is_none() {
            return Err(format!("{} buffers require a palette", self.format));
        }
        Ok(())
    }
}
