use std::fmt;

/// Container formats the decoder knows about. `Unknown` defers every question to
/// the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    Bmp,
    Png,
    Jpeg,
    Gif,
    Tiff,
    Ico,
    WebP,
    Unknown,
}

/// Which container-level and frame-level queries a format can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatCapabilities {
    pub multi_frame: bool,
    pub container_thumbnail: bool,
    pub preview: bool,
    pub container_metadata: bool,
    pub container_palette: bool,
    pub container_color_contexts: bool,
    pub frame_thumbnail: bool,
    pub frame_metadata: bool,
}

impl FormatCapabilities {
    const ALL: Self = Self {
        multi_frame: true,
        container_thumbnail: true,
        preview: true,
        container_metadata: true,
        container_palette: true,
        container_color_contexts: true,
        frame_thumbnail: true,
        frame_metadata: true,
    };

    const SINGLE: Self = Self {
        multi_frame: false,
        container_thumbnail: false,
        preview: false,
        container_metadata: false,
        container_palette: false,
        container_color_contexts: false,
        frame_thumbnail: false,
        frame_metadata: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecInfo {
    pub format: ContainerFormat,
    pub friendly_name: &'static str,
    pub mime_types: &'static [&'static str],
    pub extensions: &'static [&'static str],
    pub capabilities: FormatCapabilities,
}

const CODECS: &[CodecInfo] = &[
    CodecInfo {
        format: ContainerFormat::Bmp,
        friendly_name: "BMP Decoder",
        mime_types: &["image/bmp"],
        extensions: &["bmp", "dib"],
        capabilities: FormatCapabilities::SINGLE,
    },
    CodecInfo {
        format: ContainerFormat::Png,
        friendly_name: "PNG Decoder",
        mime_types: &["image/png"],
        extensions: &["png"],
        capabilities: FormatCapabilities {
            frame_metadata: true,
            ..FormatCapabilities::SINGLE
        },
    },
    CodecInfo {
        format: ContainerFormat::Jpeg,
        friendly_name: "JPEG Decoder",
        mime_types: &["image/jpeg", "image/jpg"],
        extensions: &["jpg", "jpeg", "jpe", "jfif"],
        capabilities: FormatCapabilities {
            frame_thumbnail: true,
            frame_metadata: true,
            ..FormatCapabilities::SINGLE
        },
    },
    CodecInfo {
        format: ContainerFormat::Gif,
        friendly_name: "GIF Decoder",
        mime_types: &["image/gif"],
        extensions: &["gif"],
        capabilities: FormatCapabilities {
            multi_frame: true,
            container_metadata: true,
            container_palette: true,
            frame_metadata: true,
            ..FormatCapabilities::SINGLE
        },
    },
    CodecInfo {
        format: ContainerFormat::Tiff,
        friendly_name: "TIFF Decoder",
        mime_types: &["image/tiff"],
        extensions: &["tif", "tiff"],
        capabilities: FormatCapabilities {
            multi_frame: true,
            frame_thumbnail: true,
            frame_metadata: true,
            ..FormatCapabilities::SINGLE
        },
    },
    CodecInfo {
        format: ContainerFormat::Ico,
        friendly_name: "ICO Decoder",
        mime_types: &["image/x-icon", "image/vnd.microsoft.icon"],
        extensions: &["ico"],
        capabilities: FormatCapabilities {
            multi_frame: true,
            ..FormatCapabilities::SINGLE
        },
    },
    CodecInfo {
        format: ContainerFormat::WebP,
        friendly_name: "WebP Decoder",
        mime_types: &["image/webp"],
        extensions: &["webp"],
        capabilities: FormatCapabilities {
            frame_metadata: true,
            ..FormatCapabilities::SINGLE
        },
    },
    CodecInfo {
        format: ContainerFormat::Unknown,
        friendly_name: "Unknown Decoder",
        mime_types: &[],
        extensions: &[],
        capabilities: FormatCapabilities::ALL,
    },
];

impl ContainerFormat {
    pub const KNOWN: &'static [Self] = &[
        Self::Bmp,
        Self::Png,
        Self::Jpeg,
        Self::Gif,
        Self::Tiff,
        Self::Ico,
        Self::WebP,
    ];

    pub fn codec_info(self) -> &'static CodecInfo {
        CODECS
            .iter()
            .find(|codec| codec.format == self)
            .unwrap_or(&CODECS[CODECS.len() - 1])
    }

    pub fn capabilities(self) -> FormatCapabilities {
        self.codec_info().capabilities
    }

    pub fn from_extension(extension: &str) -> Self {
        let extension = extension.trim_start_matches('.').to_ascii_lowercase();
        CODECS
            .iter()
            .find(|codec| codec.extensions.contains(&extension.as_str()))
            .map(|codec| codec.format)
            .unwrap_or(ContainerFormat::Unknown)
    }

    pub fn from_mime_type(mime: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        CODECS
            .iter()
            .find(|codec| codec.mime_types.contains(&mime.as_str()))
            .map(|codec| codec.format)
            .unwrap_or(ContainerFormat::Unknown)
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerFormat::Bmp => "BMP",
            ContainerFormat::Png => "PNG",
            ContainerFormat::Jpeg => "JPEG",
            ContainerFormat::Gif => "GIF",
            ContainerFormat::Tiff => "TIFF",
            ContainerFormat::Ico => "ICO",
            ContainerFormat::WebP => "WebP",
            ContainerFormat::Unknown => "unknown",
        };
        f.write_str(name)
    }
}
