use crate::native::NativeHandle;
use imaging_types::{PixelFormat, Resolution};
use std::fmt;

/// A finalized, render-compatible bitmap as handed to a compositor.
pub struct RenderResource {
    pub handle: NativeHandle,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub resolution: Resolution,
    /// Bumped every time the owning image replaces its content.
    pub version: u64,
}

impl Clone for RenderResource {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.add_ref(),
            width: self.width,
            height: self.height,
            format: self.format,
            resolution: self.resolution,
            version: self.version,
        }
    }
}

impl fmt::Debug for RenderResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderResource")
            .field("handle", &self.handle.id())
            .field("size", &(self.width, self.height))
            .field("format", &self.format)
            .field("version", &self.version)
            .finish()
    }
}

/// Consumer of finalized bitmaps. Called whenever an attached image's buffer
/// changes identity.
pub trait CompositorAdapter: Send + Sync {
    fn update_resource(&self, resource: &RenderResource);
}
