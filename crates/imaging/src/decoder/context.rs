use crate::context::Imaging;
use crate::engine::CodecEngine;
use crate::format::ContainerFormat;
use crate::native::{BackingStream, NativeHandle};
use crate::sync::{SyncObject, lock_sync, new_sync_object};

/// Native decode state shared by a decoder and every frame built from it.
pub(crate) struct DecodeContext {
    imaging: Imaging,
    format: ContainerFormat,
    container: NativeHandle,
    stream: BackingStream,
    sync: SyncObject,
}

impl DecodeContext {
    pub(crate) fn new(
        imaging: Imaging,
        format: ContainerFormat,
        container: NativeHandle,
        stream: BackingStream,
    ) -> Self {
        Self {
            imaging,
            format,
            container,
            stream,
            sync: new_sync_object(),
        }
    }

    pub(crate) fn imaging(&self) -> &Imaging {
        &self.imaging
    }

    pub(crate) fn engine(&self) -> &dyn CodecEngine {
        self.imaging.engine()
    }

    pub(crate) fn format(&self) -> ContainerFormat {
        self.format
    }

    pub(crate) fn container(&self) -> &NativeHandle {
        &self.container
    }

    pub(crate) fn sync(&self) -> &SyncObject {
        &self.sync
    }

    pub(crate) fn stream(&self) -> &BackingStream {
        &self.stream
    }

    /// Runs `f` against the container while holding the chain lock.
    pub(crate) fn with_container<R>(&self, f: impl FnOnce(&dyn CodecEngine, &NativeHandle) -> R) -> R {
        let _guard = lock_sync(&self.sync);
        f(self.engine(), &self.container)
    }

    pub(crate) fn close_stream(&self) -> bool {
        self.stream.close()
    }
}

impl Drop for DecodeContext {
    fn drop(&mut self) {
        self.stream.close();
    }
}
