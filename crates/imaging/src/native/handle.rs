use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Container,
    Frame,
    Bitmap,
    FormatConverter,
    ColorTransform,
    Scaler,
    Clipper,
}

struct HandleInner {
    id: u64,
    kind: HandleKind,
    object: Box<dyn Any + Send + Sync>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        tracing::trace!(id = self.id, kind = ?self.kind, "native object released");
    }
}

/// Reference-counted handle to an engine object.
///
/// Deliberately not `Clone`: a second owner is only created through
/// [`NativeHandle::add_ref`], so every hand-off is visible at the call site. The
/// object is released when the last handle drops.
pub struct NativeHandle {
    inner: Arc<HandleInner>,
}

impl NativeHandle {
    pub fn new<T: Any + Send + Sync>(kind: HandleKind, object: T) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                object: Box::new(object),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> HandleKind {
        self.inner.kind
    }

    pub fn add_ref(&self) -> NativeHandle {
        NativeHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn same_object(&self, other: &NativeHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.object.downcast_ref::<T>()
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_ref_shares_object() {
        let handle = NativeHandle::new(HandleKind::Bitmap, 42u32);
        assert_eq!(handle.ref_count(), 1);

        let second = handle.add_ref();
        assert_eq!(handle.ref_count(), 2);
        assert!(handle.same_object(&second));
        assert_eq!(second.id(), handle.id());
        assert_eq!(second.downcast_ref::<u32>(), Some(&42));

        drop(second);
        assert_eq!(handle.ref_count(), 1);
    }

    #[test]
    fn test_distinct_handles_have_distinct_ids() {
        let a = NativeHandle::new(HandleKind::Frame, ());
        let b = NativeHandle::new(HandleKind::Frame, ());
        assert_ne!(a.id(), b.id());
        assert!(!a.same_object(&b));
        assert!(a.downcast_ref::<u8>().is_none());
    }
}
