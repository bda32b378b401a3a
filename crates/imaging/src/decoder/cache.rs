use super::{Decoder, WeakDecoder};
use crate::identity::SourceIdentity;
use crate::sync::lock;
use std::collections::HashMap;
use std::sync::Mutex;

/// Weak table from source identity to a live decoder. Entries never keep a decoder
/// alive; dead ones are dropped when a lookup trips over them or on [`prune`].
///
/// [`prune`]: DecoderCache::prune
#[derive(Default)]
pub struct DecoderCache {
    entries: Mutex<HashMap<SourceIdentity, WeakDecoder>>,
}

impl DecoderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, identity: &SourceIdentity) -> Option<Decoder> {
        let mut entries = lock(&self.entries);
        let weak = entries.get(identity)?;
        match weak.upgrade() {
            Some(decoder) => {
                tracing::debug!(%identity, "decoder cache hit");
                Some(decoder)
            }
            None => {
                entries.remove(identity);
                tracing::debug!(%identity, "pruned dead decoder cache entry");
                None
            }
        }
    }

    /// Uncacheable identities are ignored.
    pub fn insert(&self, identity: SourceIdentity, decoder: &Decoder) {
        if !identity.is_cacheable() {
            return;
        }
        tracing::debug!(%identity, "decoder cached");
        lock(&self.entries).insert(identity, decoder.downgrade());
    }

    pub fn invalidate(&self, identity: &SourceIdentity) -> bool {
        let removed = lock(&self.entries).remove(identity).is_some();
        if removed {
            tracing::debug!(%identity, "decoder cache entry invalidated");
        }
        removed
    }

    /// Drops every entry whose decoder is gone. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, weak| weak.is_alive());
        before - entries.len()
    }

    /// Entry count, including entries whose decoder has already been dropped.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}
