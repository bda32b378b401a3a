use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type BandIndex = u32;
pub type BandData = Arc<[u8]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// LRU of decoded row bands, shared by clones.
///
/// The lock is never held while a band is being produced, so two readers racing
/// on the same missing band may both decode it; the later insert wins.
#[derive(Clone, Debug)]
pub struct BandCache {
    bands: Arc<Mutex<LruCache<BandIndex, BandData>>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl BandCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            bands: Arc::new(Mutex::new(LruCache::new(capacity))),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn get(&self, band: BandIndex) -> Option<BandData> {
        let found = self.bands.lock().ok()?.get(&band).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn insert(&self, band: BandIndex, data: Vec<u8>) -> BandData {
        let data: BandData = data.into();
        if let Ok(mut cache) = self.bands.lock() {
            cache.put(band, data.clone());
        }
        data
    }

    pub fn get_or_try_insert_with<E>(
        &self,
        band: BandIndex,
        produce: impl FnOnce() -> Result<Vec<u8>, E>,
    ) -> Result<BandData, E> {
        if let Some(data) = self.get(band) {
            return Ok(data);
        }
        let data = produce()?;
        tracing::trace!(band, bytes = data.len(), "band cached");
        Ok(self.insert(band, data))
    }

    pub fn remove(&self, band: BandIndex) -> Option<BandData> {
        self.bands.lock().ok()?.pop(&band)
    }

    pub fn resize(&self, capacity: usize) {
        if let Ok(mut cache) = self.bands.lock() {
            cache.resize(NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.bands.lock() {
            cache.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.bands.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, band: BandIndex) -> bool {
        self.bands
            .lock()
            .map(|cache| cache.contains(&band))
            .unwrap_or(false)
    }

    pub fn memory_usage_bytes(&self) -> usize {
        self.bands
            .lock()
            .map(|cache| cache.iter().map(|(_, data)| data.len()).sum())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_basic_operations() {
        let cache = BandCache::new(4);
        assert!(cache.get(0).is_none());

        cache.insert(0, vec![1, 2, 3, 4]);
        assert_eq!(cache.get(0).as_deref(), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(cache.memory_usage_bytes(), 4);

        assert!(cache.remove(0).is_some());
        assert!(cache.is_empty());
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[test]
    fn test_produce_only_on_miss() {
        let cache = BandCache::new(4);
        let mut calls = 0;

        for _ in 0..3 {
            let band = cache
                .get_or_try_insert_with::<()>(7, || {
                    calls += 1;
                    Ok(vec![9; 8])
                })
                .unwrap();
            assert_eq!(band.len(), 8);
        }

        assert_eq!(calls, 1);
    }

    #[test]
    fn test_failed_production_is_not_cached() {
        let cache = BandCache::new(2);
        let result = cache.get_or_try_insert_with(1, || Err("corrupt"));
        assert_eq!(result, Err("corrupt"));
        assert!(!cache.contains(1));
    }
}
