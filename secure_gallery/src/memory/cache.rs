//! Byte-budgeted LRU cache of decoded thumbnails.
//!
//! Entries handed out are pinned for as long as the returned
//! [`PinnedBitmap`] lives. Eviction recycles an entry's pixels only when
//! nobody holds a pin on it; a pinned entry is dropped from the cache but
//! its pixels stay valid until the last holder lets go.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use log::{trace, warn};
use lru::LruCache;
use parking_lot::Mutex;

use super::Bitmap;

/// Cache counters
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Evicted while pinned and therefore not recycled
    pub orphaned: u64,
}

struct CacheState {
    entries: LruCache<String, Arc<Bitmap>>,
    pins: HashMap<String, usize>,
    bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    orphaned: u64,
}

impl CacheState {
    fn is_pinned(&self, key: &str) -> bool {
        self.pins.get(key).is_some_and(|n| *n > 0)
    }

    fn pin(&mut self, key: &str) {
        *self.pins.entry(key.to_string()).or_insert(0) += 1;
    }

    fn unpin(&mut self, key: &str) {
        if let Some(count) = self.pins.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(key);
            }
        }
    }

    /// Account for an entry that just left the map
    fn retire(&mut self, key: &str, bitmap: Arc<Bitmap>) {
        self.bytes = self.bytes.saturating_sub(bitmap.byte_size());
        self.evictions += 1;

        if self.is_pinned(key) {
            self.orphaned += 1;
            warn!("Evicted thumbnail {} is still pinned; leaving it to its holders", key);
        } else {
            bitmap.recycle();
            trace!("Recycled thumbnail {}", key);
        }
    }
}

/// Thumbnail cache keyed by `"<media-id>:<w>x<h>"`
pub struct BitmapCache {
    state: Arc<Mutex<CacheState>>,
    capacity: u64,
}

impl fmt::Debug for BitmapCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapCache").field("stats", &self.stats()).finish()
    }
}

impl BitmapCache {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                pins: HashMap::new(),
                bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                orphaned: 0,
            })),
            capacity: capacity_bytes,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn pinned(&self, key: &str, bitmap: Arc<Bitmap>, state: &mut CacheState) -> PinnedBitmap {
        state.pin(key);
        PinnedBitmap {
            bitmap,
            pin: Some((key.to_string(), Arc::downgrade(&self.state))),
        }
    }

    /// Fetch and pin
    pub fn get(&self, key: &str) -> Option<PinnedBitmap> {
        let mut state = self.state.lock();
        let found = state.entries.get(key).cloned();
        match found {
            Some(bitmap) if !bitmap.is_recycled() => {
                state.hits += 1;
                Some(self.pinned(key, bitmap, &mut state))
            }
            Some(_) => {
                if let Some(stale) = state.entries.pop(key) {
                    state.bytes = state.bytes.saturating_sub(stale.byte_size());
                }
                state.misses += 1;
                None
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains(key)
    }

    /// Admit `bitmap` under `key` and return it pinned. A bitmap as large
    /// as the whole cache is never admitted and comes back detached.
    pub fn insert(&self, key: String, bitmap: Arc<Bitmap>) -> PinnedBitmap {
        let size = bitmap.byte_size();
        if size >= self.capacity {
            trace!("Thumbnail {} ({} bytes) exceeds cache capacity", key, size);
            return PinnedBitmap::detached(bitmap);
        }

        let mut state = self.state.lock();
        if let Some(previous) = state.entries.pop(&key) {
            if !Arc::ptr_eq(&previous, &bitmap) {
                state.retire(&key, previous);
            } else {
                state.bytes = state.bytes.saturating_sub(size);
            }
        }

        while state.bytes + size > self.capacity {
            match state.entries.pop_lru() {
                Some((old_key, old)) => state.retire(&old_key, old),
                None => break,
            }
        }

        state.entries.put(key.clone(), Arc::clone(&bitmap));
        state.bytes += size;
        self.pinned(&key, bitmap, &mut state)
    }

    /// Evict one entry
    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        match state.entries.pop(key) {
            Some(bitmap) => {
                state.retire(key, bitmap);
                true
            }
            None => false,
        }
    }

    /// Evict every entry whose key starts with `prefix`
    pub fn remove_prefixed(&self, prefix: &str) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            if let Some(bitmap) = state.entries.pop(key) {
                state.retire(key, bitmap);
            }
        }
        keys.len()
    }

    /// Evict and recycle everything nobody has pinned
    pub fn evict_unpinned(&self) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .entries
            .iter()
            .map(|(k, _)| k.clone())
            .filter(|k| !state.is_pinned(k))
            .collect();
        for key in &keys {
            if let Some(bitmap) = state.entries.pop(key) {
                state.retire(key, bitmap);
            }
        }
        keys.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            bytes: state.bytes,
            capacity: self.capacity,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            orphaned: state.orphaned,
        }
    }
}

/// A bitmap the holder is currently displaying. While any handle for a
/// cache key is alive, eviction of that key will not recycle its pixels.
pub struct PinnedBitmap {
    bitmap: Arc<Bitmap>,
    pin: Option<(String, Weak<Mutex<CacheState>>)>,
}

impl PinnedBitmap {
    /// A handle for a bitmap that is not in any cache
    pub fn detached(bitmap: Arc<Bitmap>) -> Self {
        Self { bitmap, pin: None }
    }

    /// Whether this handle holds a pin in a cache
    pub fn is_cached(&self) -> bool {
        self.pin.is_some()
    }

    pub fn key(&self) -> Option<&str> {
        self.pin.as_ref().map(|(k, _)| k.as_str())
    }

    pub fn bitmap(&self) -> &Arc<Bitmap> {
        &self.bitmap
    }
}

impl Clone for PinnedBitmap {
    fn clone(&self) -> Self {
        if let Some((key, weak)) = &self.pin {
            if let Some(state) = weak.upgrade() {
                state.lock().pin(key);
            }
        }
        Self {
            bitmap: Arc::clone(&self.bitmap),
            pin: self.pin.clone(),
        }
    }
}

impl Deref for PinnedBitmap {
    type Target = Bitmap;

    fn deref(&self) -> &Bitmap {
        &self.bitmap
    }
}

impl fmt::Debug for PinnedBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBitmap")
            .field("key", &self.key())
            .field("bitmap", &self.bitmap)
            .finish()
    }
}

impl Drop for PinnedBitmap {
    fn drop(&mut self) {
        if let Some((key, weak)) = self.pin.take() {
            if let Some(state) = weak.upgrade() {
                state.lock().unpin(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HeapBudget;
    use image::RgbImage;

    fn bitmap(side: u32) -> Arc<Bitmap> {
        let budget = HeapBudget::new(1 << 24);
        Arc::new(Bitmap::from_rgb(&RgbImage::new(side, side), &budget).unwrap())
    }

    #[test]
    fn test_hit_miss_and_lru_order() {
        // 10x10 RGB565 = 200 bytes; room for two
        let cache = BitmapCache::new(450);
        let a = bitmap(10);
        let b = bitmap(10);
        let c = bitmap(10);

        drop(cache.insert("a".into(), Arc::clone(&a)));
        drop(cache.insert("b".into(), Arc::clone(&b)));
        assert!(cache.get("a").is_some());
        drop(cache.insert("c".into(), Arc::clone(&c)));

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(b.is_recycled());
        assert!(cache.get("zzz").is_none());

        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.bytes, 400);
        assert_eq!((stats.hits, stats.misses, stats.evictions), (1, 1, 1));
    }

    #[test]
    fn test_oversized_never_admitted() {
        let cache = BitmapCache::new(200);
        let handle = cache.insert("big".into(), bitmap(10));
        assert!(!handle.is_cached());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_pinned_eviction_is_orphaned_not_recycled() {
        let cache = BitmapCache::new(250);
        let shown = cache.insert("shown".into(), bitmap(10));

        // Pushes "shown" out while it is still pinned
        drop(cache.insert("next".into(), bitmap(10)));

        assert!(!cache.contains("shown"));
        assert!(!shown.is_recycled());
        assert!(shown.to_rgb_image().is_some());
        assert_eq!(cache.stats().orphaned, 1);
    }

    #[test]
    fn test_evict_unpinned_keeps_pinned() {
        let cache = BitmapCache::new(10_000);
        let kept = cache.insert("kept".into(), bitmap(10));
        let second_pin = kept.clone();
        drop(kept);
        let loose = bitmap(10);
        drop(cache.insert("loose".into(), Arc::clone(&loose)));

        assert_eq!(cache.evict_unpinned(), 1);
        assert!(loose.is_recycled());
        assert!(cache.contains("kept"));

        drop(second_pin);
        assert_eq!(cache.evict_unpinned(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.evict_unpinned(), 0);
    }

    #[test]
    fn test_remove_prefixed() {
        let cache = BitmapCache::new(10_000);
        drop(cache.insert("m1:64x64".into(), bitmap(4)));
        drop(cache.insert("m1:128x128".into(), bitmap(4)));
        drop(cache.insert("m2:64x64".into(), bitmap(4)));

        assert_eq!(cache.remove_prefixed("m1"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.remove("m2:64x64"));
        assert!(!cache.remove("m2:64x64"));
    }
}
