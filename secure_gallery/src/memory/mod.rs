//! Secure Gallery - Memory Budget
//!
//! Every large buffer the pipeline holds (decoded bitmaps, decrypted video
//! prefixes, decode scratch space) is charged against a [`HeapBudget`]
//! through an RAII [`MemoryReservation`]. Pressure is read off that budget:
//!
//! | usage       | state    | effect                                   |
//! |-------------|----------|------------------------------------------|
//! | < 0.85      | normal   |                                          |
//! | >= 0.85     | low      | import pauses between items              |
//! | >= 0.95     | critical | thumbnails not cached, heavy work aborts |

pub mod bitmap;
pub mod cache;

pub use bitmap::{Bitmap, PixelFormat};
pub use cache::{BitmapCache, CacheStats, PinnedBitmap};

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use lru::LruCache;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::error::{VaultError, VaultResult};

// ═══════════════════════════════════════════════════════════════
// BUDGET
// ═══════════════════════════════════════════════════════════════

/// Byte budget shared by everything that holds large buffers
#[derive(Debug)]
pub struct HeapBudget {
    max_bytes: u64,
    used: AtomicU64,
    peak: AtomicU64,
    refusals: AtomicU64,
}

impl HeapBudget {
    pub fn new(max_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            max_bytes: max_bytes.max(1),
            used: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            refusals: AtomicU64::new(0),
        })
    }

    /// Charge `bytes`; refused with [`VaultError::OutOfMemory`] if it would
    /// push usage past the budget.
    pub fn reserve(self: &Arc<Self>, bytes: u64) -> VaultResult<MemoryReservation> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.max_bytes {
                self.refusals.fetch_add(1, Ordering::Relaxed);
                return Err(VaultError::OutOfMemory { requested: bytes });
            }
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::Relaxed);
                    return Ok(MemoryReservation {
                        budget: Arc::clone(self),
                        bytes,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn max(&self) -> u64 {
        self.max_bytes
    }

    /// Bytes still available
    pub fn remaining(&self) -> u64 {
        self.max_bytes.saturating_sub(self.used())
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn refusals(&self) -> u64 {
        self.refusals.load(Ordering::Relaxed)
    }

    /// used / max, clamped to [0, 1]
    pub fn usage_fraction(&self) -> f64 {
        (self.used() as f64 / self.max_bytes as f64).clamp(0.0, 1.0)
    }
}

/// Charged bytes, returned to the budget on drop
#[derive(Debug)]
pub struct MemoryReservation {
    budget: Arc<HeapBudget>,
    bytes: u64,
}

impl MemoryReservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.budget.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

// ═══════════════════════════════════════════════════════════════
// PREFIX CACHE
// ═══════════════════════════════════════════════════════════════

/// Decrypted leading bytes of a video, kept for repeated frame extraction
#[derive(Debug)]
pub struct CachedPrefix {
    data: Vec<u8>,
    _reservation: MemoryReservation,
}

impl CachedPrefix {
    /// `reservation` should cover `data`
    pub fn new(data: Vec<u8>, reservation: MemoryReservation) -> Self {
        Self {
            data,
            _reservation: reservation,
        }
    }
}

impl Deref for CachedPrefix {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

struct PrefixCache {
    entries: LruCache<Uuid, Arc<CachedPrefix>>,
    bytes: u64,
    capacity: u64,
}

impl PrefixCache {
    fn trim_to(&mut self, target: u64) {
        while self.bytes > target {
            match self.entries.pop_lru() {
                Some((_, entry)) => self.bytes -= entry.data.len() as u64,
                None => break,
            }
        }
    }

    fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.bytes = 0;
        count
    }
}

// ═══════════════════════════════════════════════════════════════
// MANAGER
// ═══════════════════════════════════════════════════════════════

/// What a [`MemoryManager::force_cleanup`] released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub bitmaps_evicted: usize,
    pub prefixes_dropped: usize,
    pub bytes_released: u64,
}

/// Point-in-time view for diagnostics
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub peak_bytes: u64,
    pub usage_fraction: f64,
    pub is_low: bool,
    pub is_critical: bool,
    pub bitmap_cache: CacheStats,
    pub prefix_entries: usize,
    pub prefix_bytes: u64,
    pub refusals: u64,
    pub cleanups: u64,
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MIB: f64 = 1024.0 * 1024.0;
        let state = if self.is_critical {
            "CRITICAL"
        } else if self.is_low {
            "LOW"
        } else {
            "OK"
        };
        writeln!(
            f,
            "heap: {:.1} / {:.1} MiB ({:.0}%) [{}], peak {:.1} MiB",
            self.used_bytes as f64 / MIB,
            self.max_bytes as f64 / MIB,
            self.usage_fraction * 100.0,
            state,
            self.peak_bytes as f64 / MIB,
        )?;
        writeln!(
            f,
            "bitmaps: {} cached, {:.1} / {:.1} MiB, {} hits / {} misses, {} evicted, {} orphaned",
            self.bitmap_cache.entries,
            self.bitmap_cache.bytes as f64 / MIB,
            self.bitmap_cache.capacity as f64 / MIB,
            self.bitmap_cache.hits,
            self.bitmap_cache.misses,
            self.bitmap_cache.evictions,
            self.bitmap_cache.orphaned,
        )?;
        write!(
            f,
            "video prefixes: {} cached, {:.1} MiB; {} refusals, {} forced cleanups",
            self.prefix_entries,
            self.prefix_bytes as f64 / MIB,
            self.refusals,
            self.cleanups,
        )
    }
}

/// Memory pressure oracle plus the caches it is allowed to drain
pub struct MemoryManager {
    budget: Arc<HeapBudget>,
    low_threshold: f64,
    critical_threshold: f64,
    bitmaps: BitmapCache,
    prefixes: Mutex<PrefixCache>,
    cleanups: AtomicU64,
}

impl MemoryManager {
    pub fn new(config: &MemoryConfig) -> Self {
        let max = config.resolve_max_heap();
        let bitmap_capacity = (max as f64 * config.bitmap_cache_fraction) as u64;
        info!(
            "Memory budget {} bytes, bitmap cache {} bytes, prefix cache {} bytes",
            max, bitmap_capacity, config.prefix_cache_bytes
        );

        Self {
            budget: HeapBudget::new(max),
            low_threshold: config.low_threshold,
            critical_threshold: config.critical_threshold,
            bitmaps: BitmapCache::new(bitmap_capacity),
            prefixes: Mutex::new(PrefixCache {
                entries: LruCache::unbounded(),
                bytes: 0,
                capacity: config.prefix_cache_bytes,
            }),
            cleanups: AtomicU64::new(0),
        }
    }

    pub fn budget(&self) -> &Arc<HeapBudget> {
        &self.budget
    }

    pub fn bitmap_cache(&self) -> &BitmapCache {
        &self.bitmaps
    }

    pub fn current_usage_fraction(&self) -> f64 {
        self.budget.usage_fraction()
    }

    pub fn is_low(&self) -> bool {
        self.current_usage_fraction() >= self.low_threshold
    }

    pub fn is_critical(&self) -> bool {
        self.current_usage_fraction() >= self.critical_threshold
    }

    /// Charge `bytes` against the budget
    pub fn reserve(&self, bytes: u64) -> VaultResult<MemoryReservation> {
        self.budget.reserve(bytes)
    }

    /// Gate for allocation-heavy work: cleans up once when critical and
    /// fails with [`VaultError::MemoryPressure`] if that did not help.
    pub fn ensure_headroom(&self) -> VaultResult<()> {
        if !self.is_critical() {
            return Ok(());
        }
        self.force_cleanup();
        if self.is_critical() {
            warn!("Memory still critical after cleanup ({:.0}%)", self.current_usage_fraction() * 100.0);
            return Err(VaultError::MemoryPressure);
        }
        Ok(())
    }

    /// Drop every unpinned cached bitmap and every cached prefix.
    /// Safe to call repeatedly; a second call finds nothing to release.
    pub fn force_cleanup(&self) -> CleanupReport {
        let before = self.budget.used();
        let bitmaps_evicted = self.bitmaps.evict_unpinned();
        let prefixes_dropped = self.prefixes.lock().clear();
        let bytes_released = before.saturating_sub(self.budget.used());
        self.cleanups.fetch_add(1, Ordering::Relaxed);

        // No collector to hint; released buffers are already freed.
        debug!(
            "Forced cleanup: {} bitmaps, {} prefixes, {} bytes released",
            bitmaps_evicted, prefixes_dropped, bytes_released
        );

        CleanupReport {
            bitmaps_evicted,
            prefixes_dropped,
            bytes_released,
        }
    }

    /// Look up a cached thumbnail, pinned for the caller
    pub fn cached_thumbnail(&self, key: &str) -> Option<PinnedBitmap> {
        self.bitmaps.get(key)
    }

    /// Offer a thumbnail to the cache. Skipped while memory is critical;
    /// the caller gets the bitmap back either way.
    pub fn cache_thumbnail(&self, key: &str, bitmap: Arc<Bitmap>) -> PinnedBitmap {
        if self.is_critical() {
            debug!("Memory critical, not caching thumbnail {}", key);
            return PinnedBitmap::detached(bitmap);
        }
        self.bitmaps.insert(key.to_string(), bitmap)
    }

    /// Keep a decrypted video prefix for later extractions. Returns false
    /// when it does not fit or memory is critical.
    pub fn cache_prefix(&self, media_id: Uuid, prefix: Arc<CachedPrefix>) -> bool {
        let len = prefix.data.len() as u64;
        let mut cache = self.prefixes.lock();
        if len == 0 || len > cache.capacity || self.is_critical() {
            return false;
        }

        if let Some(old) = cache.entries.pop(&media_id) {
            cache.bytes -= old.data.len() as u64;
        }
        let target = cache.capacity - len;
        cache.trim_to(target);

        cache.entries.put(media_id, prefix);
        cache.bytes += len;
        true
    }

    pub fn cached_prefix(&self, media_id: &Uuid) -> Option<Arc<CachedPrefix>> {
        self.prefixes.lock().entries.get(media_id).cloned()
    }

    /// Forget anything cached for a media item that is going away
    pub fn forget_media(&self, media_id: &Uuid) {
        let mut cache = self.prefixes.lock();
        if let Some(old) = cache.entries.pop(media_id) {
            cache.bytes -= old.data.len() as u64;
        }
        drop(cache);
        self.bitmaps.remove_prefixed(&media_id.to_string());
    }

    pub fn stats(&self) -> MemoryStats {
        let (prefix_entries, prefix_bytes) = {
            let cache = self.prefixes.lock();
            (cache.entries.len(), cache.bytes)
        };
        MemoryStats {
            used_bytes: self.budget.used(),
            max_bytes: self.budget.max(),
            peak_bytes: self.budget.peak(),
            usage_fraction: self.current_usage_fraction(),
            is_low: self.is_low(),
            is_critical: self.is_critical(),
            bitmap_cache: self.bitmaps.stats(),
            prefix_entries,
            prefix_bytes,
            refusals: self.budget.refusals(),
            cleanups: self.cleanups.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn prefix(mm: &MemoryManager, len: usize, byte: u8) -> Arc<CachedPrefix> {
        Arc::new(CachedPrefix::new(vec![byte; len], mm.reserve(len as u64).unwrap()))
    }

    fn manager(max: u64) -> MemoryManager {
        MemoryManager::new(&MemoryConfig {
            max_heap_bytes: Some(max),
            bitmap_cache_fraction: 0.5,
            prefix_cache_bytes: max / 4,
            ..Default::default()
        })
    }

    #[test]
    fn test_thresholds() {
        let mm = manager(1000);
        assert!(!mm.is_low());

        let _a = mm.reserve(850).unwrap();
        assert!(mm.is_low());
        assert!(!mm.is_critical());

        let _b = mm.reserve(100).unwrap();
        assert!(mm.is_critical());
        assert!((mm.current_usage_fraction() - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_reservation_released_on_drop() {
        let budget = HeapBudget::new(100);
        {
            let r = budget.reserve(60).unwrap();
            assert_eq!(r.bytes(), 60);
            assert!(budget.reserve(50).is_err());
        }
        assert_eq!(budget.used(), 0);
        assert_eq!(budget.peak(), 60);
        assert_eq!(budget.refusals(), 1);
        assert!(budget.reserve(100).is_ok());
    }

    #[test]
    fn test_force_cleanup_is_idempotent() {
        let mm = manager(1 << 20);
        let bitmap = Arc::new(Bitmap::from_rgb(&RgbImage::new(32, 32), mm.budget()).unwrap());
        drop(mm.cache_thumbnail("a:32x32", Arc::clone(&bitmap)));
        assert!(mm.cache_prefix(Uuid::new_v4(), prefix(&mm, 4096, 7)));
        assert!(mm.budget().used() > 0);

        let first = mm.force_cleanup();
        assert_eq!(first.bitmaps_evicted, 1);
        assert_eq!(first.prefixes_dropped, 1);
        assert!(bitmap.is_recycled());
        assert_eq!(mm.budget().used(), 0);

        let second = mm.force_cleanup();
        assert_eq!(second, CleanupReport::default());
        assert_eq!(mm.stats().cleanups, 2);
    }

    #[test]
    fn test_critical_skips_thumbnail_cache() {
        let mm = manager(10_000);
        let _hog = mm.reserve(9_600).unwrap();
        assert!(mm.is_critical());

        let bitmap = Arc::new(Bitmap::placeholder(crate::gallery::MediaKind::Photo, 8, 8));
        let handle = mm.cache_thumbnail("x:8x8", bitmap);
        assert!(!handle.is_cached());
        assert!(mm.cached_thumbnail("x:8x8").is_none());
    }

    #[test]
    fn test_ensure_headroom_cleans_then_reports_pressure() {
        let mm = manager(1 << 16);
        let bitmap = Arc::new(Bitmap::from_rgb(&RgbImage::new(100, 100), mm.budget()).unwrap());
        drop(mm.cache_thumbnail("b:100x100", bitmap));
        let _hog = mm.reserve(mm.budget().remaining() - 100).unwrap();
        assert!(mm.is_critical());

        // Evicting the cached bitmap brings usage back down
        mm.ensure_headroom().unwrap();

        let _hog2 = mm.reserve(mm.budget().remaining()).unwrap();
        assert!(matches!(mm.ensure_headroom(), Err(VaultError::MemoryPressure)));
    }

    #[test]
    fn test_prefix_cache_evicts_lru() {
        let mm = manager(40_000);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(mm.cache_prefix(a, prefix(&mm, 4_000, 1)));
        assert!(mm.cache_prefix(b, prefix(&mm, 4_000, 2)));
        assert!(mm.cached_prefix(&a).is_some());
        assert!(mm.cache_prefix(c, prefix(&mm, 4_000, 3)));

        // capacity 10_000: b was least recently used
        assert!(mm.cached_prefix(&b).is_none());
        assert_eq!(&mm.cached_prefix(&a).unwrap()[..2], &[1, 1]);
        assert!(!mm.cache_prefix(Uuid::new_v4(), prefix(&mm, 20_000, 0)));

        mm.forget_media(&a);
        assert!(mm.cached_prefix(&a).is_none());
        assert_eq!(mm.stats().prefix_bytes, 4_000);
    }

    #[test]
    fn test_stats_display() {
        let mm = manager(1 << 20);
        let text = mm.stats().to_string();
        assert!(text.contains("heap:"));
        assert!(text.contains("[OK]"));
    }
}
