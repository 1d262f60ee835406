//! Secure Gallery - Batch Import
//!
//! An import runs three phases in strict order over the whole batch:
//!
//! ```text
//! ENCRYPTING            -> every item encrypted into the gallery and recorded
//! GENERATING_THUMBNAILS -> encrypted thumbnail stored for each imported item
//! FINALIZING            -> journal folded into the snapshot
//! ```
//!
//! Item failures are counted and reported without stopping the batch.
//! Cancellation is checked before every item; items already imported stay.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ImportConfig;
use crate::error::{VaultError, VaultResult};
use crate::gallery::{GalleryStore, MediaKind, SecureMedia, UnlockedGallery};
use crate::memory::MemoryManager;
use crate::thumbs::{photo, MediaRef, ThumbnailPipeline};

/// Overall fraction below which no ETA is given
const ETA_MIN_FRACTION: f64 = 0.05;

/// Smallest thumbnail the out-of-memory retry will try
const MIN_RETRY_SIZE: u32 = 32;

/// Import phase, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImportPhase {
    Encrypting,
    GeneratingThumbnails,
    Finalizing,
}

impl ImportPhase {
    /// Share of overall progress
    pub fn weight(self) -> f64 {
        match self {
            ImportPhase::Encrypting => 0.60,
            ImportPhase::GeneratingThumbnails => 0.35,
            ImportPhase::Finalizing => 0.05,
        }
    }

    /// Overall progress when the phase starts
    pub fn base(self) -> f64 {
        match self {
            ImportPhase::Encrypting => 0.0,
            ImportPhase::GeneratingThumbnails => 0.60,
            ImportPhase::Finalizing => 0.95,
        }
    }
}

impl std::fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ImportPhase::Encrypting => "ENCRYPTING",
            ImportPhase::GeneratingThumbnails => "GENERATING_THUMBNAILS",
            ImportPhase::Finalizing => "FINALIZING",
        };
        f.write_str(name)
    }
}

/// Overall fraction after `done` of `total` items in `phase`
pub fn overall_fraction(phase: ImportPhase, done: usize, total: usize) -> f64 {
    let within = if total == 0 {
        1.0
    } else {
        (done as f64 / total as f64).min(1.0)
    };
    (phase.base() + phase.weight() * within).min(1.0)
}

/// Linear extrapolation of the time left; `None` until past 5%
pub fn estimate_eta(elapsed: Duration, fraction: f64) -> Option<Duration> {
    if fraction <= ETA_MIN_FRACTION {
        return None;
    }
    if fraction >= 1.0 {
        return Some(Duration::ZERO);
    }
    let total = elapsed.as_secs_f64() / fraction;
    Some(Duration::from_secs_f64(total * (1.0 - fraction)))
}

/// One progress report, emitted after each item of each phase
#[derive(Debug, Clone)]
pub struct ImportProgress {
    pub phase: ImportPhase,
    /// Items of this phase finished so far
    pub index: usize,
    pub total: usize,
    pub item_name: String,
    /// Weighted progress of the whole import, 0.0 - 1.0
    pub overall: f64,
    /// `None` while indeterminate
    pub eta: Option<Duration>,
}

/// An item that did not make it through a phase
#[derive(Debug, Clone)]
pub struct ImportFailure {
    pub phase: ImportPhase,
    pub item_name: String,
    pub error: String,
}

/// Outcome of a finished (or cancelled) import
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    /// Items now in the gallery, in input order
    pub imported: Vec<SecureMedia>,
    pub thumbnails: usize,
    pub failures: Vec<ImportFailure>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl ImportReport {
    /// Items that failed to import (thumbnail failures do not count)
    pub fn failed_items(&self) -> usize {
        self.failures
            .iter()
            .filter(|f| f.phase == ImportPhase::Encrypting)
            .count()
    }
}

type ProgressCallback = Box<dyn Fn(&ImportProgress) + Send + Sync>;

/// A running import
pub struct ImportHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<VaultResult<ImportReport>>,
}

impl ImportHandle {
    /// Ask the import to stop before its next item
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the import to end
    pub async fn join(self) -> VaultResult<ImportReport> {
        self.task.await?
    }
}

/// Drives imports into one store
#[derive(Clone)]
pub struct ImportCoordinator {
    store: Arc<GalleryStore>,
    pipeline: Arc<ThumbnailPipeline>,
    memory: Arc<MemoryManager>,
    config: ImportConfig,
}

impl ImportCoordinator {
    pub fn new(
        store: Arc<GalleryStore>,
        pipeline: Arc<ThumbnailPipeline>,
        memory: Arc<MemoryManager>,
        config: ImportConfig,
    ) -> Self {
        Self {
            store,
            pipeline,
            memory,
            config,
        }
    }

    /// Start importing `items` into `gallery` on a background task
    pub fn start_import<F>(&self, items: Vec<PathBuf>, gallery: UnlockedGallery, on_progress: F) -> ImportHandle
    where
        F: Fn(&ImportProgress) + Send + Sync + 'static,
    {
        let (cancel, cancelled) = watch::channel(false);
        let this = self.clone();
        let task = tokio::spawn(async move { this.run(items, gallery, Box::new(on_progress), cancelled).await });
        ImportHandle { cancel, task }
    }

    async fn run(
        &self,
        items: Vec<PathBuf>,
        gallery: UnlockedGallery,
        on_progress: ProgressCallback,
        cancelled: watch::Receiver<bool>,
    ) -> VaultResult<ImportReport> {
        let mut run = ImportRun {
            started: Instant::now(),
            total: items.len(),
            on_progress,
            cancelled,
            report: ImportReport::default(),
        };
        info!("Importing {} items into gallery {}", items.len(), gallery.id());

        // Phase 1
        let mut names = Vec::new();
        for (i, source) in items.iter().enumerate() {
            if run.is_cancelled() {
                break;
            }
            let name = display_name(source, i);
            match self.encrypt_item(&gallery, source).await {
                Ok(media) => {
                    names.push(name.clone());
                    run.report.imported.push(media);
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => run.fail(ImportPhase::Encrypting, &name, &e),
            }
            run.emit(ImportPhase::Encrypting, i + 1, &name);
            self.between_items(self.config.encrypt_pause_ms).await;
        }

        // Phase 2
        if !run.is_cancelled() {
            let dir = self.store.gallery_dir(&gallery)?;
            let imported = run.report.imported.clone();
            let total = imported.len();
            for (i, (media, name)) in imported.iter().zip(&names).enumerate() {
                if run.is_cancelled() {
                    break;
                }
                let media_ref = MediaRef::new(&dir, media, Arc::clone(gallery.key()));
                match self.thumbnail_item(&media_ref).await {
                    Ok(()) => run.report.thumbnails += 1,
                    Err(e) => run.fail(ImportPhase::GeneratingThumbnails, name, &e),
                }
                run.emit_of(ImportPhase::GeneratingThumbnails, i + 1, total, name);
                self.between_items(self.config.thumbnail_pause_ms).await;
            }
        }

        // Phase 3 runs even after cancellation so imported items are flushed
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.flush()).await??;
        run.emit_of(ImportPhase::Finalizing, 1, 1, "");

        run.report.cancelled = run.is_cancelled();
        run.report.elapsed = run.started.elapsed();
        info!(
            "Import finished: {} imported, {} thumbnails, {} failures{}",
            run.report.imported.len(),
            run.report.thumbnails,
            run.report.failures.len(),
            if run.report.cancelled { " (cancelled)" } else { "" }
        );
        Ok(run.report)
    }

    async fn encrypt_item(&self, gallery: &UnlockedGallery, source: &Path) -> VaultResult<SecureMedia> {
        self.memory.ensure_headroom()?;
        let store = Arc::clone(&self.store);
        let gallery = gallery.clone();
        let source = source.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let staged = store.stage_media(&gallery, &source, None)?;
            let checked = match staged.kind {
                MediaKind::Photo => photo::probe_file(&source).map(|_| ()),
                MediaKind::Video => Ok(()),
            };
            if let Err(e) = checked.and_then(|_| store.commit_media(&gallery, staged.clone())) {
                if let Err(cleanup) = store.discard_staged(&gallery, &staged) {
                    warn!("Could not discard staged {}: {}", staged.id, cleanup);
                }
                return Err(e);
            }
            Ok(staged)
        })
        .await?
    }

    /// Store a thumbnail, halving the size after each out-of-memory refusal
    async fn thumbnail_item(&self, media: &MediaRef) -> VaultResult<()> {
        let mut size = self.config.thumbnail_size;
        loop {
            match self.pipeline.persist_thumbnail(media, size).await {
                Err(e) if e.is_out_of_memory() && size / 2 >= MIN_RETRY_SIZE => {
                    self.memory.force_cleanup();
                    size /= 2;
                    debug!("Retrying thumbnail of {} at {}px", media.id, size);
                }
                other => return other,
            }
        }
    }

    async fn between_items(&self, pause_ms: u64) {
        if self.memory.is_low() {
            let report = self.memory.force_cleanup();
            debug!(
                "Memory low between items: released {} bytes, pausing {}ms",
                report.bytes_released, pause_ms
            );
            tokio::time::sleep(Duration::from_millis(pause_ms)).await;
        }
    }
}

/// Per-import mutable state
struct ImportRun {
    started: Instant,
    total: usize,
    on_progress: ProgressCallback,
    cancelled: watch::Receiver<bool>,
    report: ImportReport,
}

impl ImportRun {
    fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    fn fail(&mut self, phase: ImportPhase, name: &str, error: &VaultError) {
        warn!("{} failed for {}: {}", phase, name, error);
        self.report.failures.push(ImportFailure {
            phase,
            item_name: name.to_string(),
            error: error.to_string(),
        });
    }

    fn emit(&self, phase: ImportPhase, index: usize, name: &str) {
        self.emit_of(phase, index, self.total, name);
    }

    fn emit_of(&self, phase: ImportPhase, index: usize, total: usize, name: &str) {
        let overall = overall_fraction(phase, index, total);
        (self.on_progress)(&ImportProgress {
            phase,
            index,
            total,
            item_name: name.to_string(),
            overall,
            eta: estimate_eta(self.started.elapsed(), overall),
        });
    }
}

fn display_name(source: &Path, index: usize) -> String {
    source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("item-{}", index + 1))
}

/// Errors that end the whole import rather than one item
fn is_fatal(e: &VaultError) -> bool {
    matches!(e, VaultError::PersistenceFailed(_) | VaultError::GalleryNotFound(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryConfig, ThumbnailConfig, VaultConfig};
    use crate::crypto::{decrypt_with_aad, EncryptedBlob};
    use image::{Rgb, RgbImage};
    use parking_lot::Mutex;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        store: Arc<GalleryStore>,
        memory: Arc<MemoryManager>,
        coordinator: ImportCoordinator,
    }

    fn fixture() -> Fixture {
        fixture_with(64 << 20, ImportConfig::default())
    }

    fn fixture_with(max_heap: u64, import: ImportConfig) -> Fixture {
        let dir = tempdir().unwrap();
        let config = VaultConfig::with_root(dir.path().join("vault"));
        let store = Arc::new(GalleryStore::open(&config).unwrap());
        let memory = Arc::new(MemoryManager::new(&MemoryConfig {
            max_heap_bytes: Some(max_heap),
            ..Default::default()
        }));
        let pipeline = Arc::new(ThumbnailPipeline::new(
            Arc::clone(&memory),
            ThumbnailConfig::default(),
            dir.path().join("scratch"),
        ));
        let coordinator = ImportCoordinator::new(
            Arc::clone(&store),
            pipeline,
            Arc::clone(&memory),
            import,
        );
        Fixture {
            dir,
            store,
            memory,
            coordinator,
        }
    }

    fn photos(dir: &Path, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("photo{}.jpg", i));
                RgbImage::from_pixel(400, 300, Rgb([i as u8 * 30, 90, 160])).save(&path).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_weighted_progress() {
        assert_eq!(overall_fraction(ImportPhase::Encrypting, 0, 4), 0.0);
        assert!((overall_fraction(ImportPhase::Encrypting, 2, 4) - 0.30).abs() < 1e-9);
        assert!((overall_fraction(ImportPhase::GeneratingThumbnails, 4, 4) - 0.95).abs() < 1e-9);
        assert_eq!(overall_fraction(ImportPhase::Finalizing, 1, 1), 1.0);
        assert!((overall_fraction(ImportPhase::GeneratingThumbnails, 0, 0) - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_eta_indeterminate_until_five_percent() {
        assert_eq!(estimate_eta(Duration::from_secs(3), 0.04), None);
        assert_eq!(estimate_eta(Duration::from_secs(3), 0.05), None);
        assert_eq!(estimate_eta(Duration::from_secs(10), 0.5), Some(Duration::from_secs(10)));
        assert_eq!(estimate_eta(Duration::from_secs(10), 1.0), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_import_isolates_corrupt_item() {
        let fx = fixture();
        let gallery = fx.store.create_gallery("Trip", "2468").unwrap();

        let mut items = photos(fx.dir.path(), 3);
        let corrupt = fx.dir.path().join("broken.jpg");
        std::fs::write(&corrupt, b"\xFF\xD8\xFF garbage that is not a jpeg body").unwrap();
        items.insert(1, corrupt);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = fx
            .coordinator
            .start_import(items, gallery.clone(), move |p| sink.lock().push(p.clone()));
        let report = handle.join().await.unwrap();

        assert_eq!(report.imported.len(), 3);
        assert_eq!(report.failed_items(), 1);
        assert_eq!(report.failures[0].item_name, "broken.jpg");
        assert_eq!(report.thumbnails, 3);
        assert!(!report.cancelled);

        // Nothing left behind for the failed item
        assert_eq!(fx.store.sorted_media(&gallery).unwrap().len(), 3);
        let media_dir = fx.store.gallery_dir(&gallery).unwrap().join("media");
        assert_eq!(std::fs::read_dir(media_dir).unwrap().count(), 3);

        let seen = seen.lock();
        let phases: Vec<ImportPhase> = seen.iter().map(|p| p.phase).collect();
        let mut sorted = phases.clone();
        sorted.sort();
        assert_eq!(phases, sorted, "phases never interleave");
        assert_eq!(seen.iter().filter(|p| p.phase == ImportPhase::Encrypting).count(), 4);
        assert_eq!(seen.iter().filter(|p| p.phase == ImportPhase::GeneratingThumbnails).count(), 3);
        assert!(seen.windows(2).all(|w| w[0].overall <= w[1].overall));
        assert_eq!(seen.last().unwrap().overall, 1.0);
        assert!(seen[0].eta.is_some() || seen[0].overall <= ETA_MIN_FRACTION);
    }

    #[tokio::test]
    async fn test_thumbnails_are_stored_encrypted() {
        let fx = fixture();
        let gallery = fx.store.create_gallery("Thumbs", "1357").unwrap();
        let items = photos(fx.dir.path(), 2);

        let report = fx
            .coordinator
            .start_import(items, gallery.clone(), |_| {})
            .join()
            .await
            .unwrap();

        let dir = fx.store.gallery_dir(&gallery).unwrap();
        for media in &report.imported {
            let stored = std::fs::read(dir.join(media.thumbnail_file())).unwrap();
            assert_ne!(&stored[..3], &[0xFF, 0xD8, 0xFF]);
        }
    }

    #[tokio::test]
    async fn test_cancel_keeps_imported_items() {
        let fx = fixture();
        let gallery = fx.store.create_gallery("Cancel", "1111").unwrap();
        let items = photos(fx.dir.path(), 6);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = fx.coordinator.start_import(items, gallery.clone(), move |p| {
            let _ = tx.send(p.clone());
        });

        // Cancel as soon as the first item is encrypted
        let first = rx.recv().await.unwrap();
        assert_eq!(first.phase, ImportPhase::Encrypting);
        handle.cancel();
        let report = handle.join().await.unwrap();

        assert!(report.cancelled);
        assert!(!report.imported.is_empty());
        assert!(report.imported.len() < 6);
        assert_eq!(fx.store.sorted_media(&gallery).unwrap().len(), report.imported.len());

        // Still there after reopening
        let reopened = GalleryStore::open(&VaultConfig::with_root(fx.dir.path().join("vault"))).unwrap();
        let unlocked = reopened.find_by_pin("1111").unwrap().unwrap();
        assert_eq!(reopened.sorted_media(&unlocked).unwrap().len(), report.imported.len());
    }

    #[tokio::test]
    async fn test_thumbnail_retried_smaller_after_out_of_memory() {
        // 512px needs a 1/4-scale decode of 2048x2048 (512*512*6 bytes);
        // 256px gets by with 1/8 scale
        let fx = fixture_with(
            1 << 20,
            ImportConfig {
                thumbnail_size: 512,
                ..Default::default()
            },
        );
        let gallery = fx.store.create_gallery("Retry", "9753").unwrap();
        let source = fx.dir.path().join("big.jpg");
        RgbImage::from_pixel(2048, 2048, Rgb([200, 40, 40])).save(&source).unwrap();

        let report = fx
            .coordinator
            .start_import(vec![source], gallery.clone(), |_| {})
            .join()
            .await
            .unwrap();

        assert_eq!(report.imported.len(), 1);
        assert_eq!(report.thumbnails, 1);
        assert!(report.failures.is_empty());
        assert!(fx.memory.stats().refusals >= 1);
        assert!(fx.memory.stats().cleanups >= 1);

        let media = &report.imported[0];
        let dir = fx.store.gallery_dir(&gallery).unwrap();
        let sealed = std::fs::read(dir.join(media.thumbnail_file())).unwrap();
        let blob = EncryptedBlob::from_bytes(&sealed).unwrap();
        let jpeg = decrypt_with_aad(&blob.iv, &blob.ciphertext, media.id.as_bytes(), gallery.key()).unwrap();
        let stored = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((stored.width(), stored.height()), (256, 256));
    }

    #[tokio::test]
    async fn test_low_memory_cleans_up_and_pauses_between_items() {
        let fx = fixture();
        let gallery = fx.store.create_gallery("Low", "3141").unwrap();
        let items = photos(fx.dir.path(), 2);

        // Low but not critical
        let _hog = fx.memory.reserve(fx.memory.budget().max() * 90 / 100).unwrap();
        assert!(fx.memory.is_low() && !fx.memory.is_critical());

        let report = fx
            .coordinator
            .start_import(items, gallery, |_| {})
            .join()
            .await
            .unwrap();

        assert_eq!(report.imported.len(), 2);
        assert_eq!(report.thumbnails, 2);
        // Two encrypt pauses of 150ms and two thumbnail pauses of 400ms
        assert!(fx.memory.stats().cleanups >= 4);
        assert!(report.elapsed >= Duration::from_millis(2 * 150 + 2 * 400));
    }

    #[tokio::test]
    async fn test_critical_memory_fails_items_not_batch() {
        let fx = fixture();
        let gallery = fx.store.create_gallery("Tight", "8642").unwrap();
        let items = photos(fx.dir.path(), 2);

        let _hog = fx.memory.reserve(fx.memory.budget().max() * 97 / 100).unwrap();
        let report = fx
            .coordinator
            .start_import(items, gallery, |_| {})
            .join()
            .await
            .unwrap();

        assert!(report.imported.is_empty());
        assert_eq!(report.failed_items(), 2);
        assert!(report.failures[0].error.contains("memory"));
    }
}
