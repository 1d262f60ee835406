//! Secure Gallery - Video Playback Preparation
//!
//! Videos are played from a decrypted temp file. Small files are decrypted
//! whole before the handle is returned. Larger ones get a quick-start chunk
//! up front while the rest is appended by a background task, so playback
//! can begin before decryption finishes.
//!
//! Temp files are shared per media item and reference counted by
//! [`PlayableFile`] handles. Once unreferenced for `temp_ttl` the janitor
//! shreds them.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::PlaybackConfig;
use crate::crypto::{open_media_file, MediaDecryptor};
use crate::error::{VaultError, VaultResult};
use crate::secure_fs::shred_file;
use crate::thumbs::MediaRef;

const TEMP_PREFIX: &str = "play-";

/// Progress of the decrypted temp file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillState {
    /// Background decryption still appending
    Partial,
    Complete,
    Cancelled,
    Failed(String),
}

/// Quick-start chunk for a `file_size` video: a tenth of the file,
/// clamped to the configured bounds
pub fn initial_chunk_len(file_size: u64, config: &PlaybackConfig) -> u64 {
    (file_size / 10)
        .clamp(config.min_initial_chunk, config.max_initial_chunk.max(config.min_initial_chunk))
        .min(file_size)
}

struct PlaybackEntry {
    media_id: Uuid,
    path: PathBuf,
    total_len: u64,
    available: AtomicU64,
    refs: AtomicUsize,
    released_at: Mutex<Instant>,
    cancel: AtomicBool,
    state: watch::Sender<FillState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackEntry {
    fn acquire(self: &Arc<Self>) -> PlayableFile {
        self.refs.fetch_add(1, Ordering::AcqRel);
        PlayableFile { entry: Arc::clone(self) }
    }

    fn is_usable(&self) -> bool {
        matches!(*self.state.borrow(), FillState::Partial | FillState::Complete) && self.path.exists()
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        self.refs.load(Ordering::Acquire) == 0 && now.saturating_duration_since(*self.released_at.lock()) >= ttl
    }

    /// Decrypt remaining segments into `out`, publishing progress
    fn fill(&self, decryptor: &mut MediaDecryptor<File>, out: &mut File, until: u64) -> VaultResult<()> {
        let mut written = self.available.load(Ordering::Acquire);
        while written < until {
            if self.cancel.load(Ordering::Acquire) {
                return Err(VaultError::Cancelled);
            }
            let Some(segment) = decryptor.next_segment()? else {
                break;
            };
            out.write_all(&segment)?;
            written += segment.len() as u64;
            self.available.store(written, Ordering::Release);
        }
        out.flush()?;
        Ok(())
    }

    fn finish(&self, decryptor: &MediaDecryptor<File>) -> FillState {
        if decryptor.is_finished() {
            FillState::Complete
        } else {
            FillState::Failed("stream ended early".into())
        }
    }

    fn teardown(&self) {
        self.cancel.store(true, Ordering::Release);
        if let Err(e) = shred_file(&self.path) {
            warn!("Could not remove playback file {}: {}", self.path.display(), e);
        }
    }
}

/// A decrypted, playable video. The file stays on disk at least as long as
/// any clone of this handle exists.
pub struct PlayableFile {
    entry: Arc<PlaybackEntry>,
}

impl PlayableFile {
    pub fn path(&self) -> &Path {
        &self.entry.path
    }

    pub fn media_id(&self) -> Uuid {
        self.entry.media_id
    }

    /// Plaintext size of the whole video
    pub fn total_len(&self) -> u64 {
        self.entry.total_len
    }

    /// Bytes already decrypted into the file
    pub fn available_len(&self) -> u64 {
        self.entry.available.load(Ordering::Acquire)
    }

    pub fn state(&self) -> FillState {
        self.entry.state.borrow().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.state() == FillState::Complete
    }

    /// Wait for background decryption to end
    pub async fn wait_complete(&self) -> VaultResult<()> {
        let mut rx = self.entry.state.subscribe();
        let state = rx
            .wait_for(|s| *s != FillState::Partial)
            .await
            .map_err(|e| VaultError::TaskFailed(e.to_string()))?
            .clone();
        match state {
            FillState::Cancelled => Err(VaultError::Cancelled),
            FillState::Failed(_) => Err(VaultError::Crypto),
            _ => Ok(()),
        }
    }
}

impl Clone for PlayableFile {
    fn clone(&self) -> Self {
        self.entry.acquire()
    }
}

impl Drop for PlayableFile {
    fn drop(&mut self) {
        *self.entry.released_at.lock() = Instant::now();
        self.entry.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for PlayableFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayableFile")
            .field("media_id", &self.entry.media_id)
            .field("path", &self.entry.path)
            .field("available", &self.available_len())
            .field("total", &self.entry.total_len)
            .finish()
    }
}

/// Owner of every playback temp file and the tasks filling them
pub struct PlaybackManager {
    config: PlaybackConfig,
    dir: PathBuf,
    entries: Mutex<HashMap<Uuid, Arc<PlaybackEntry>>>,
    /// Held across a decrypt so one media item is prepared at a time
    preparing: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl PlaybackManager {
    /// Use `dir` for temp files, shredding any left over from a previous run
    pub fn new(config: PlaybackConfig, dir: PathBuf) -> VaultResult<Self> {
        fs::create_dir_all(&dir)?;
        let mut purged = 0;
        for entry in fs::read_dir(&dir)?.flatten() {
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                shred_file(&entry.path())?;
                purged += 1;
            }
        }
        if purged > 0 {
            info!("Removed {} stale playback files", purged);
        }

        Ok(Self {
            config,
            dir,
            entries: Mutex::new(HashMap::new()),
            preparing: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Number of live temp files
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decrypt `media` for playback.
    ///
    /// Returns once the whole file (small videos) or the quick-start chunk
    /// (large ones) is on disk. An existing temp file for the same item is
    /// shared, including one still being prepared by a concurrent caller.
    pub async fn prepare(&self, media: &MediaRef) -> VaultResult<PlayableFile> {
        let slot = Arc::clone(self.preparing.lock().entry(media.id).or_default());
        let result = {
            let _guard = slot.lock().await;
            self.prepare_exclusive(media).await
        };

        let mut preparing = self.preparing.lock();
        // Map plus our clone: nobody else is waiting on this slot
        if Arc::strong_count(&slot) <= 2 {
            preparing.remove(&media.id);
        }
        result
    }

    async fn prepare_exclusive(&self, media: &MediaRef) -> VaultResult<PlayableFile> {
        let stale = {
            let mut entries = self.entries.lock();
            match entries.get(&media.id).map(|e| e.is_usable()) {
                Some(true) => {
                    debug!("Reusing playback file for {}", media.id);
                    return Ok(entries[&media.id].acquire());
                }
                Some(false) => entries.remove(&media.id),
                None => None,
            }
        };
        if let Some(stale) = stale {
            stale.teardown();
        }

        let (out, path) = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(".tmp")
            .tempfile_in(&self.dir)?
            .keep()
            .map_err(|e| VaultError::Io(e.error))?;

        let (state, _) = watch::channel(FillState::Partial);
        let entry = Arc::new(PlaybackEntry {
            media_id: media.id,
            path,
            total_len: media.size,
            available: AtomicU64::new(0),
            refs: AtomicUsize::new(0),
            released_at: Mutex::new(Instant::now()),
            cancel: AtomicBool::new(false),
            state,
            task: Mutex::new(None),
        });
        let handle = entry.acquire();

        let whole = media.size <= self.config.whole_file_threshold;
        let until = if whole {
            u64::MAX
        } else {
            initial_chunk_len(media.size, &self.config)
        };

        let started = {
            let entry = Arc::clone(&entry);
            let media = media.clone();
            tokio::task::spawn_blocking(move || -> VaultResult<(MediaDecryptor<File>, File)> {
                let mut out = out;
                let mut decryptor = open_media_file(&media.payload, &media.key, &media.id)?;
                entry.fill(&mut decryptor, &mut out, until)?;
                Ok((decryptor, out))
            })
            .await
        };

        let (decryptor, out) = match started.map_err(VaultError::from).and_then(|r| r) {
            Ok(parts) => parts,
            Err(e) => {
                entry.teardown();
                return Err(e);
            }
        };

        if whole || decryptor.is_finished() {
            let state = entry.finish(&decryptor);
            if let FillState::Failed(reason) = &state {
                warn!("Playback decrypt of {} failed: {}", media.id, reason);
                entry.teardown();
                return Err(VaultError::Crypto);
            }
            entry.state.send_replace(state);
            debug!("Decrypted {} whole ({} bytes)", media.id, entry.available.load(Ordering::Acquire));
        } else {
            debug!(
                "Quick start for {}: {} of {} bytes, continuing in background",
                media.id,
                entry.available.load(Ordering::Acquire),
                media.size
            );
            let task = {
                let entry = Arc::clone(&entry);
                tokio::task::spawn_blocking(move || Self::continue_fill(&entry, decryptor, out))
            };
            *entry.task.lock() = Some(task);
        }

        let displaced = self.entries.lock().insert(media.id, entry);
        if let Some(displaced) = displaced {
            warn!("Replaced a live playback file for {}", media.id);
            displaced.teardown();
        }
        Ok(handle)
    }

    fn continue_fill(entry: &PlaybackEntry, mut decryptor: MediaDecryptor<File>, mut out: File) {
        let state = match entry.fill(&mut decryptor, &mut out, u64::MAX) {
            Ok(()) => entry.finish(&decryptor),
            Err(VaultError::Cancelled) => FillState::Cancelled,
            Err(e) => FillState::Failed(e.to_string()),
        };
        match &state {
            FillState::Failed(reason) => warn!("Background decrypt of {} failed: {}", entry.media_id, reason),
            FillState::Cancelled => debug!("Background decrypt of {} cancelled", entry.media_id),
            _ => debug!("Background decrypt of {} complete", entry.media_id),
        }
        entry.state.send_replace(state);
    }

    /// Shred temp files unreferenced for at least `temp_ttl` as of `now`
    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let ttl = self.config.temp_ttl();
        let expired: Vec<Arc<PlaybackEntry>> = {
            let mut entries = self.entries.lock();
            let ids: Vec<Uuid> = entries
                .iter()
                .filter(|(_, e)| e.is_expired(now, ttl))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        for entry in &expired {
            debug!("Playback file for {} expired", entry.media_id);
            entry.teardown();
        }
        expired.len()
    }

    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    /// Drop a single item's temp file regardless of references
    pub fn release_media(&self, media_id: &Uuid) -> bool {
        let removed = self.entries.lock().remove(media_id);
        match removed {
            Some(entry) => {
                entry.teardown();
                true
            }
            None => false,
        }
    }

    /// Stop all background decryption and shred every temp file
    pub async fn cleanup_all(&self) -> usize {
        let drained: Vec<Arc<PlaybackEntry>> = self.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.cancel.store(true, Ordering::Release);
        }
        for entry in &drained {
            let task = entry.task.lock().take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!("Playback task for {} ended abnormally: {}", entry.media_id, e);
                }
            }
            entry.teardown();
        }
        if !drained.is_empty() {
            info!("Removed {} playback files", drained.len());
        }
        drained.len()
    }

    /// Periodic sweep that ends when the manager is dropped
    pub fn spawn_janitor(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let swept = manager.sweep_expired();
                if swept > 0 {
                    info!("Janitor removed {} playback files", swept);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{encrypt_media_file, GalleryKey};
    use crate::gallery::MediaKind;
    use tempfile::{tempdir, TempDir};

    const KIB: u64 = 1024;

    fn small_config() -> PlaybackConfig {
        PlaybackConfig {
            whole_file_threshold: 256 * KIB,
            min_initial_chunk: 64 * KIB,
            max_initial_chunk: 128 * KIB,
            ..Default::default()
        }
    }

    fn video(dir: &TempDir, len: usize) -> (MediaRef, Vec<u8>) {
        let plain: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        let id = Uuid::new_v4();
        let key = Arc::new(GalleryKey::generate());
        let source = dir.path().join("source.mp4");
        fs::write(&source, &plain).unwrap();
        let payload = dir.path().join(format!("{}.enc", id));
        let size = encrypt_media_file(&source, &payload, &key, &id).unwrap();
        let media = MediaRef {
            id,
            kind: MediaKind::Video,
            payload,
            thumbnail: dir.path().join("unused"),
            size,
            key,
        };
        (media, plain)
    }

    #[test]
    fn test_initial_chunk_scaling() {
        let config = PlaybackConfig::default();
        const MIB: u64 = 1024 * 1024;
        assert_eq!(initial_chunk_len(60 * MIB, &config), 6 * MIB);
        assert_eq!(initial_chunk_len(5 * MIB, &config), 2 * MIB);
        assert_eq!(initial_chunk_len(1000 * MIB, &config), 20 * MIB);
        assert_eq!(initial_chunk_len(MIB, &config), MIB);
    }

    #[tokio::test]
    async fn test_small_video_decrypted_whole() {
        let dir = tempdir().unwrap();
        let (media, plain) = video(&dir, 100_000);
        let manager = PlaybackManager::new(small_config(), dir.path().join("play")).unwrap();

        let file = manager.prepare(&media).await.unwrap();
        assert!(file.is_complete());
        assert_eq!(file.available_len(), plain.len() as u64);
        assert_eq!(fs::read(file.path()).unwrap(), plain);
    }

    #[tokio::test]
    async fn test_large_video_streams_in_background() {
        let dir = tempdir().unwrap();
        let (media, plain) = video(&dir, 1_500_000);
        let manager = PlaybackManager::new(small_config(), dir.path().join("play")).unwrap();

        let file = manager.prepare(&media).await.unwrap();
        assert!(file.available_len() >= 128 * KIB);

        file.wait_complete().await.unwrap();
        assert!(file.is_complete());
        assert_eq!(fs::read(file.path()).unwrap(), plain);
    }

    #[tokio::test]
    async fn test_handles_share_one_file() {
        let dir = tempdir().unwrap();
        let (media, _) = video(&dir, 10_000);
        let manager = PlaybackManager::new(small_config(), dir.path().join("play")).unwrap();

        let a = manager.prepare(&media).await.unwrap();
        let b = manager.prepare(&media).await.unwrap();
        assert_eq!(a.path(), b.path());
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_prepares_share_one_file() {
        let dir = tempdir().unwrap();
        let (media, plain) = video(&dir, 200_000);
        let play = dir.path().join("play");
        let manager = PlaybackManager::new(small_config(), play.clone()).unwrap();

        let (a, b) = tokio::join!(manager.prepare(&media), manager.prepare(&media));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.path(), b.path());
        assert_eq!(manager.len(), 1);
        assert_eq!(fs::read_dir(&play).unwrap().count(), 1);
        assert_eq!(fs::read(a.path()).unwrap(), plain);
        assert!(manager.preparing.lock().is_empty());

        assert_eq!(manager.cleanup_all().await, 1);
        assert_eq!(fs::read_dir(&play).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_respects_references_and_ttl() {
        let dir = tempdir().unwrap();
        let (media, _) = video(&dir, 10_000);
        let manager = PlaybackManager::new(small_config(), dir.path().join("play")).unwrap();
        let ttl = manager.config().temp_ttl();

        let file = manager.prepare(&media).await.unwrap();
        let path = file.path().to_path_buf();
        let later = Instant::now() + ttl + Duration::from_secs(1);

        // Still referenced
        assert_eq!(manager.sweep_expired_at(later), 0);
        assert!(path.exists());

        drop(file);
        assert_eq!(manager.sweep_expired_at(Instant::now()), 0);
        assert_eq!(manager.sweep_expired_at(later), 1);
        assert!(!path.exists());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_all_and_wrong_key() {
        let dir = tempdir().unwrap();
        let (media, _) = video(&dir, 1_000_000);
        let manager = PlaybackManager::new(small_config(), dir.path().join("play")).unwrap();

        let file = manager.prepare(&media).await.unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(manager.cleanup_all().await, 1);
        assert!(!path.exists());

        let wrong = MediaRef {
            key: Arc::new(GalleryKey::generate()),
            ..media
        };
        assert!(matches!(manager.prepare(&wrong).await, Err(VaultError::Crypto)));
        assert_eq!(fs::read_dir(dir.path().join("play")).unwrap().count(), 0);
    }

    #[test]
    fn test_stale_files_purged_on_start() {
        let dir = tempdir().unwrap();
        let play = dir.path().join("play");
        fs::create_dir_all(&play).unwrap();
        fs::write(play.join("play-leftover.tmp"), b"plaintext").unwrap();
        fs::write(play.join("keep.txt"), b"other").unwrap();

        PlaybackManager::new(small_config(), play.clone()).unwrap();
        assert!(!play.join("play-leftover.tmp").exists());
        assert!(play.join("keep.txt").exists());
    }
}
