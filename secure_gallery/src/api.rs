//! Secure Gallery - Public API
//!
//! [`GalleryVault`] is the single object a host application constructs at
//! start-up and tears down at exit. It owns the store, the memory manager
//! and the pipelines; nothing in the crate is a global.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};
use crate::gallery::{Gallery, GalleryStore, MediaKind, NoteContent, SecureMedia, SortOrder, UnlockedGallery};
use crate::import::{ImportCoordinator, ImportHandle, ImportProgress};
use crate::memory::{MemoryManager, MemoryStats, PinnedBitmap};
use crate::playback::{PlayableFile, PlaybackManager};
use crate::thumbs::{MediaRef, ThumbnailPipeline};

/// Encrypted gallery vault
///
/// # Example
///
/// ```rust,ignore
/// let vault = GalleryVault::open(VaultConfig::with_root("./calc_vault"))?;
///
/// let gallery = vault.create_gallery("Vault", "1234")?;
/// let photo = vault.add_photo(&gallery, Path::new("img.jpg"))?;
///
/// let unlocked = vault.find_gallery_by_pin("1234").await?.expect("gallery");
/// let thumb = vault.generate_thumbnail(&unlocked, &photo.id, 320, 240).await?;
/// ```
pub struct GalleryVault {
    config: VaultConfig,
    store: Arc<GalleryStore>,
    memory: Arc<MemoryManager>,
    thumbnails: Arc<ThumbnailPipeline>,
    playback: Arc<PlaybackManager>,
    importer: ImportCoordinator,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl GalleryVault {
    // ═══════════════════════════════════════════════════════════════════════
    // LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════════

    /// Open (or initialise) the vault at `config.root`
    pub fn open(config: VaultConfig) -> VaultResult<Self> {
        config.validate()?;
        let store = Arc::new(GalleryStore::open(&config)?);
        let memory = Arc::new(MemoryManager::new(&config.memory));

        let cache_dir = config.cache_dir();
        let thumbnails = Arc::new(ThumbnailPipeline::new(
            Arc::clone(&memory),
            config.thumbnails.clone(),
            cache_dir.join("frames"),
        ));
        let playback = Arc::new(PlaybackManager::new(config.playback.clone(), cache_dir.join("playback"))?);
        let importer = ImportCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&thumbnails),
            Arc::clone(&memory),
            config.import.clone(),
        );

        info!("Opened vault at {} ({} galleries)", config.root.display(), store.len());
        Ok(Self {
            config,
            store,
            memory,
            thumbnails,
            playback,
            importer,
            janitor: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Start the periodic playback temp-file sweep. Needs a tokio runtime.
    pub fn start_janitor(&self) {
        let mut janitor = self.janitor.lock();
        if janitor.is_none() {
            *janitor = Some(self.playback.spawn_janitor());
        }
    }

    /// Stop background work and remove every decrypted temporary
    pub async fn shutdown(&self) -> VaultResult<()> {
        let janitor = self.janitor.lock().take();
        if let Some(janitor) = janitor {
            janitor.abort();
        }
        self.playback.cleanup_all().await;
        self.memory.force_cleanup();
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.flush()).await??;
        info!("Vault shut down");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // GALLERIES
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a gallery; [`VaultError::NameConflict`] if the name is taken
    pub fn create_gallery(&self, name: &str, pin: &str) -> VaultResult<UnlockedGallery> {
        self.store.create_gallery(name, pin)
    }

    /// The gallery this PIN opens, if any. A wrong PIN and a missing
    /// gallery look the same. Key derivation runs on the blocking pool.
    pub async fn find_gallery_by_pin(&self, pin: &str) -> VaultResult<Option<UnlockedGallery>> {
        let store = Arc::clone(&self.store);
        let pin = Zeroizing::new(pin.to_string());
        tokio::task::spawn_blocking(move || store.find_by_pin(&pin)).await?
    }

    pub fn gallery(&self, unlocked: &UnlockedGallery) -> VaultResult<Gallery> {
        self.store.gallery(unlocked)
    }

    pub fn rename_gallery(&self, unlocked: &UnlockedGallery, new_name: &str) -> VaultResult<()> {
        self.store.rename_gallery(unlocked, new_name)
    }

    /// Delete the gallery, its files and anything cached for its media
    pub fn delete_gallery(&self, unlocked: &UnlockedGallery) -> VaultResult<usize> {
        let gallery = self.store.gallery(unlocked)?;
        let removed = self.store.delete_gallery(unlocked)?;
        for media in &gallery.media {
            self.forget(&media.id);
        }
        Ok(removed)
    }

    fn forget(&self, media_id: &Uuid) {
        self.memory.forget_media(media_id);
        self.playback.release_media(media_id);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // NOTES
    // ═══════════════════════════════════════════════════════════════════════

    pub fn add_note(&self, unlocked: &UnlockedGallery, title: &str, body: &str) -> VaultResult<Uuid> {
        self.store.add_note(unlocked, title, body)
    }

    pub fn notes(&self, unlocked: &UnlockedGallery) -> VaultResult<Vec<NoteContent>> {
        self.store.notes(unlocked)
    }

    pub fn remove_note(&self, unlocked: &UnlockedGallery, note_id: &Uuid) -> VaultResult<()> {
        self.store.remove_note(unlocked, note_id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // MEDIA
    // ═══════════════════════════════════════════════════════════════════════

    pub fn add_photo(&self, unlocked: &UnlockedGallery, source: &Path) -> VaultResult<SecureMedia> {
        self.store.add_photo(unlocked, source)
    }

    /// Add a photo or video, detected from its content
    pub fn add_media(&self, unlocked: &UnlockedGallery, source: &Path) -> VaultResult<SecureMedia> {
        self.store.add_media(unlocked, source)
    }

    /// Media in the gallery's display order
    pub fn media(&self, unlocked: &UnlockedGallery) -> VaultResult<Vec<SecureMedia>> {
        self.store.sorted_media(unlocked)
    }

    pub fn remove_media(&self, unlocked: &UnlockedGallery, media_id: &Uuid) -> VaultResult<()> {
        self.store.remove_media(unlocked, media_id)?;
        self.forget(media_id);
        Ok(())
    }

    pub fn set_sort_order(&self, unlocked: &UnlockedGallery, order: SortOrder) -> VaultResult<()> {
        self.store.set_sort_order(unlocked, order)
    }

    pub fn reorder_media(&self, unlocked: &UnlockedGallery, order: &[Uuid]) -> VaultResult<()> {
        self.store.reorder_media(unlocked, order)
    }

    /// Resolve a media id into everything needed to read it
    pub fn media_ref(&self, unlocked: &UnlockedGallery, media_id: &Uuid) -> VaultResult<MediaRef> {
        let media = self.store.media(unlocked, media_id)?;
        let dir = self.store.gallery_dir(unlocked)?;
        Ok(MediaRef::new(&dir, &media, Arc::clone(unlocked.key())))
    }

    /// Decrypt a whole media item into memory
    pub fn read_media(&self, unlocked: &UnlockedGallery, media_id: &Uuid) -> VaultResult<Vec<u8>> {
        let media = self.media_ref(unlocked, media_id)?;
        let _held = self.memory.reserve(media.size)?;
        crate::crypto::decrypt_media_bytes(&media.payload, &media.key, &media.id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // THUMBNAILS & PLAYBACK
    // ═══════════════════════════════════════════════════════════════════════

    /// Preview within `max_w x max_h`. Only an unknown id is an error;
    /// anything else degrades to a placeholder.
    pub async fn generate_thumbnail(
        &self,
        unlocked: &UnlockedGallery,
        media_id: &Uuid,
        max_w: u32,
        max_h: u32,
    ) -> VaultResult<PinnedBitmap> {
        let media = self.media_ref(unlocked, media_id)?;
        Ok(self.thumbnails.generate_thumbnail(&media, max_w, max_h).await)
    }

    /// Decrypt a video to a temp file for a player
    pub async fn prepare_video_for_playback(
        &self,
        unlocked: &UnlockedGallery,
        media_id: &Uuid,
    ) -> VaultResult<PlayableFile> {
        let media = self.media_ref(unlocked, media_id)?;
        if media.kind != MediaKind::Video {
            return Err(VaultError::InvalidFileFormat(format!("{} is not a video", media_id)));
        }
        debug!("Preparing {} ({} bytes) for playback", media.id, media.size);
        self.playback.prepare(&media).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // IMPORT
    // ═══════════════════════════════════════════════════════════════════════

    /// Import a batch in the background; see [`crate::import`]
    pub fn start_import<F>(&self, items: Vec<PathBuf>, unlocked: &UnlockedGallery, on_progress: F) -> ImportHandle
    where
        F: Fn(&ImportProgress) + Send + Sync + 'static,
    {
        self.importer.start_import(items, unlocked.clone(), on_progress)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DIAGNOSTICS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn memory_snapshot(&self) -> MemoryStats {
        self.memory.stats()
    }

    /// Human-readable memory report
    pub fn memory_stats(&self) -> String {
        format!(
            "{}\nplayback files: {}\ngalleries: {}",
            self.memory.stats(),
            self.playback.len(),
            self.store.len()
        )
    }
}

impl Drop for GalleryVault {
    fn drop(&mut self) {
        if let Some(janitor) = self.janitor.get_mut().take() {
            janitor.abort();
        }
    }
}
