//! Secure Gallery - Thumbnail Pipeline
//!
//! Bounded previews for photos and videos. [`ThumbnailPipeline::generate_thumbnail`]
//! never fails: when memory is short, the media is unreadable or no frame
//! can be found it returns a drawn placeholder instead.

pub mod photo;
pub mod video;

pub use video::{prefix_len, ExtractContext, FrameExtractor, FramePosition, MotionJpegExtractor};

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::{DynamicImage, ImageFormat};
use log::{debug, warn};
use uuid::Uuid;

use crate::config::ThumbnailConfig;
use crate::crypto::{decrypt_media_bytes, decrypt_with_aad, encrypt_with_aad, EncryptedBlob, GalleryKey};
use crate::error::{VaultError, VaultResult};
use crate::gallery::{MediaKind, SecureMedia};
use crate::memory::{Bitmap, MemoryManager, PinnedBitmap};
use crate::secure_fs::SecureFs;

/// Everything needed to read one encrypted media item
#[derive(Debug, Clone)]
pub struct MediaRef {
    pub id: Uuid,
    pub kind: MediaKind,
    /// Encrypted payload
    pub payload: PathBuf,
    /// Encrypted on-disk thumbnail (may not exist)
    pub thumbnail: PathBuf,
    /// Plaintext size
    pub size: u64,
    pub key: Arc<GalleryKey>,
}

impl MediaRef {
    pub fn new(gallery_dir: &Path, media: &SecureMedia, key: Arc<GalleryKey>) -> Self {
        Self {
            id: media.id,
            kind: media.kind,
            payload: gallery_dir.join(&media.file),
            thumbnail: gallery_dir.join(media.thumbnail_file()),
            size: media.size,
            key,
        }
    }
}

/// Cache key for a media item at a requested bound
pub fn thumbnail_key(media_id: &Uuid, max_w: u32, max_h: u32) -> String {
    format!("{}:{}x{}", media_id, max_w, max_h)
}

/// Preview generator bound to one memory manager
pub struct ThumbnailPipeline {
    memory: Arc<MemoryManager>,
    config: ThumbnailConfig,
    extractor: Arc<dyn FrameExtractor>,
    scratch_dir: PathBuf,
}

impl ThumbnailPipeline {
    pub fn new(memory: Arc<MemoryManager>, config: ThumbnailConfig, scratch_dir: PathBuf) -> Self {
        let extractor = Arc::new(MotionJpegExtractor::new(config.assumed_fps));
        Self {
            memory,
            config,
            extractor,
            scratch_dir,
        }
    }

    /// Replace the frame extractor used for videos
    pub fn with_extractor(mut self, extractor: Arc<dyn FrameExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &ThumbnailConfig {
        &self.config
    }

    /// Drawn stand-in, never cached
    pub fn placeholder(kind: MediaKind, max_w: u32, max_h: u32) -> PinnedBitmap {
        PinnedBitmap::detached(Arc::new(Bitmap::placeholder(kind, max_w, max_h)))
    }

    /// Preview of `media` within `max_w x max_h`, pinned for the caller.
    ///
    /// Served from the bitmap cache when possible; otherwise rendered and
    /// offered to the cache (which declines while memory is critical).
    /// Every failure degrades to [`placeholder`](Self::placeholder); an
    /// allocation refusal also triggers a forced cleanup first.
    pub async fn generate_thumbnail(&self, media: &MediaRef, max_w: u32, max_h: u32) -> PinnedBitmap {
        let key = thumbnail_key(&media.id, max_w, max_h);
        if let Some(hit) = self.memory.cached_thumbnail(&key) {
            return hit;
        }

        if self.memory.ensure_headroom().is_err() {
            debug!("Memory critical, placeholder for {}", media.id);
            return Self::placeholder(media.kind, max_w, max_h);
        }

        match self.render_thumbnail(media, max_w, max_h).await {
            Ok(bitmap) => self.memory.cache_thumbnail(&key, Arc::new(bitmap)),
            Err(e) if e.is_out_of_memory() => {
                let report = self.memory.force_cleanup();
                warn!(
                    "Out of memory rendering {} ({} bytes released), using placeholder",
                    media.id, report.bytes_released
                );
                Self::placeholder(media.kind, max_w, max_h)
            }
            Err(e) => {
                warn!("Thumbnail for {} failed: {}", media.id, e);
                Self::placeholder(media.kind, max_w, max_h)
            }
        }
    }

    /// Render without caching or fallback
    pub async fn render_thumbnail(&self, media: &MediaRef, max_w: u32, max_h: u32) -> VaultResult<Bitmap> {
        if let Some(bitmap) = self.from_disk_thumbnail(media, max_w, max_h)? {
            return Ok(bitmap);
        }

        match media.kind {
            MediaKind::Photo => {
                let media = media.clone();
                let memory = Arc::clone(&self.memory);
                tokio::task::spawn_blocking(move || Self::render_photo(&media, &memory, max_w, max_h)).await?
            }
            MediaKind::Video => {
                let media = media.clone();
                let memory = Arc::clone(&self.memory);
                let extractor = Arc::clone(&self.extractor);
                let scratch = self.scratch_dir.clone();
                let position = self.config.video_frame_position();
                let timeout = self.config.video_timeout();
                let cancel = Arc::new(AtomicBool::new(false));

                let task = {
                    let cancel = Arc::clone(&cancel);
                    tokio::task::spawn_blocking(move || {
                        let ctx = ExtractContext {
                            budget: memory.budget(),
                            cancel: &cancel,
                            max_w,
                            max_h,
                        };
                        let frame =
                            video::extract_frame(&media, &memory, extractor.as_ref(), &scratch, position, &ctx)?;
                        photo::to_thumbnail(&frame, max_w, max_h, memory.budget())
                    })
                };
                match tokio::time::timeout(timeout, task).await {
                    Ok(joined) => joined?,
                    Err(_) => {
                        cancel.store(true, Ordering::Release);
                        Err(VaultError::Timeout(timeout.as_secs()))
                    }
                }
            }
        }
    }

    fn render_photo(media: &MediaRef, memory: &MemoryManager, max_w: u32, max_h: u32) -> VaultResult<Bitmap> {
        let _held = memory.reserve(media.size)?;
        let bytes = decrypt_media_bytes(&media.payload, &media.key, &media.id)?;
        photo::decode_thumbnail(&bytes, max_w, max_h, memory.budget())
    }

    /// Use the stored thumbnail when it is at least as large as the request
    fn from_disk_thumbnail(&self, media: &MediaRef, max_w: u32, max_h: u32) -> VaultResult<Option<Bitmap>> {
        let Some(img) = self.load_stored(media)? else {
            return Ok(None);
        };
        if img.width() < max_w && img.height() < max_h {
            return Ok(None);
        }
        photo::to_thumbnail(&img, max_w, max_h, self.memory.budget()).map(Some)
    }

    fn load_stored(&self, media: &MediaRef) -> VaultResult<Option<DynamicImage>> {
        if !media.thumbnail.exists() {
            return Ok(None);
        }
        let fs = SecureFs::new(media.thumbnail.parent().unwrap_or(Path::new(".")));
        let name = media
            .thumbnail
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let sealed = fs.read_file(name)?;

        let blob = EncryptedBlob::from_bytes(&sealed)?;
        let jpeg = match decrypt_with_aad(&blob.iv, &blob.ciphertext, media.id.as_bytes(), &media.key) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                warn!("Stored thumbnail for {} unreadable: {}", media.id, e);
                return Ok(None);
            }
        };
        Ok(image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg).ok())
    }

    /// Render at `size x size` and store it encrypted next to the payload
    pub async fn persist_thumbnail(&self, media: &MediaRef, size: u32) -> VaultResult<()> {
        let bitmap = self.render_thumbnail(media, size, size).await?;
        let img = bitmap
            .to_rgb_image()
            .ok_or_else(|| VaultError::ThumbnailFailed("bitmap recycled before storing".into()))?;

        let mut jpeg = Vec::new();
        DynamicImage::ImageRgb8(img).write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)?;
        let sealed = encrypt_with_aad(&jpeg, media.id.as_bytes(), &media.key)?.to_bytes();

        let dir = media.thumbnail.parent().unwrap_or(Path::new("."));
        let name = media
            .thumbnail
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VaultError::ThumbnailFailed("bad thumbnail path".into()))?;
        SecureFs::new(dir).write_file(name, &sealed)?;
        debug!("Stored {}x{} thumbnail for {}", bitmap.width(), bitmap.height(), media.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::crypto::encrypt_media_file;
    use image::{Rgb, RgbImage};
    use tempfile::{tempdir, TempDir};

    fn memory(max: u64) -> Arc<MemoryManager> {
        Arc::new(MemoryManager::new(&MemoryConfig {
            max_heap_bytes: Some(max),
            ..Default::default()
        }))
    }

    fn pipeline(memory: Arc<MemoryManager>, dir: &Path) -> ThumbnailPipeline {
        ThumbnailPipeline::new(memory, ThumbnailConfig::default(), dir.join("scratch"))
    }

    /// Encrypt `plain` as a media payload and describe it
    fn sealed(dir: &TempDir, kind: MediaKind, plain: &[u8]) -> MediaRef {
        let id = Uuid::new_v4();
        let key = Arc::new(GalleryKey::generate());
        let source = dir.path().join(format!("{}.src", id));
        std::fs::write(&source, plain).unwrap();
        let payload = dir.path().join(format!("{}.enc", id));
        let size = encrypt_media_file(&source, &payload, &key, &id).unwrap();
        MediaRef {
            id,
            kind,
            payload,
            thumbnail: dir.path().join(format!("{}.thumb", id)),
            size,
            key,
        }
    }

    fn encoded(w: u32, h: u32, format: ImageFormat) -> Vec<u8> {
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([10, 120, 200])))
            .write_to(&mut Cursor::new(&mut out), format)
            .unwrap();
        out
    }

    fn jpeg_bytes(w: u32, h: u32) -> Vec<u8> {
        encoded(w, h, ImageFormat::Jpeg)
    }

    /// Spins until cancelled, recording whether it saw the cancellation
    struct StalledExtractor {
        saw_cancel: Arc<AtomicBool>,
    }

    impl FrameExtractor for StalledExtractor {
        fn name(&self) -> &'static str {
            "stalled"
        }

        fn extract_frame(
            &self,
            _source: &Path,
            _position: FramePosition,
            ctx: &ExtractContext<'_>,
        ) -> VaultResult<Option<photo::DecodedImage>> {
            let started = std::time::Instant::now();
            while started.elapsed() < std::time::Duration::from_secs(10) {
                if ctx.is_cancelled() {
                    self.saw_cancel.store(true, Ordering::Release);
                    return Err(VaultError::Cancelled);
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_photo_thumbnail_is_bounded_and_cached() {
        let dir = tempdir().unwrap();
        let mm = memory(64 << 20);
        let pipeline = pipeline(Arc::clone(&mm), dir.path());
        let media = sealed(&dir, MediaKind::Photo, &jpeg_bytes(1000, 800));

        let thumb = pipeline.generate_thumbnail(&media, 320, 240).await;
        assert!(!thumb.is_placeholder());
        assert!(thumb.width() <= 320 && thumb.height() <= 240);
        assert!(thumb.is_cached());

        let again = pipeline.generate_thumbnail(&media, 320, 240).await;
        assert!(Arc::ptr_eq(thumb.bitmap(), again.bitmap()));
        assert_eq!(mm.stats().bitmap_cache.hits, 1);
    }

    #[tokio::test]
    async fn test_critical_memory_yields_uncached_placeholder() {
        let dir = tempdir().unwrap();
        let mm = memory(64 << 20);
        let pipeline = pipeline(Arc::clone(&mm), dir.path());
        let media = sealed(&dir, MediaKind::Photo, &jpeg_bytes(200, 100));

        let _hog = mm.reserve(mm.budget().max() * 96 / 100).unwrap();
        assert!(mm.is_critical());

        let thumb = pipeline.generate_thumbnail(&media, 64, 64).await;
        assert!(thumb.is_placeholder());
        assert!(!thumb.is_cached());
        assert!(mm.bitmap_cache().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_memory_falls_back_to_placeholder() {
        let dir = tempdir().unwrap();
        // Too small to decode a 1000x800 PNG, which has no scaled decode
        let mm = memory(2 << 20);
        let pipeline = pipeline(Arc::clone(&mm), dir.path());
        let media = sealed(&dir, MediaKind::Photo, &encoded(1000, 800, ImageFormat::Png));

        let thumb = pipeline.generate_thumbnail(&media, 128, 128).await;
        assert!(thumb.is_placeholder());
        assert!(pipeline.render_thumbnail(&media, 128, 128).await.unwrap_err().is_out_of_memory());
        assert!(mm.stats().cleanups >= 1);
    }

    #[tokio::test]
    async fn test_corrupt_payload_yields_placeholder() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(memory(64 << 20), dir.path());
        let media = sealed(&dir, MediaKind::Photo, b"not an image at all, just bytes");

        let thumb = pipeline.generate_thumbnail(&media, 64, 64).await;
        assert!(thumb.is_placeholder());
    }

    #[tokio::test]
    async fn test_video_frame_and_fallbacks() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(memory(64 << 20), dir.path());

        // 10 frames: nothing at 1s, so the first frame is used
        let clip = sealed(&dir, MediaKind::Video, &video::mjpeg_clip(10));
        let thumb = pipeline.generate_thumbnail(&clip, 32, 32).await;
        assert!(!thumb.is_placeholder());
        assert!(thumb.width() <= 32 && thumb.height() <= 32);

        let noise = sealed(&dir, MediaKind::Video, &[0x11u8; 10_000]);
        let thumb = pipeline.generate_thumbnail(&noise, 32, 32).await;
        assert!(thumb.is_placeholder());
        let photo_placeholder = ThumbnailPipeline::placeholder(MediaKind::Photo, 32, 32);
        assert_ne!(
            thumb.with_pixels(|p| p.to_vec()),
            photo_placeholder.with_pixels(|p| p.to_vec())
        );
    }

    #[tokio::test]
    async fn test_stalled_video_extraction_times_out() {
        let dir = tempdir().unwrap();
        let mm = memory(64 << 20);
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let config = ThumbnailConfig {
            video_timeout_secs: 1,
            ..Default::default()
        };
        let pipeline = ThumbnailPipeline::new(Arc::clone(&mm), config, dir.path().join("scratch")).with_extractor(
            Arc::new(StalledExtractor {
                saw_cancel: Arc::clone(&saw_cancel),
            }),
        );
        let clip = sealed(&dir, MediaKind::Video, &video::mjpeg_clip(3));

        let started = std::time::Instant::now();
        let thumb = pipeline.generate_thumbnail(&clip, 32, 32).await;
        let waited = started.elapsed();
        assert!(thumb.is_placeholder());
        assert!(!thumb.is_cached());
        assert!(mm.bitmap_cache().is_empty());
        assert!(waited >= std::time::Duration::from_secs(1));
        assert!(waited < std::time::Duration::from_secs(5));

        assert!(matches!(
            pipeline.render_thumbnail(&clip, 32, 32).await,
            Err(VaultError::Timeout(1))
        ));

        // The abandoned worker stops on its own
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(saw_cancel.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_persisted_thumbnail_is_reused() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(memory(64 << 20), dir.path());
        let media = sealed(&dir, MediaKind::Photo, &jpeg_bytes(600, 400));

        pipeline.persist_thumbnail(&media, 256).await.unwrap();
        assert!(media.thumbnail.exists());

        // Payload gone: only the stored thumbnail can serve this
        std::fs::remove_file(&media.payload).unwrap();
        let bitmap = pipeline.render_thumbnail(&media, 128, 128).await.unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (128, 85));

        // Larger than stored: needs the payload, which is gone
        assert!(pipeline.render_thumbnail(&media, 512, 512).await.is_err());
    }

    #[test]
    fn test_thumbnail_key() {
        let id = Uuid::nil();
        assert_eq!(thumbnail_key(&id, 320, 240), format!("{}:320x240", id));
    }
}
