//! Video frame extraction from a decrypted prefix.
//!
//! Only the leading part of the encrypted file is decrypted, sized by
//! [`prefix_len`], written to a scratch file and handed to a
//! [`FrameExtractor`].

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tempfile::NamedTempFile;

use super::photo::{self, DecodedImage};
use super::MediaRef;
use crate::crypto::{open_media_file, SEGMENT_LEN};
use crate::error::{VaultError, VaultResult};
use crate::memory::{CachedPrefix, HeapBudget, MemoryManager};

const MIB: u64 = 1024 * 1024;

/// Bytes of plaintext to decrypt for a thumbnail of a `file_size` video:
/// 3 MiB above 100 MiB, otherwise half the file clamped to 1..10 MiB
pub fn prefix_len(file_size: u64) -> u64 {
    if file_size > 100 * MIB {
        3 * MIB
    } else {
        (file_size / 2).clamp(file_size.min(MIB), 10 * MIB).min(file_size)
    }
}

/// Which frame to ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePosition {
    /// The frame closest to this offset from the start
    Near(Duration),
    First,
}

/// What an extraction may use, and when it must stop
pub struct ExtractContext<'a> {
    /// Every buffer the extractor holds is charged here
    pub budget: &'a Arc<HeapBudget>,
    /// Set once the caller has given up on the result
    pub cancel: &'a AtomicBool,
    /// Thumbnail bound the frame will be scaled into
    pub max_w: u32,
    pub max_h: u32,
}

impl ExtractContext<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn check_cancelled(&self) -> VaultResult<()> {
        if self.is_cancelled() {
            Err(VaultError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Pulls a still frame out of a (possibly truncated) video file
pub trait FrameExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` when the requested frame is not present in `source`.
    /// Long-running implementations should poll [`ExtractContext::is_cancelled`].
    fn extract_frame(
        &self,
        source: &Path,
        position: FramePosition,
        ctx: &ExtractContext<'_>,
    ) -> VaultResult<Option<DecodedImage>>;
}

/// Finds JPEG-coded frames (Motion-JPEG AVI/MOV, camera clips with
/// embedded previews) by scanning for SOI/EOI markers.
#[derive(Debug, Clone)]
pub struct MotionJpegExtractor {
    /// Frame rate assumed when mapping a time offset to a frame index
    pub fps: u32,
    /// Smallest byte run accepted as a frame
    pub min_frame_len: usize,
}

impl Default for MotionJpegExtractor {
    fn default() -> Self {
        Self {
            fps: 30,
            min_frame_len: 128,
        }
    }
}

impl MotionJpegExtractor {
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1),
            ..Default::default()
        }
    }

    /// Byte ranges of complete JPEG streams, in file order
    pub fn frame_ranges(&self, data: &[u8]) -> Vec<(usize, usize)> {
        self.scan_frames(data, usize::MAX, &AtomicBool::new(false))
            .unwrap_or_default()
    }

    /// Up to `limit` frame ranges, checking `cancel` before each marker search
    fn scan_frames(&self, data: &[u8], limit: usize, cancel: &AtomicBool) -> VaultResult<Vec<(usize, usize)>> {
        const SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];
        const EOI: [u8; 2] = [0xFF, 0xD9];

        let mut frames = Vec::new();
        let mut pos = 0;
        while frames.len() < limit {
            if cancel.load(Ordering::Acquire) {
                return Err(VaultError::Cancelled);
            }
            let Some(start) = data[pos..].windows(3).position(|w| w == SOI).map(|o| pos + o) else {
                break;
            };
            let Some(end) = data[start + 2..]
                .windows(2)
                .position(|w| w == EOI)
                .map(|o| start + 2 + o + 2)
            else {
                break;
            };
            if end - start >= self.min_frame_len {
                frames.push((start, end));
            }
            pos = end;
        }
        Ok(frames)
    }

    fn frame_index(&self, position: FramePosition) -> usize {
        match position {
            FramePosition::First => 0,
            FramePosition::Near(offset) => (offset.as_secs_f64() * self.fps as f64).round() as usize,
        }
    }
}

impl FrameExtractor for MotionJpegExtractor {
    fn name(&self) -> &'static str {
        "motion-jpeg"
    }

    fn extract_frame(
        &self,
        source: &Path,
        position: FramePosition,
        ctx: &ExtractContext<'_>,
    ) -> VaultResult<Option<DecodedImage>> {
        let _read = ctx.budget.reserve(fs::metadata(source)?.len())?;
        let data = fs::read(source)?;
        let index = self.frame_index(position);
        let frames = self.scan_frames(&data, index.saturating_add(1), ctx.cancel)?;

        let Some(&(start, end)) = frames.get(index) else {
            debug!("{}: frame {} not in {} scanned frames", self.name(), index, frames.len());
            return Ok(None);
        };
        ctx.check_cancelled()?;
        match photo::decode_bounded(&data[start..end], ctx.max_w, ctx.max_h, ctx.budget) {
            Ok(frame) => Ok(Some(frame)),
            Err(e) if e.is_out_of_memory() => Err(e),
            Err(e) => {
                debug!("{}: frame {} undecodable: {}", self.name(), index, e);
                Ok(None)
            }
        }
    }
}

/// Decrypt the leading `prefix_len(media.size)` bytes, via the prefix cache
pub fn decrypt_prefix(media: &MediaRef, memory: &MemoryManager) -> VaultResult<Arc<CachedPrefix>> {
    if let Some(cached) = memory.cached_prefix(&media.id) {
        return Ok(cached);
    }

    let wanted = prefix_len(media.size);
    let budgeted = wanted + SEGMENT_LEN as u64;
    let reservation = memory.reserve(budgeted)?;

    let mut data = Vec::new();
    data.try_reserve_exact(budgeted as usize)
        .map_err(|_| VaultError::OutOfMemory { requested: budgeted })?;
    let mut decryptor = open_media_file(&media.payload, &media.key, &media.id)?;
    decryptor.copy_prefix(&mut data, wanted)?;
    debug!("Decrypted {} of {} bytes of video {}", data.len(), media.size, media.id);

    let prefix = Arc::new(CachedPrefix::new(data, reservation));
    memory.cache_prefix(media.id, Arc::clone(&prefix));
    Ok(prefix)
}

/// Frame near `position`, falling back to the first frame
pub fn extract_frame(
    media: &MediaRef,
    memory: &MemoryManager,
    extractor: &dyn FrameExtractor,
    scratch_dir: &Path,
    position: Duration,
    ctx: &ExtractContext<'_>,
) -> VaultResult<DecodedImage> {
    let prefix = decrypt_prefix(media, memory)?;
    ctx.check_cancelled()?;

    fs::create_dir_all(scratch_dir)?;
    let mut scratch = NamedTempFile::new_in(scratch_dir)?;
    scratch.write_all(&prefix)?;
    scratch.flush()?;

    for attempt in [FramePosition::Near(position), FramePosition::First] {
        ctx.check_cancelled()?;
        if let Some(frame) = extractor.extract_frame(scratch.path(), attempt, ctx)? {
            debug!("Video {}: {:?} via {}", media.id, attempt, extractor.name());
            return Ok(frame);
        }
    }

    Err(VaultError::ThumbnailFailed(format!("no decodable frame in video {}", media.id)))
}

/// A minimal Motion-JPEG AVI body with `frames` distinct 64x48 frames
#[cfg(test)]
pub(crate) fn mjpeg_clip(frames: usize) -> Vec<u8> {
    let mut clip = b"RIFF\0\0\0\0AVI LIST".to_vec();
    for i in 0..frames {
        let shade = (i * 40 % 256) as u8;
        let img = image::RgbImage::from_pixel(64, 48, image::Rgb([shade, 255 - shade, 0]));
        let mut jpeg = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();
        clip.extend_from_slice(b"00dc");
        clip.extend_from_slice(&(jpeg.len() as u32).to_le_bytes());
        clip.extend_from_slice(&jpeg);
    }
    clip
}
