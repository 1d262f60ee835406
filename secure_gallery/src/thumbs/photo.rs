//! Bounded-memory photo decoding.
//!
//! Dimensions are read from the header first. JPEGs are scaled down while
//! decoding (1/2, 1/4 or 1/8 in the DCT domain), so only the reduced bitmap
//! is ever allocated. Other formats are decoded whole, charged to the heap
//! budget up front and run under `image::Limits`, so an image too large for
//! the remaining budget is refused before any pixel buffer exists.

use std::io::Cursor;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use image::{DynamicImage, GenericImageView, GrayImage, ImageBuffer, ImageFormat, ImageReader, Limits, Luma, RgbImage};
use jpeg_decoder::PixelFormat;
use log::debug;

use crate::error::{VaultError, VaultResult};
use crate::memory::{Bitmap, HeapBudget, MemoryReservation};

/// Worst-case bytes per decoded pixel (RGBA8)
const DECODE_BPP: u64 = 4;

/// RGB8 conversion scratch charged on top of the raw JPEG output
const RGB_BPP: u64 = 3;

/// A decoded image together with the budget it is charged to
#[derive(Debug)]
pub struct DecodedImage {
    image: DynamicImage,
    _reservation: MemoryReservation,
}

impl DecodedImage {
    pub fn into_image(self) -> DynamicImage {
        self.image
    }
}

impl Deref for DecodedImage {
    type Target = DynamicImage;

    fn deref(&self) -> &DynamicImage {
        &self.image
    }
}

/// Largest size that fits within `max_w x max_h` at the source aspect ratio.
/// Never upscales; never returns a zero dimension.
pub fn fit_within(width: u32, height: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    let (max_w, max_h) = (max_w.max(1), max_h.max(1));
    if width <= max_w && height <= max_h {
        return (width.max(1), height.max(1));
    }

    let scale = (max_w as f64 / width as f64).min(max_h as f64 / height as f64);
    let w = ((width as f64 * scale).floor() as u32).clamp(1, max_w);
    let h = ((height as f64 * scale).floor() as u32).clamp(1, max_h);
    (w, h)
}

/// Largest power-of-two subsampling that keeps both dimensions at or
/// above the requested bound
pub fn sample_size(width: u32, height: u32, max_w: u32, max_h: u32) -> u32 {
    let mut sample = 1;
    while width / (sample * 2) >= max_w.max(1) && height / (sample * 2) >= max_h.max(1) {
        sample *= 2;
    }
    sample
}

/// Header-only probe; fails on anything the decoders cannot identify
pub fn probe_dimensions(bytes: &[u8]) -> VaultResult<(u32, u32)> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| VaultError::InvalidFileFormat(e.to_string()))?;
    if reader.format().is_none() {
        return Err(VaultError::InvalidFileFormat("unrecognised image format".into()));
    }
    reader
        .into_dimensions()
        .map_err(|e| VaultError::InvalidFileFormat(e.to_string()))
}

/// Probe a plaintext file on disk. Reads only as much as the decoder needs.
pub fn probe_file(path: &Path) -> VaultResult<(u32, u32)> {
    let reader = ImageReader::open(path)?
        .with_guessed_format()
        .map_err(|e| VaultError::InvalidFileFormat(e.to_string()))?;
    if reader.format().is_none() {
        return Err(VaultError::InvalidFileFormat(format!("{}: unrecognised image format", path.display())));
    }
    reader
        .into_dimensions()
        .map_err(|e| VaultError::InvalidFileFormat(format!("{}: {}", path.display(), e)))
}

/// Full decode charged against `budget`
pub fn decode_limited(bytes: &[u8], budget: &Arc<HeapBudget>) -> VaultResult<DecodedImage> {
    let (width, height) = probe_dimensions(bytes)?;
    let needed = width as u64 * height as u64 * DECODE_BPP;
    let reservation = budget.reserve(needed)?;

    let mut limits = Limits::default();
    limits.max_alloc = Some(needed.max(1 << 20));

    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| VaultError::InvalidFileFormat(e.to_string()))?;
    reader.limits(limits);
    Ok(DecodedImage {
        image: reader.decode()?,
        _reservation: reservation,
    })
}

/// JPEG decoded at the smallest DCT scale still covering `want_w x want_h`.
///
/// `Ok(None)` when the stream uses a feature the scaling decoder lacks.
pub fn decode_jpeg_scaled(
    bytes: &[u8],
    want_w: u32,
    want_h: u32,
    budget: &Arc<HeapBudget>,
) -> VaultResult<Option<DecodedImage>> {
    let mut decoder = jpeg_decoder::Decoder::new(Cursor::new(bytes));
    let clamp = |v: u32| v.clamp(1, u16::MAX as u32) as u16;
    let (w, h) = match decoder.scale(clamp(want_w), clamp(want_h)) {
        Ok((w, h)) => (w as u32, h as u32),
        Err(jpeg_decoder::Error::Unsupported(feature)) => {
            debug!("Scaled JPEG decode unsupported ({:?}), decoding whole", feature);
            return Ok(None);
        }
        Err(e) => return Err(VaultError::InvalidFileFormat(e.to_string())),
    };
    let format = decoder
        .info()
        .map(|info| info.pixel_format)
        .ok_or_else(|| VaultError::InvalidFileFormat("JPEG header missing".into()))?;

    let reservation = budget.reserve(w as u64 * h as u64 * (format.pixel_bytes() as u64 + RGB_BPP))?;
    let pixels = decoder
        .decode()
        .map_err(|e| VaultError::InvalidFileFormat(e.to_string()))?;

    let short = || VaultError::InvalidFileFormat("JPEG output shorter than its header".into());
    let image = match format {
        PixelFormat::RGB24 => DynamicImage::ImageRgb8(RgbImage::from_raw(w, h, pixels).ok_or_else(short)?),
        PixelFormat::L8 => DynamicImage::ImageLuma8(GrayImage::from_raw(w, h, pixels).ok_or_else(short)?),
        PixelFormat::L16 => {
            let wide: Vec<u16> = pixels
                .chunks_exact(2)
                .map(|p| u16::from_ne_bytes([p[0], p[1]]))
                .collect();
            DynamicImage::ImageLuma16(ImageBuffer::<Luma<u16>, _>::from_raw(w, h, wide).ok_or_else(short)?)
        }
        PixelFormat::CMYK32 => {
            // Adobe CMYK is stored inverted
            let rgb: Vec<u8> = pixels
                .chunks_exact(4)
                .flat_map(|p| {
                    let k = p[3] as u16;
                    [p[0], p[1], p[2]].map(|c| (c as u16 * k / 255) as u8)
                })
                .collect();
            DynamicImage::ImageRgb8(RgbImage::from_raw(w, h, rgb).ok_or_else(short)?)
        }
    };

    Ok(Some(DecodedImage {
        image,
        _reservation: reservation,
    }))
}

/// Decode at no more than the resolution needed for a `max_w x max_h`
/// thumbnail: scaled for JPEG, whole otherwise
pub fn decode_bounded(bytes: &[u8], max_w: u32, max_h: u32, budget: &Arc<HeapBudget>) -> VaultResult<DecodedImage> {
    let (width, height) = probe_dimensions(bytes)?;
    debug!(
        "Photo {}x{} -> bound {}x{} (sample {})",
        width,
        height,
        max_w,
        max_h,
        sample_size(width, height, max_w, max_h)
    );

    if image::guess_format(bytes).ok() == Some(ImageFormat::Jpeg) {
        let (tw, th) = fit_within(width, height, max_w, max_h);
        if let Some(decoded) = decode_jpeg_scaled(bytes, tw, th, budget)? {
            return Ok(decoded);
        }
    }
    decode_limited(bytes, budget)
}

/// Scale an already-decoded image into an RGB565 bitmap within the bound
pub fn to_thumbnail(img: &DynamicImage, max_w: u32, max_h: u32, budget: &Arc<HeapBudget>) -> VaultResult<Bitmap> {
    let (width, height) = img.dimensions();
    let (tw, th) = fit_within(width, height, max_w, max_h);

    let rgb: RgbImage = if (tw, th) == (width, height) {
        img.to_rgb8()
    } else {
        img.thumbnail_exact(tw, th).to_rgb8()
    };
    Bitmap::from_rgb(&rgb, budget)
}

/// Decode `bytes` into a thumbnail no larger than `max_w x max_h`
pub fn decode_thumbnail(bytes: &[u8], max_w: u32, max_h: u32, budget: &Arc<HeapBudget>) -> VaultResult<Bitmap> {
    let decoded = decode_bounded(bytes, max_w, max_h, budget)?;
    to_thumbnail(&decoded, max_w, max_h, budget)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};

    fn encoded(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 90]));
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), format)
            .unwrap();
        out
    }

    #[test]
    fn test_fit_within() {
        assert_eq!(fit_within(1000, 800, 320, 240), (300, 240));
        assert_eq!(fit_within(800, 1000, 320, 240), (192, 240));
        assert_eq!(fit_within(100, 50, 320, 240), (100, 50));
        assert_eq!(fit_within(10_000, 1, 100, 100), (100, 1));
    }

    #[test]
    fn test_sample_size() {
        assert_eq!(sample_size(1000, 800, 320, 240), 2);
        assert_eq!(sample_size(4000, 3000, 256, 256), 8);
        assert_eq!(sample_size(100, 100, 320, 240), 1);
    }

    #[test]
    fn test_decode_thumbnail_within_bound() {
        let budget = HeapBudget::new(64 << 20);
        let jpeg = encoded(1000, 800, ImageFormat::Jpeg);

        let bitmap = decode_thumbnail(&jpeg, 320, 240, &budget).unwrap();
        assert!(bitmap.width() <= 320 && bitmap.height() <= 240);
        assert_eq!((bitmap.width(), bitmap.height()), (300, 240));

        // Decode scratch is returned; only the bitmap stays charged
        assert_eq!(budget.used(), bitmap.byte_size());
    }

    #[test]
    fn test_large_jpeg_decodes_scaled_under_small_budget() {
        // A full decode would need 2000 * 1600 * 4 bytes
        let budget = HeapBudget::new(4 << 20);
        let jpeg = encoded(2000, 1600, ImageFormat::Jpeg);

        let decoded = decode_bounded(&jpeg, 200, 200, &budget).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (250, 200));
        assert!(budget.peak() < 1 << 20);
        drop(decoded);
        assert_eq!(budget.used(), 0);

        let bitmap = decode_thumbnail(&jpeg, 200, 200, &budget).unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (200, 160));
        assert!(decode_limited(&jpeg, &budget).unwrap_err().is_out_of_memory());
    }

    #[test]
    fn test_oversized_decode_is_refused() {
        let budget = HeapBudget::new(1 << 20);
        let png = encoded(1000, 800, ImageFormat::Png);
        let err = decode_thumbnail(&png, 64, 64, &budget).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_garbage_is_invalid_format() {
        assert!(matches!(
            probe_dimensions(b"definitely not an image"),
            Err(VaultError::InvalidFileFormat(_))
        ));

        let mut truncated = encoded(200, 200, ImageFormat::Png);
        truncated.truncate(40);
        let budget = HeapBudget::new(64 << 20);
        assert!(decode_thumbnail(&truncated, 64, 64, &budget).is_err());
    }
}
