//! Decoded pixel buffers and drawn placeholders.

use std::fmt;
use std::sync::Arc;

use image::{Rgb, RgbImage};
use parking_lot::Mutex;

use super::{HeapBudget, MemoryReservation};
use crate::error::{VaultError, VaultResult};
use crate::gallery::MediaKind;

/// Pixel layout of a [`Bitmap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 16 bits per pixel, 5-6-5, little endian
    Rgb565,
    /// 24 bits per pixel
    Rgb888,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb565 => 2,
            PixelFormat::Rgb888 => 3,
        }
    }
}

struct PixelBuffer {
    data: Vec<u8>,
    _reservation: Option<MemoryReservation>,
}

/// A decoded image whose pixel buffer can be released ("recycled") while
/// other owners still hold the `Bitmap` itself.
pub struct Bitmap {
    width: u32,
    height: u32,
    format: PixelFormat,
    placeholder: bool,
    pixels: Mutex<Option<PixelBuffer>>,
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("placeholder", &self.placeholder)
            .field("recycled", &self.is_recycled())
            .finish()
    }
}

#[inline]
fn pack_rgb565(Rgb([r, g, b]): Rgb<u8>) -> [u8; 2] {
    let v = ((r as u16 & 0xF8) << 8) | ((g as u16 & 0xFC) << 3) | (b as u16 >> 3);
    v.to_le_bytes()
}

#[inline]
fn unpack_rgb565(bytes: [u8; 2]) -> Rgb<u8> {
    let v = u16::from_le_bytes(bytes);
    let r = ((v >> 11) & 0x1F) as u8;
    let g = ((v >> 5) & 0x3F) as u8;
    let b = (v & 0x1F) as u8;
    Rgb([(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)])
}

impl Bitmap {
    /// Convert to RGB565, charging the pixel buffer to `budget`
    pub fn from_rgb(image: &RgbImage, budget: &Arc<HeapBudget>) -> VaultResult<Self> {
        let bytes = image.width() as u64 * image.height() as u64 * PixelFormat::Rgb565.bytes_per_pixel() as u64;
        let reservation = budget.reserve(bytes)?;
        let mut bitmap = Self::encode_565(image, false)?;
        if let Some(buffer) = bitmap.pixels.get_mut() {
            buffer._reservation = Some(reservation);
        }
        Ok(bitmap)
    }

    fn encode_565(image: &RgbImage, placeholder: bool) -> VaultResult<Self> {
        let len = image.width() as usize * image.height() as usize * 2;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| VaultError::OutOfMemory { requested: len as u64 })?;
        for pixel in image.pixels() {
            data.extend_from_slice(&pack_rgb565(*pixel));
        }

        Ok(Self {
            width: image.width(),
            height: image.height(),
            format: PixelFormat::Rgb565,
            placeholder,
            pixels: Mutex::new(Some(PixelBuffer { data, _reservation: None })),
        })
    }

    /// Drawn stand-in used when the real preview cannot be produced.
    /// Square, at most 256 px and never larger than the requested bounds.
    pub fn placeholder(kind: MediaKind, max_width: u32, max_height: u32) -> Self {
        let side = max_width.min(max_height).clamp(1, 256);
        let mut img = RgbImage::from_pixel(side, side, Rgb([0x30, 0x33, 0x38]));
        let glyph = Rgb([0xB0, 0xB4, 0xBC]);
        let s = side as i64;

        match kind {
            MediaKind::Photo => {
                // Mountain and sun
                let base = s * 3 / 4;
                let peak = s / 3;
                for y in peak..base {
                    let half = (y - peak) * (s / 3) / (base - peak).max(1);
                    for x in (s / 2 - half).max(0)..=(s / 2 + half).min(s - 1) {
                        img.put_pixel(x as u32, y as u32, glyph);
                    }
                }
                let (cx, cy, r) = (s * 3 / 4, s / 4, (s / 10).max(1));
                for y in (cy - r).max(0)..=(cy + r).min(s - 1) {
                    for x in (cx - r).max(0)..=(cx + r).min(s - 1) {
                        if (x - cx).pow(2) + (y - cy).pow(2) <= r * r {
                            img.put_pixel(x as u32, y as u32, glyph);
                        }
                    }
                }
            }
            MediaKind::Video => {
                // Play triangle pointing right
                let (left, right) = (s * 3 / 8, s * 5 / 8);
                let (top, bottom) = (s / 4, s * 3 / 4);
                let mid = (top + bottom) / 2;
                for x in left..=right {
                    let half = (right - x) * (mid - top) / (right - left).max(1);
                    for y in (mid - half).max(0)..=(mid + half).min(s - 1) {
                        img.put_pixel(x as u32, y as u32, glyph);
                    }
                }
            }
        }

        // Placeholders are tiny and must not fail; leave them unaccounted.
        let mut bitmap = match Self::encode_565(&img, true) {
            Ok(bitmap) => bitmap,
            Err(_) => Self {
                width: side,
                height: side,
                format: PixelFormat::Rgb565,
                placeholder: true,
                pixels: Mutex::new(Some(PixelBuffer { data: Vec::new(), _reservation: None })),
            },
        };
        bitmap.placeholder = true;
        bitmap
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    /// Size of the pixel buffer while alive
    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.format.bytes_per_pixel() as u64
    }

    pub fn is_recycled(&self) -> bool {
        self.pixels.lock().is_none()
    }

    /// Release the pixel buffer. Returns false if it was already released.
    pub fn recycle(&self) -> bool {
        self.pixels.lock().take().is_some()
    }

    /// Borrow the raw pixels; `None` once recycled
    pub fn with_pixels<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.pixels.lock().as_ref().map(|buffer| f(&buffer.data))
    }

    /// Expand back to 24-bit RGB, e.g. for encoding to JPEG/PNG
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        let (width, height, format) = (self.width, self.height, self.format);
        self.with_pixels(|data| {
            let mut img = RgbImage::new(width, height);
            match format {
                PixelFormat::Rgb565 => {
                    for (pixel, chunk) in img.pixels_mut().zip(data.chunks_exact(2)) {
                        *pixel = unpack_rgb565([chunk[0], chunk[1]]);
                    }
                }
                PixelFormat::Rgb888 => {
                    for (pixel, chunk) in img.pixels_mut().zip(data.chunks_exact(3)) {
                        *pixel = Rgb([chunk[0], chunk[1], chunk[2]]);
                    }
                }
            }
            img
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb565_is_half_of_rgb888() {
        let budget = HeapBudget::new(1 << 20);
        let img = RgbImage::from_pixel(40, 30, Rgb([255, 128, 0]));
        let bitmap = Bitmap::from_rgb(&img, &budget).unwrap();

        assert_eq!(bitmap.format(), PixelFormat::Rgb565);
        assert_eq!(bitmap.byte_size(), 40 * 30 * 2);
        assert_eq!(budget.used(), 40 * 30 * 2);

        let back = bitmap.to_rgb_image().unwrap();
        let Rgb([r, g, b]) = *back.get_pixel(3, 3);
        assert!(r >= 248 && (124..=132).contains(&g) && b < 8);
    }

    #[test]
    fn test_recycle_releases_budget() {
        let budget = HeapBudget::new(1 << 20);
        let bitmap = Bitmap::from_rgb(&RgbImage::new(16, 16), &budget).unwrap();
        assert_eq!(budget.used(), 512);

        assert!(bitmap.recycle());
        assert!(bitmap.is_recycled());
        assert_eq!(budget.used(), 0);
        assert!(!bitmap.recycle());
        assert!(bitmap.to_rgb_image().is_none());
    }

    #[test]
    fn test_budget_refusal_is_out_of_memory() {
        let budget = HeapBudget::new(100);
        let result = Bitmap::from_rgb(&RgbImage::new(16, 16), &budget);
        assert!(matches!(result, Err(VaultError::OutOfMemory { .. })));
    }

    #[test]
    fn test_placeholders_fit_and_differ() {
        let photo = Bitmap::placeholder(MediaKind::Photo, 320, 240);
        let video = Bitmap::placeholder(MediaKind::Video, 320, 240);

        assert!(photo.is_placeholder());
        assert!(photo.width() <= 320 && photo.height() <= 240);
        assert_ne!(
            photo.with_pixels(|p| p.to_vec()).unwrap(),
            video.with_pixels(|p| p.to_vec()).unwrap()
        );

        let tiny = Bitmap::placeholder(MediaKind::Video, 1, 1);
        assert_eq!((tiny.width(), tiny.height()), (1, 1));
    }
}
