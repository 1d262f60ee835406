//! Segmented media encryption.
//!
//! Media payload files on disk:
//! ```text
//! [IV 16B][random]
//! [SEGMENT 0][64 KiB plaintext sealed with AES-256-GCM, 16B tag]
//! [SEGMENT 1]...
//! [SEGMENT n][final, possibly short or empty]
//! ```
//! Segment `i` uses nonce `iv ^ be64(i)` (low 8 bytes) and AAD
//! `be64(i) || final`. Any leading run of segments can be authenticated on
//! its own; dropping the tail is detected because the final flag is missing.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use aes_gcm::{
    aead::{consts::U16, Aead, Payload},
    Nonce,
};
use uuid::Uuid;

use super::aead::{cipher_for, GalleryCipher};
use super::keys::{derive_media_key, generate_iv, GalleryKey, IV_LEN, TAG_LEN};
use crate::error::{VaultError, VaultResult};

/// Plaintext bytes per segment
pub const SEGMENT_LEN: usize = 64 * 1024;

/// Segment size on disk
pub const SEALED_SEGMENT_LEN: usize = SEGMENT_LEN + TAG_LEN;

fn segment_nonce(iv: &[u8; IV_LEN], index: u64) -> [u8; IV_LEN] {
    let mut nonce = *iv;
    for (b, x) in nonce[IV_LEN - 8..].iter_mut().zip(index.to_be_bytes()) {
        *b ^= x;
    }
    nonce
}

fn segment_aad(index: u64, last: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = last as u8;
    aad
}

/// Read until `buf` is full or EOF
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Plaintext length of a media file of `sealed_len` bytes (including the IV)
pub fn plaintext_len(sealed_len: u64) -> u64 {
    let body = sealed_len.saturating_sub(IV_LEN as u64);
    let segments = body.div_ceil(SEALED_SEGMENT_LEN as u64).max(1);
    body.saturating_sub(segments * TAG_LEN as u64)
}

/// On-disk length for `plain_len` bytes of media
pub fn sealed_len(plain_len: u64) -> u64 {
    let segments = plain_len.div_ceil(SEGMENT_LEN as u64).max(1);
    IV_LEN as u64 + plain_len + segments * TAG_LEN as u64
}

/// Encrypt everything `reader` yields into `writer`. Returns plaintext bytes.
pub fn encrypt_stream<R: Read, W: Write>(mut reader: R, mut writer: W, key: &GalleryKey) -> VaultResult<u64> {
    let cipher = cipher_for(key)?;
    let iv = generate_iv();
    writer.write_all(&iv)?;

    let mut current = vec![0u8; SEGMENT_LEN];
    let mut next = vec![0u8; SEGMENT_LEN];
    let mut current_len = read_full(&mut reader, &mut current)?;
    let mut index = 0u64;
    let mut total = 0u64;

    loop {
        let (next_len, last) = if current_len < SEGMENT_LEN {
            (0, true)
        } else {
            let n = read_full(&mut reader, &mut next)?;
            (n, n == 0)
        };

        let aad = segment_aad(index, last);
        let sealed = cipher
            .encrypt(
                Nonce::<U16>::from_slice(&segment_nonce(&iv, index)),
                Payload { msg: &current[..current_len], aad: &aad },
            )
            .map_err(|_| VaultError::EncryptionFailed("segment seal failed".into()))?;
        writer.write_all(&sealed)?;
        total += current_len as u64;

        if last {
            break;
        }

        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
        index += 1;
    }

    writer.flush()?;
    Ok(total)
}

/// Pull-based decryptor over a segmented media stream
pub struct MediaDecryptor<R: Read> {
    reader: BufReader<R>,
    cipher: GalleryCipher,
    iv: [u8; IV_LEN],
    index: u64,
    finished: bool,
    buf: Vec<u8>,
}

impl<R: Read> MediaDecryptor<R> {
    /// Read the IV and prepare to decrypt segments
    pub fn new(reader: R, key: &GalleryKey) -> VaultResult<Self> {
        let mut reader = BufReader::with_capacity(SEALED_SEGMENT_LEN, reader);
        let mut iv = [0u8; IV_LEN];
        if read_full(&mut reader, &mut iv)? != IV_LEN {
            return Err(VaultError::Crypto);
        }

        Ok(Self {
            reader,
            cipher: cipher_for(key).map_err(|_| VaultError::Crypto)?,
            iv,
            index: 0,
            finished: false,
            buf: vec![0u8; SEALED_SEGMENT_LEN],
        })
    }

    /// True once the authenticated final segment has been returned
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next plaintext segment, `None` after the final one
    pub fn next_segment(&mut self) -> VaultResult<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }

        let n = read_full(&mut self.reader, &mut self.buf)?;
        if n < TAG_LEN {
            // Stream ended before the final segment
            return Err(VaultError::Crypto);
        }
        let last = n < SEALED_SEGMENT_LEN || self.reader.fill_buf()?.is_empty();

        let aad = segment_aad(self.index, last);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::<U16>::from_slice(&segment_nonce(&self.iv, self.index)),
                Payload { msg: &self.buf[..n], aad: &aad },
            )
            .map_err(|_| VaultError::Crypto)?;

        self.index += 1;
        self.finished = last;
        Ok(Some(plaintext))
    }

    /// Decrypt segments into `writer` until at least `min_bytes` are written
    /// or the stream ends. Returns bytes written.
    pub fn copy_prefix<W: Write>(&mut self, writer: &mut W, min_bytes: u64) -> VaultResult<u64> {
        let mut written = 0u64;
        while written < min_bytes {
            match self.next_segment()? {
                Some(segment) => {
                    writer.write_all(&segment)?;
                    written += segment.len() as u64;
                }
                None => break,
            }
        }
        Ok(written)
    }
}

/// Decrypt a whole stream into `writer`, verifying the final segment
pub fn decrypt_stream<R: Read, W: Write>(reader: R, mut writer: W, key: &GalleryKey) -> VaultResult<u64> {
    let mut decryptor = MediaDecryptor::new(reader, key)?;
    let written = decryptor.copy_prefix(&mut writer, u64::MAX)?;
    writer.flush()?;
    Ok(written)
}

/// Encrypt `source` into `dest` under the media's per-file key.
///
/// Written to a sibling temp file and renamed into place.
pub fn encrypt_media_file(source: &Path, dest: &Path, gallery_key: &GalleryKey, media_id: &Uuid) -> VaultResult<u64> {
    let file_key = derive_media_key(gallery_key, media_id)?;
    let input = File::open(source)?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = dest.with_extension("tmp");
    let output = OpenOptions::new().write(true).create(true).truncate(true).open(&temp_path)?;

    let result = encrypt_stream(BufReader::new(input), &output, &file_key).and_then(|n| {
        output.sync_all()?;
        Ok(n)
    });

    match result {
        Ok(n) => {
            fs::rename(&temp_path, dest)?;
            Ok(n)
        }
        Err(e) => {
            let _ = fs::remove_file(&temp_path);
            Err(e)
        }
    }
}

/// Open an encrypted media file for segment-wise decryption
pub fn open_media_file(path: &Path, gallery_key: &GalleryKey, media_id: &Uuid) -> VaultResult<MediaDecryptor<File>> {
    let file_key = derive_media_key(gallery_key, media_id)?;
    MediaDecryptor::new(File::open(path)?, &file_key)
}

/// Decrypt a whole media file into memory. Photos only; videos are streamed.
pub fn decrypt_media_bytes(path: &Path, gallery_key: &GalleryKey, media_id: &Uuid) -> VaultResult<Vec<u8>> {
    let sealed = fs::metadata(path)?.len();
    let expected = plaintext_len(sealed);

    let mut out = Vec::new();
    out.try_reserve_exact(expected as usize)
        .map_err(|_| VaultError::OutOfMemory { requested: expected })?;

    let mut decryptor = open_media_file(path, gallery_key, media_id)?;
    decryptor.copy_prefix(&mut out, u64::MAX)?;
    Ok(out)
}
