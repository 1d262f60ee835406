//! Secure Gallery - Key Management
//!
//! Derives gallery keys from a PIN and the gallery salt, and per-file
//! subkeys from a gallery key.

use std::fmt;

use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{VaultError, VaultResult};

/// Key length for AES-256
pub const KEY_LEN: usize = 32;

/// Salt length stored with every gallery
pub const SALT_LEN: usize = 16;

/// IV length for every encrypted blob
pub const IV_LEN: usize = 16;

/// GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// PBKDF2-HMAC-SHA256 rounds. Changing this orphans every existing gallery.
pub const PBKDF2_ROUNDS: u32 = 65_536;

/// HKDF contexts for subkey derivation
pub mod contexts {
    /// Per-file media payload keys
    pub const MEDIA: &[u8] = b"CALCVAULT:MEDIA:v1";
}

/// Gallery salt, generated once at creation
pub type Salt = [u8; SALT_LEN];

/// Secure key wrapper with automatic zeroization
pub struct GalleryKey {
    inner: Secret<[u8; KEY_LEN]>,
}

impl GalleryKey {
    /// Create a key from raw bytes
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            inner: Secret::new(bytes),
        }
    }

    /// Expose the key bytes (use with caution)
    pub fn expose(&self) -> &[u8; KEY_LEN] {
        self.inner.expose_secret()
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        rand::thread_rng().fill_bytes(&mut *bytes);
        Self::new(*bytes)
    }
}

impl fmt::Debug for GalleryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GalleryKey([REDACTED])")
    }
}

impl PartialEq for GalleryKey {
    fn eq(&self, other: &Self) -> bool {
        // Constant-time comparison
        self.expose()
            .iter()
            .zip(other.expose().iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for GalleryKey {}

/// Derive the gallery key from a PIN and the gallery salt.
///
/// PBKDF2-HMAC-SHA256, [`PBKDF2_ROUNDS`] rounds, 256-bit output. The same
/// `(pin, salt)` pair always yields the same key.
pub fn derive_key(pin: &str, salt: &Salt) -> GalleryKey {
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(pin.as_bytes(), salt, PBKDF2_ROUNDS, &mut *okm);
    GalleryKey::new(*okm)
}

/// Derive the per-file key a media payload is encrypted under
pub fn derive_media_key(gallery_key: &GalleryKey, media_id: &Uuid) -> VaultResult<GalleryKey> {
    let hk = Hkdf::<Sha256>::new(Some(media_id.as_bytes()), gallery_key.expose());
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);

    hk.expand(contexts::MEDIA, &mut *okm)
        .map_err(|e| VaultError::KeyDerivationFailed(e.to_string()))?;

    Ok(GalleryKey::new(*okm))
}

/// Generate a fresh gallery salt
pub fn generate_salt() -> Salt {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Generate a fresh IV. Never reuse one under the same key.
pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let salt = [7u8; SALT_LEN];
        let k1 = derive_key("1234", &salt);
        let k2 = derive_key("1234", &salt);
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_pin_and_salt_sensitivity() {
        let salt = generate_salt();
        let k1 = derive_key("1234", &salt);
        let k2 = derive_key("1235", &salt);
        assert_ne!(k1, k2);

        let other_salt = generate_salt();
        assert_ne!(derive_key("1234", &other_salt), k1);
    }

    #[test]
    fn test_media_keys_are_per_file() {
        let key = GalleryKey::generate();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let ka1 = derive_media_key(&key, &a).unwrap();
        let ka2 = derive_media_key(&key, &a).unwrap();
        let kb = derive_media_key(&key, &b).unwrap();

        assert_eq!(ka1, ka2);
        assert_ne!(ka1, kb);
        assert_ne!(ka1, key);
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = GalleryKey::new([0xAB; KEY_LEN]);
        assert_eq!(format!("{:?}", key), "GalleryKey([REDACTED])");
    }
}
