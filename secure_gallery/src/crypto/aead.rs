//! Secure Gallery - AEAD Encryption
//!
//! AES-256-GCM with a 16-byte IV for every blob the gallery stores.

use aes_gcm::{
    aead::{consts::U16, Aead, KeyInit, Payload},
    aes::Aes256,
    AesGcm, Nonce,
};

use super::keys::{derive_key, generate_iv, generate_salt, GalleryKey, Salt, IV_LEN, SALT_LEN, TAG_LEN};
use crate::error::{VaultError, VaultResult};

/// AES-256-GCM keyed for 128-bit IVs
pub(crate) type GalleryCipher = AesGcm<Aes256, U16>;

/// Encrypted data with IV prepended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    /// Random per-call IV
    pub iv: [u8; IV_LEN],
    /// Ciphertext with authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    /// Serialize to bytes (iv || ciphertext)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(IV_LEN + self.ciphertext.len());
        result.extend_from_slice(&self.iv);
        result.extend_from_slice(&self.ciphertext);
        result
    }

    /// Deserialize from bytes (iv || ciphertext)
    pub fn from_bytes(data: &[u8]) -> VaultResult<Self> {
        if data.len() < IV_LEN + TAG_LEN {
            return Err(VaultError::Crypto);
        }

        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&data[..IV_LEN]);

        Ok(Self {
            iv,
            ciphertext: data[IV_LEN..].to_vec(),
        })
    }
}

pub(crate) fn cipher_for(key: &GalleryKey) -> VaultResult<GalleryCipher> {
    GalleryCipher::new_from_slice(key.expose()).map_err(|e| VaultError::EncryptionFailed(e.to_string()))
}

/// Encrypt under a fresh random IV
pub fn encrypt(plaintext: &[u8], key: &GalleryKey) -> VaultResult<EncryptedBlob> {
    encrypt_with_aad(plaintext, b"", key)
}

/// Encrypt under a fresh random IV, binding `aad`
pub fn encrypt_with_aad(plaintext: &[u8], aad: &[u8], key: &GalleryKey) -> VaultResult<EncryptedBlob> {
    let cipher = cipher_for(key)?;
    let iv = generate_iv();

    let ciphertext = cipher
        .encrypt(Nonce::<U16>::from_slice(&iv), Payload { msg: plaintext, aad })
        .map_err(|_| VaultError::EncryptionFailed("AES-GCM seal failed".into()))?;

    Ok(EncryptedBlob { iv, ciphertext })
}

/// Decrypt; every failure collapses into [`VaultError::Crypto`]
pub fn decrypt(iv: &[u8; IV_LEN], ciphertext: &[u8], key: &GalleryKey) -> VaultResult<Vec<u8>> {
    decrypt_with_aad(iv, ciphertext, b"", key)
}

/// Decrypt data sealed with [`encrypt_with_aad`]
pub fn decrypt_with_aad(iv: &[u8; IV_LEN], ciphertext: &[u8], aad: &[u8], key: &GalleryKey) -> VaultResult<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return Err(VaultError::Crypto);
    }

    let cipher = cipher_for(key).map_err(|_| VaultError::Crypto)?;

    cipher
        .decrypt(Nonce::<U16>::from_slice(iv), Payload { msg: ciphertext, aad })
        .map_err(|_| VaultError::Crypto)
}

/// Encrypt to the per-field layout `iv(16) || ciphertext`
pub fn encrypt_field(plaintext: &[u8], key: &GalleryKey) -> VaultResult<Vec<u8>> {
    Ok(encrypt(plaintext, key)?.to_bytes())
}

/// Decrypt a per-field `iv(16) || ciphertext` blob
pub fn decrypt_field(data: &[u8], key: &GalleryKey) -> VaultResult<Vec<u8>> {
    let blob = EncryptedBlob::from_bytes(data)?;
    decrypt(&blob.iv, &blob.ciphertext, key)
}

/// Seal a self-contained blob `salt(16) || iv(16) || ciphertext` under a PIN
pub fn seal_with_pin(plaintext: &[u8], pin: &str) -> VaultResult<Vec<u8>> {
    let salt = generate_salt();
    let key = derive_key(pin, &salt);
    let blob = encrypt(plaintext, &key)?;

    let mut out = Vec::with_capacity(SALT_LEN + IV_LEN + blob.ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&blob.to_bytes());
    Ok(out)
}

/// Open a blob produced by [`seal_with_pin`]
pub fn open_with_pin(data: &[u8], pin: &str) -> VaultResult<Vec<u8>> {
    if data.len() < SALT_LEN + IV_LEN + TAG_LEN {
        return Err(VaultError::Crypto);
    }

    let mut salt: Salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&data[..SALT_LEN]);
    let key = derive_key(pin, &salt);

    decrypt_field(&data[SALT_LEN..], &key)
}
