//! Secure Gallery - Error Types

use thiserror::Error;
use uuid::Uuid;

/// Result type for gallery operations
pub type VaultResult<T> = Result<T, VaultError>;

/// Gallery error types
#[derive(Error, Debug)]
pub enum VaultError {
    // ═══════════════════════════════════════════════════════════════
    // CRYPTO ERRORS
    // ═══════════════════════════════════════════════════════════════

    /// Wrong key, corrupted ciphertext or malformed blob. Deliberately
    /// carries no detail so callers cannot tell the cases apart.
    #[error("Decryption failed: wrong key or corrupted data")]
    Crypto,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    // ═══════════════════════════════════════════════════════════════
    // GALLERY ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("A gallery named '{0}' already exists")]
    NameConflict(String),

    #[error("Gallery not found: {0}")]
    GalleryNotFound(Uuid),

    #[error("Media not found: {0}")]
    MediaNotFound(Uuid),

    #[error("Note not found: {0}")]
    NoteNotFound(Uuid),

    #[error("Invalid gallery name: {0}")]
    InvalidName(String),

    #[error("The welcome note cannot be removed")]
    CanaryProtected,

    #[error("Too many failed attempts - retry in {retry_after_secs}s")]
    LockedOut { retry_after_secs: i64 },

    /// Saving the gallery collection failed; the mutation was not applied.
    #[error("Gallery persistence failed: {0}")]
    PersistenceFailed(String),

    // ═══════════════════════════════════════════════════════════════
    // MEMORY ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Aborted under memory pressure")]
    MemoryPressure,

    #[error("Out of memory allocating {requested} bytes")]
    OutOfMemory { requested: u64 },

    // ═══════════════════════════════════════════════════════════════
    // FILE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Invalid file format: {0}")]
    InvalidFileFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ═══════════════════════════════════════════════════════════════
    // PIPELINE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Thumbnail generation failed: {0}")]
    ThumbnailFailed(String),

    #[error("Image processing error: {0}")]
    ImageError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0}s")]
    Timeout(u64),

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    // ═══════════════════════════════════════════════════════════════
    // SERIALIZATION / CONFIG ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl VaultError {
    /// Any of the "referenced id does not exist" errors
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            VaultError::GalleryNotFound(_) | VaultError::MediaNotFound(_) | VaultError::NoteNotFound(_)
        )
    }

    /// Check if this is a security-critical error
    pub fn is_security_critical(&self) -> bool {
        matches!(self, VaultError::Crypto | VaultError::LockedOut { .. })
    }

    /// Check if the caller may retry later or accept a degraded result
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VaultError::NameConflict(_)
                | VaultError::MemoryPressure
                | VaultError::OutOfMemory { .. }
                | VaultError::LockedOut { .. }
                | VaultError::ThumbnailFailed(_)
                | VaultError::Timeout(_)
                | VaultError::Cancelled
        ) || self.is_not_found()
    }

    /// Allocation refusal, real or simulated
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, VaultError::OutOfMemory { .. })
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}

impl From<image::ImageError> for VaultError {
    fn from(e: image::ImageError) -> Self {
        match e {
            image::ImageError::Limits(_) => VaultError::OutOfMemory { requested: 0 },
            other => VaultError::ImageError(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            VaultError::Cancelled
        } else {
            VaultError::TaskFailed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_error_is_opaque() {
        let msg = VaultError::Crypto.to_string();
        assert!(!msg.contains("padding"));
        assert!(!msg.contains("tag"));
        assert!(VaultError::Crypto.is_security_critical());
    }

    #[test]
    fn test_limits_error_maps_to_oom() {
        let limits = image::error::LimitError::from_kind(image::error::LimitErrorKind::InsufficientMemory);
        let err: VaultError = image::ImageError::Limits(limits).into();
        assert!(err.is_out_of_memory());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_not_found_family() {
        assert!(VaultError::GalleryNotFound(Uuid::nil()).is_not_found());
        assert!(VaultError::NoteNotFound(Uuid::nil()).is_not_found());
        assert!(!VaultError::Crypto.is_not_found());
    }
}
