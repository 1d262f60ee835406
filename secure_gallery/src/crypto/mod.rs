//! Secure Gallery - Cryptographic Core
//!
//! PBKDF2 key derivation, AES-256-GCM field blobs and segmented media streams.

pub mod keys;
pub mod aead;
pub mod stream;

pub use keys::*;
pub use aead::*;
pub use stream::*;
