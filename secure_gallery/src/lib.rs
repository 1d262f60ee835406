//! # Secure Gallery
//!
//! Encrypted storage engine for a calculator-disguised photo, video and
//! note vault.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     GALLERY VAULT                        │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────┐  │
//! │  │  GALLERY    │  │  IMPORT     │  │  PLAYBACK       │  │
//! │  │  STORE      │  │  COORDINATOR│  │  (temp files)   │  │
//! │  │  PIN+canary │  │  3 phases   │  │  quick start    │  │
//! │  └──────┬──────┘  └──────┬──────┘  └────────┬────────┘  │
//! │         │                │                   │           │
//! │  ┌──────┴────────────────┴───────────────────┴────────┐ │
//! │  │                 CRYPTO CORE                         │ │
//! │  │   PBKDF2 → gallery key ─ HKDF → per-media key       │ │
//! │  │   AES-256-GCM fields · segmented media streams      │ │
//! │  └─────────────────────────────────────────────────────┘ │
//! │                                                          │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────┐  │
//! │  │  THUMBNAIL  │  │  MEMORY     │  │  JOURNAL +      │  │
//! │  │  PIPELINE   │──│  BUDGET     │  │  SNAPSHOT       │  │
//! │  │  photo/video│  │  LRU + pins │  │  (crc32 lines)  │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────┘  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - Every gallery has its own salt; its key is derived from the PIN
//! - A PIN is checked only by decrypting the gallery's canary note
//! - Wrong PIN and missing gallery are indistinguishable
//! - Notes, media and stored thumbnails are authenticated-encrypted
//! - Decrypted temporaries are shredded when released
//! - Keys zeroized on drop

pub mod api;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gallery;
pub mod import;
pub mod memory;
pub mod playback;
pub mod secure_fs;
pub mod thumbs;

pub use api::GalleryVault;
pub use config::VaultConfig;
pub use error::{VaultError, VaultResult};
pub use gallery::{GalleryStore, MediaKind, UnlockedGallery};
pub use import::{ImportCoordinator, ImportHandle, ImportPhase, ImportProgress, ImportReport};
pub use memory::{Bitmap, MemoryManager, PinnedBitmap};
pub use playback::{PlayableFile, PlaybackManager};
pub use thumbs::{MediaRef, ThumbnailPipeline};

/// Secure Gallery version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
