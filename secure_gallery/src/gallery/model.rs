//! Gallery records as persisted in the snapshot and journal.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::Salt;

/// Title every gallery's first note is created with
pub const CANARY_TITLE: &str = "Welcome";

/// Photo or video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    /// Classify by magic bytes, falling back to the file extension
    pub fn detect(header: &[u8], file_name: &str) -> Option<Self> {
        Self::from_magic(header).or_else(|| Self::from_extension(file_name))
    }

    /// Classify by magic bytes alone
    pub fn from_magic(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }

        match &data[0..12] {
            [0xFF, 0xD8, 0xFF, ..] => Some(Self::Photo),
            [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(Self::Photo),
            [b'G', b'I', b'F', b'8', ..] => Some(Self::Photo),
            [b'B', b'M', ..] => Some(Self::Photo),
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P'] => Some(Self::Photo),
            [b'R', b'I', b'F', b'F', _, _, _, _, b'A', b'V', b'I', b' '] => Some(Self::Video),
            [0x1A, 0x45, 0xDF, 0xA3, ..] => Some(Self::Video),
            [_, _, _, _, b'f', b't', b'y', b'p', brand @ ..] => match brand {
                b"heic" | b"heix" | b"mif1" | b"msf1" | b"avif" => Some(Self::Photo),
                _ => Some(Self::Video),
            },
            _ => None,
        }
    }

    /// Classify by extension
    pub fn from_extension(file_name: &str) -> Option<Self> {
        let ext = Path::new(file_name).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "heic" | "heif" => Some(Self::Photo),
            "mp4" | "m4v" | "mov" | "3gp" | "mkv" | "webm" | "avi" | "mjpeg" | "mjpg" => Some(Self::Video),
            _ => None,
        }
    }
}

/// Display ordering of a gallery's media
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
    NameAsc,
    NameDesc,
    /// Manual order from `custom_index`; unindexed items follow, newest first
    Custom,
}

/// Encrypted note. Each field is a self-contained `iv || ciphertext` blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureNote {
    pub id: Uuid,
    #[serde(with = "b64")]
    pub title: Vec<u8>,
    #[serde(with = "b64")]
    pub body: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Encrypted media item. The payload lives in `<gallery dir>/<file>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureMedia {
    pub id: Uuid,
    pub kind: MediaKind,
    pub original_name: String,
    /// Payload path relative to the gallery directory
    pub file: String,
    /// Plaintext size in bytes
    pub size: u64,
    pub created_at: DateTime<Utc>,
    /// Position in a manual ordering; `None` means default order
    #[serde(default)]
    pub custom_index: Option<u32>,
}

impl SecureMedia {
    /// Relative payload path for a new item
    pub fn payload_file(id: &Uuid) -> String {
        format!("media/{}.enc", id)
    }

    /// Relative path of the encrypted on-disk thumbnail
    pub fn thumbnail_file(&self) -> String {
        format!("thumbs/{}.enc", self.id)
    }
}

/// A gallery: name, salt and encrypted contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gallery {
    pub id: Uuid,
    pub name: String,
    /// Fixed at creation
    #[serde(with = "b64_salt")]
    pub salt: Salt,
    /// The canary note; always `notes[0]` and never removable
    pub canary_id: Uuid,
    pub notes: Vec<SecureNote>,
    pub media: Vec<SecureMedia>,
    #[serde(default)]
    pub sort_order: SortOrder,
    pub created_at: DateTime<Utc>,
    /// Directory name under the vault root
    pub dir: String,
}

impl Gallery {
    /// Directory name for a gallery: sanitised name plus id prefix
    pub fn dir_name(name: &str, id: &Uuid) -> String {
        let mut cleaned: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .take(32)
            .collect();
        if cleaned.trim_matches('_').is_empty() {
            cleaned = "gallery".into();
        }
        let simple = id.simple().to_string();
        format!("{}-{}", cleaned, &simple[..8])
    }

    pub fn canary(&self) -> Option<&SecureNote> {
        self.notes.iter().find(|n| n.id == self.canary_id)
    }

    pub fn note(&self, id: &Uuid) -> Option<&SecureNote> {
        self.notes.iter().find(|n| n.id == *id)
    }

    pub fn media_item(&self, id: &Uuid) -> Option<&SecureMedia> {
        self.media.iter().find(|m| m.id == *id)
    }

    /// Media in this gallery's display order
    pub fn sorted_media(&self) -> Vec<&SecureMedia> {
        let mut items: Vec<&SecureMedia> = self.media.iter().collect();
        match self.sort_order {
            SortOrder::NewestFirst => items.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            SortOrder::OldestFirst => items.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
            SortOrder::NameAsc => items.sort_by_key(|m| m.original_name.to_lowercase()),
            SortOrder::NameDesc => {
                items.sort_by_key(|m| m.original_name.to_lowercase());
                items.reverse();
            }
            SortOrder::Custom => items.sort_by(|a, b| match (a.custom_index, b.custom_index) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => b.created_at.cmp(&a.created_at),
            }),
        }
        items
    }

    /// Assign custom indices in the given order; ids not listed become unset
    pub fn apply_custom_order(&mut self, order: &[Uuid]) {
        for item in &mut self.media {
            item.custom_index = order.iter().position(|id| *id == item.id).map(|p| p as u32);
        }
        self.sort_order = SortOrder::Custom;
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

mod b64_salt {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::crypto::{Salt, SALT_LEN};

    pub fn serialize<S: Serializer>(salt: &Salt, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(salt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Salt, D::Error> {
        let text = String::deserialize(d)?;
        let bytes = STANDARD.decode(text).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("salt must be {} bytes", SALT_LEN)))
    }
}
