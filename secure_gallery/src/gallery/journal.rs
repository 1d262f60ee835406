//! Secure Gallery - Gallery Persistence
//!
//! `galleries.json` holds a full snapshot, rewritten atomically.
//! `galleries.journal` holds one line per mutation since that snapshot:
//!
//! ```text
//! <crc32 of json, 8 hex digits> <json record>\n
//! ```
//!
//! Loading replays the journal over the snapshot and stops at the first line
//! that is torn or fails its checksum; that tail is cut off.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32Hasher;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{Gallery, SecureMedia, SecureNote, SortOrder};
use crate::error::{VaultError, VaultResult};
use crate::secure_fs::SecureFs;

pub const SNAPSHOT_FILE: &str = "galleries.json";
pub const JOURNAL_FILE: &str = "galleries.journal";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    galleries: Vec<Gallery>,
}

/// One mutation of the gallery collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    CreateGallery { gallery: Gallery },
    RenameGallery { id: Uuid, name: String, dir: String },
    DeleteGallery { id: Uuid },
    AddNote { gallery: Uuid, note: SecureNote },
    RemoveNote { gallery: Uuid, note: Uuid },
    AddMedia { gallery: Uuid, media: SecureMedia },
    RemoveMedia { gallery: Uuid, media: Uuid },
    SetSortOrder { gallery: Uuid, order: SortOrder },
    ReorderMedia { gallery: Uuid, order: Vec<Uuid> },
}

impl JournalRecord {
    /// Apply to the in-memory collection. Idempotent, so replaying records
    /// already folded into the snapshot is harmless. Records naming a
    /// gallery that no longer exists are ignored.
    pub fn apply(&self, galleries: &mut Vec<Gallery>) {
        fn find(galleries: &[Gallery], id: &Uuid) -> Option<usize> {
            galleries.iter().position(|g| g.id == *id)
        }

        match self {
            JournalRecord::CreateGallery { gallery } => {
                if find(galleries, &gallery.id).is_none() {
                    galleries.push(gallery.clone());
                }
            }
            JournalRecord::RenameGallery { id, name, dir } => {
                if let Some(i) = find(galleries, id) {
                    galleries[i].name = name.clone();
                    galleries[i].dir = dir.clone();
                }
            }
            JournalRecord::DeleteGallery { id } => galleries.retain(|g| g.id != *id),
            JournalRecord::AddNote { gallery, note } => {
                if let Some(i) = find(galleries, gallery) {
                    if galleries[i].note(&note.id).is_none() {
                        galleries[i].notes.push(note.clone());
                    }
                }
            }
            JournalRecord::RemoveNote { gallery, note } => {
                if let Some(i) = find(galleries, gallery) {
                    galleries[i].notes.retain(|n| n.id != *note);
                }
            }
            JournalRecord::AddMedia { gallery, media } => {
                if let Some(i) = find(galleries, gallery) {
                    if galleries[i].media_item(&media.id).is_none() {
                        galleries[i].media.push(media.clone());
                    }
                }
            }
            JournalRecord::RemoveMedia { gallery, media } => {
                if let Some(i) = find(galleries, gallery) {
                    galleries[i].media.retain(|m| m.id != *media);
                }
            }
            JournalRecord::SetSortOrder { gallery, order } => {
                if let Some(i) = find(galleries, gallery) {
                    galleries[i].sort_order = *order;
                }
            }
            JournalRecord::ReorderMedia { gallery, order } => {
                if let Some(i) = find(galleries, gallery) {
                    galleries[i].apply_custom_order(order);
                }
            }
        }
    }
}

fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn persistence_error(context: &str, e: impl std::fmt::Display) -> VaultError {
    VaultError::PersistenceFailed(format!("{}: {}", context, e))
}

/// Snapshot plus append-only journal
pub struct Journal {
    fs: SecureFs,
    journal_path: PathBuf,
    file: File,
    /// Length of the valid journal prefix
    len: u64,
    records: usize,
    compact_after: usize,
}

impl Journal {
    /// Open (or create) the store under `fs.root()` and return the
    /// recovered gallery collection.
    pub fn open(fs: SecureFs, compact_after: usize) -> VaultResult<(Self, Vec<Gallery>)> {
        fs::create_dir_all(fs.root())?;

        let mut galleries = if fs.exists(SNAPSHOT_FILE) {
            let raw = fs.read_file(SNAPSHOT_FILE)?;
            let snapshot: Snapshot = serde_json::from_slice(&raw)
                .map_err(|e| persistence_error("unreadable gallery snapshot", e))?;
            if snapshot.version != SNAPSHOT_VERSION {
                return Err(VaultError::PersistenceFailed(format!(
                    "unsupported snapshot version {}",
                    snapshot.version
                )));
            }
            snapshot.galleries
        } else {
            Vec::new()
        };

        let journal_path = fs.full_path(JOURNAL_FILE);
        let (records, len) = Self::replay(&journal_path, &mut galleries)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&journal_path)?;
        if file.metadata()?.len() != len {
            warn!("Discarding corrupt journal tail after {} records", records);
            file.set_len(len)?;
            file.sync_all()?;
        }

        info!("Loaded {} galleries ({} journal records)", galleries.len(), records);

        Ok((
            Self {
                fs,
                journal_path,
                file,
                len,
                records,
                compact_after,
            },
            galleries,
        ))
    }

    /// Returns (records applied, byte length of the valid prefix)
    fn replay(path: &Path, galleries: &mut Vec<Gallery>) -> VaultResult<(usize, u64)> {
        if !path.exists() {
            return Ok((0, 0));
        }

        let mut reader = BufReader::new(File::open(path)?);
        let mut line = String::new();
        let mut records = 0;
        let mut valid = 0u64;

        loop {
            line.clear();
            let read = match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("Journal unreadable after {} records: {}", records, e);
                    break;
                }
            };
            if !line.ends_with('\n') {
                warn!("Torn journal line after {} records", records);
                break;
            }

            let Some(record) = Self::parse_line(line.trim_end_matches('\n')) else {
                warn!("Journal checksum mismatch after {} records", records);
                break;
            };
            record.apply(galleries);
            records += 1;
            valid += read as u64;
        }

        Ok((records, valid))
    }

    fn parse_line(line: &str) -> Option<JournalRecord> {
        let (crc_hex, json) = line.split_once(' ')?;
        let expected = u32::from_str_radix(crc_hex, 16).ok()?;
        if checksum(json.as_bytes()) != expected {
            return None;
        }
        serde_json::from_str(json).ok()
    }

    /// Durably append one record. On failure the journal is cut back to
    /// its previous length and the error is [`VaultError::PersistenceFailed`].
    pub fn append(&mut self, record: &JournalRecord) -> VaultResult<()> {
        let json = serde_json::to_string(record).map_err(|e| persistence_error("encode journal record", e))?;
        let line = format!("{:08x} {}\n", checksum(json.as_bytes()), json);

        let result = self
            .file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.sync_data());

        if let Err(e) = result {
            let _ = self.file.set_len(self.len);
            return Err(persistence_error("append journal", e));
        }

        self.len += line.len() as u64;
        self.records += 1;
        debug!("Journal record {} appended", self.records);
        Ok(())
    }

    pub fn needs_compaction(&self) -> bool {
        self.records >= self.compact_after
    }

    /// Rewrite the snapshot from `galleries` and empty the journal
    pub fn compact(&mut self, galleries: &[Gallery]) -> VaultResult<()> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            galleries: galleries.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot).map_err(|e| persistence_error("encode snapshot", e))?;
        self.fs
            .write_file(SNAPSHOT_FILE, &bytes)
            .map_err(|e| persistence_error("write snapshot", e))?;

        self.file
            .set_len(0)
            .and_then(|_| self.file.sync_all())
            .map_err(|e| persistence_error("truncate journal", e))?;

        info!("Compacted {} journal records into snapshot", self.records);
        self.len = 0;
        self.records = 0;
        Ok(())
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn path(&self) -> &Path {
        &self.journal_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::model::CANARY_TITLE;
    use chrono::Utc;
    use tempfile::tempdir;

    fn gallery(name: &str) -> Gallery {
        let id = Uuid::new_v4();
        Gallery {
            id,
            name: name.into(),
            salt: [1u8; 16],
            canary_id: Uuid::new_v4(),
            notes: Vec::new(),
            media: Vec::new(),
            sort_order: SortOrder::default(),
            created_at: Utc::now(),
            dir: Gallery::dir_name(name, &id),
        }
    }

    fn note() -> SecureNote {
        SecureNote {
            id: Uuid::new_v4(),
            title: CANARY_TITLE.as_bytes().to_vec(),
            body: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_replay_after_reopen() {
        let dir = tempdir().unwrap();
        let g = gallery("Vault");

        {
            let (mut journal, galleries) = Journal::open(SecureFs::new(dir.path()), 100).unwrap();
            assert!(galleries.is_empty());
            journal.append(&JournalRecord::CreateGallery { gallery: g.clone() }).unwrap();
            journal
                .append(&JournalRecord::AddNote { gallery: g.id, note: note() })
                .unwrap();
            journal
                .append(&JournalRecord::RenameGallery {
                    id: g.id,
                    name: "Safe".into(),
                    dir: "safe-x".into(),
                })
                .unwrap();
        }

        let (journal, galleries) = Journal::open(SecureFs::new(dir.path()), 100).unwrap();
        assert_eq!(journal.records(), 3);
        assert_eq!(galleries.len(), 1);
        assert_eq!(galleries[0].name, "Safe");
        assert_eq!(galleries[0].notes.len(), 1);
    }

    #[test]
    fn test_corrupt_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let a = gallery("A");
        let b = gallery("B");

        {
            let (mut journal, _) = Journal::open(SecureFs::new(dir.path()), 100).unwrap();
            journal.append(&JournalRecord::CreateGallery { gallery: a.clone() }).unwrap();
            journal.append(&JournalRecord::CreateGallery { gallery: b.clone() }).unwrap();
        }

        // Flip a byte inside the second record and add a torn line
        let path = dir.path().join(JOURNAL_FILE);
        let mut raw = fs::read(&path).unwrap();
        let second = raw.iter().position(|&c| c == b'\n').unwrap() + 20;
        raw[second] ^= 0x01;
        raw.extend_from_slice(b"0000 {\"op\":");
        fs::write(&path, &raw).unwrap();

        let (mut journal, galleries) = Journal::open(SecureFs::new(dir.path()), 100).unwrap();
        assert_eq!(galleries.len(), 1);
        assert_eq!(galleries[0].id, a.id);

        // New records land after the valid prefix
        journal.append(&JournalRecord::DeleteGallery { id: a.id }).unwrap();
        drop(journal);
        let (_, galleries) = Journal::open(SecureFs::new(dir.path()), 100).unwrap();
        assert!(galleries.is_empty());
    }

    #[test]
    fn test_compaction_moves_state_into_snapshot() {
        let dir = tempdir().unwrap();
        let mut galleries = Vec::new();
        let (mut journal, _) = Journal::open(SecureFs::new(dir.path()), 2).unwrap();

        for name in ["A", "B"] {
            let record = JournalRecord::CreateGallery { gallery: gallery(name) };
            journal.append(&record).unwrap();
            record.apply(&mut galleries);
        }
        assert!(journal.needs_compaction());
        journal.compact(&galleries).unwrap();
        assert_eq!(journal.records(), 0);
        assert_eq!(fs::metadata(dir.path().join(JOURNAL_FILE)).unwrap().len(), 0);
        drop(journal);

        let (journal, reloaded) = Journal::open(SecureFs::new(dir.path()), 2).unwrap();
        assert_eq!(journal.records(), 0);
        assert_eq!(reloaded, galleries);
    }

    #[test]
    fn test_apply_ignores_unknown_gallery() {
        let mut galleries = vec![gallery("A")];
        JournalRecord::AddNote {
            gallery: Uuid::new_v4(),
            note: note(),
        }
        .apply(&mut galleries);
        assert!(galleries[0].notes.is_empty());
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut galleries = vec![gallery("A")];
        let record = JournalRecord::AddNote {
            gallery: galleries[0].id,
            note: note(),
        };
        record.apply(&mut galleries);
        record.apply(&mut galleries);
        assert_eq!(galleries[0].notes.len(), 1);
    }
}
