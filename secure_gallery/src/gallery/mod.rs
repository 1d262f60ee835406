//! Secure Gallery - Gallery Store
//!
//! Owns the gallery collection. A gallery is "unlocked" by trial-decrypting
//! its canary note with a key derived from the attempted PIN; there is no
//! other credential check and no way to confirm a gallery name without its
//! PIN.

pub mod journal;
pub mod lockout;
pub mod model;

pub use journal::{Journal, JournalRecord};
pub use lockout::UnlockThrottle;
pub use model::{Gallery, MediaKind, SecureMedia, SecureNote, SortOrder, CANARY_TITLE};

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::VaultConfig;
use crate::crypto::{decrypt_field, derive_key, encrypt_field, encrypt_media_file, generate_salt, GalleryKey, Salt};
use crate::error::{VaultError, VaultResult};
use crate::secure_fs::{shred_file, SecureFs};

const CANARY_BODY: &str = "Notes and media in this gallery are encrypted with your PIN.";
const MAX_NAME_LEN: usize = 64;

/// Proof of a successful unlock: the gallery id and its derived key.
/// Only the store hands these out.
#[derive(Debug, Clone)]
pub struct UnlockedGallery {
    id: Uuid,
    key: Arc<GalleryKey>,
}

impl UnlockedGallery {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &Arc<GalleryKey> {
        &self.key
    }
}

/// A decrypted note
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteContent {
    pub id: Uuid,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub is_canary: bool,
}

struct StoreState {
    galleries: Vec<Gallery>,
    journal: Journal,
}

impl StoreState {
    /// Journal first, then memory; a failed append changes nothing
    fn commit(&mut self, record: JournalRecord) -> VaultResult<()> {
        self.journal.append(&record)?;
        record.apply(&mut self.galleries);

        if self.journal.needs_compaction() {
            if let Err(e) = self.journal.compact(&self.galleries) {
                warn!("Snapshot compaction failed, journal kept: {}", e);
            }
        }
        Ok(())
    }

    fn gallery(&self, id: &Uuid) -> VaultResult<&Gallery> {
        self.galleries
            .iter()
            .find(|g| g.id == *id)
            .ok_or(VaultError::GalleryNotFound(*id))
    }

    fn name_taken(&self, name: &str, except: Option<&Uuid>) -> bool {
        self.galleries
            .iter()
            .any(|g| g.name == name && Some(&g.id) != except)
    }
}

/// The gallery collection
pub struct GalleryStore {
    fs: SecureFs,
    state: Mutex<StoreState>,
    throttle: Mutex<UnlockThrottle>,
}

impl GalleryStore {
    /// Open the store at `config.root`, replaying any journal
    pub fn open(config: &VaultConfig) -> VaultResult<Self> {
        let fs = SecureFs::new(&config.root);
        let (journal, galleries) = Journal::open(fs.clone(), config.journal.compact_after)?;

        Ok(Self {
            fs,
            state: Mutex::new(StoreState { galleries, journal }),
            throttle: Mutex::new(UnlockThrottle::new(config.lockout.clone())),
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().galleries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate_name(name: &str) -> VaultResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(VaultError::InvalidName("name is empty".into()));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(VaultError::InvalidName(format!("longer than {} characters", MAX_NAME_LEN)));
        }
        if name.chars().any(char::is_control) {
            return Err(VaultError::InvalidName("contains control characters".into()));
        }
        Ok(name.to_string())
    }

    fn seal_note(key: &GalleryKey, title: &str, body: &str) -> VaultResult<SecureNote> {
        Ok(SecureNote {
            id: Uuid::new_v4(),
            title: encrypt_field(title.as_bytes(), key)?,
            body: encrypt_field(body.as_bytes(), key)?,
            created_at: Utc::now(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // GALLERIES
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a gallery. Fails with [`VaultError::NameConflict`] if the name
    /// is taken, leaving existing state untouched.
    pub fn create_gallery(&self, name: &str, pin: &str) -> VaultResult<UnlockedGallery> {
        let name = Self::validate_name(name)?;
        if self.state.lock().name_taken(&name, None) {
            return Err(VaultError::NameConflict(name));
        }

        let salt = generate_salt();
        let key = Arc::new(derive_key(pin, &salt));
        let canary = Self::seal_note(&key, CANARY_TITLE, CANARY_BODY)?;

        let id = Uuid::new_v4();
        let gallery = Gallery {
            id,
            name: name.clone(),
            salt,
            canary_id: canary.id,
            notes: vec![canary],
            media: Vec::new(),
            sort_order: SortOrder::default(),
            created_at: Utc::now(),
            dir: Gallery::dir_name(&name, &id),
        };

        let mut state = self.state.lock();
        // Re-check: key derivation ran without the lock
        if state.name_taken(&name, None) {
            return Err(VaultError::NameConflict(name));
        }

        self.fs.create_gallery_dir(&gallery.dir)?;
        let dir = gallery.dir.clone();
        if let Err(e) = state.commit(JournalRecord::CreateGallery { gallery }) {
            let _ = self.fs.remove_dir(&dir);
            return Err(e);
        }

        info!("Created gallery {}", id);
        Ok(UnlockedGallery { id, key })
    }

    fn canary_matches(key: &GalleryKey, canary_title: &[u8]) -> bool {
        matches!(decrypt_field(canary_title, key), Ok(title) if title == CANARY_TITLE.as_bytes())
    }

    /// Resolve a PIN to the gallery it unlocks.
    ///
    /// Every gallery is tried, so the time taken does not depend on which
    /// one matched. A miss is `Ok(None)` whether or not any gallery exists;
    /// repeated misses start a cooldown during which this returns
    /// [`VaultError::LockedOut`] without trying anything.
    pub fn find_by_pin(&self, pin: &str) -> VaultResult<Option<UnlockedGallery>> {
        self.throttle.lock().check()?;

        let candidates: Vec<(Uuid, Salt, Option<Vec<u8>>)> = self
            .state
            .lock()
            .galleries
            .iter()
            .map(|g| (g.id, g.salt, g.canary().map(|n| n.title.clone())))
            .collect();

        let mut found = None;
        for (id, salt, canary) in candidates {
            let Some(canary) = canary else {
                warn!("Gallery {} has no canary note", id);
                continue;
            };
            let key = derive_key(pin, &salt);
            if found.is_none() && Self::canary_matches(&key, &canary) {
                found = Some(UnlockedGallery { id, key: Arc::new(key) });
            }
        }

        let mut throttle = self.throttle.lock();
        match &found {
            Some(unlocked) => {
                throttle.record_success();
                debug!("PIN resolved to gallery {}", unlocked.id);
            }
            None => throttle.record_failure(),
        }
        Ok(found)
    }

    /// Snapshot of an unlocked gallery's record
    pub fn gallery(&self, unlocked: &UnlockedGallery) -> VaultResult<Gallery> {
        self.state.lock().gallery(&unlocked.id).cloned()
    }

    /// Absolute directory of an unlocked gallery
    pub fn gallery_dir(&self, unlocked: &UnlockedGallery) -> VaultResult<PathBuf> {
        let state = self.state.lock();
        Ok(self.fs.full_path(&state.gallery(&unlocked.id)?.dir))
    }

    /// Rename; the gallery directory moves with it
    pub fn rename_gallery(&self, unlocked: &UnlockedGallery, new_name: &str) -> VaultResult<()> {
        let name = Self::validate_name(new_name)?;
        let mut state = self.state.lock();
        let old_dir = state.gallery(&unlocked.id)?.dir.clone();

        if state.name_taken(&name, Some(&unlocked.id)) {
            return Err(VaultError::NameConflict(name));
        }

        let new_dir = Gallery::dir_name(&name, &unlocked.id);
        self.fs.rename_dir(&old_dir, &new_dir)?;

        let record = JournalRecord::RenameGallery {
            id: unlocked.id,
            name,
            dir: new_dir.clone(),
        };
        if let Err(e) = state.commit(record) {
            let _ = self.fs.rename_dir(&new_dir, &old_dir);
            return Err(e);
        }
        Ok(())
    }

    /// Delete the gallery and shred everything under its directory.
    /// Returns the number of files removed.
    pub fn delete_gallery(&self, unlocked: &UnlockedGallery) -> VaultResult<usize> {
        let mut state = self.state.lock();
        let dir = state.gallery(&unlocked.id)?.dir.clone();
        state.commit(JournalRecord::DeleteGallery { id: unlocked.id })?;
        drop(state);

        let removed = self.fs.remove_dir(&dir)?;
        info!("Deleted gallery {} ({} files)", unlocked.id, removed);
        Ok(removed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // NOTES
    // ═══════════════════════════════════════════════════════════════════════

    pub fn add_note(&self, unlocked: &UnlockedGallery, title: &str, body: &str) -> VaultResult<Uuid> {
        let note = Self::seal_note(&unlocked.key, title, body)?;
        let id = note.id;

        let mut state = self.state.lock();
        state.gallery(&unlocked.id)?;
        state.commit(JournalRecord::AddNote {
            gallery: unlocked.id,
            note,
        })?;
        Ok(id)
    }

    fn open_note(key: &GalleryKey, note: &SecureNote, canary_id: &Uuid) -> VaultResult<NoteContent> {
        let title = decrypt_field(&note.title, key)?;
        let body = decrypt_field(&note.body, key)?;
        Ok(NoteContent {
            id: note.id,
            title: String::from_utf8(title).map_err(|_| VaultError::Crypto)?,
            body: String::from_utf8(body).map_err(|_| VaultError::Crypto)?,
            created_at: note.created_at,
            is_canary: note.id == *canary_id,
        })
    }

    pub fn decrypt_note(&self, unlocked: &UnlockedGallery, note_id: &Uuid) -> VaultResult<NoteContent> {
        let gallery = self.gallery(unlocked)?;
        let note = gallery.note(note_id).ok_or(VaultError::NoteNotFound(*note_id))?;
        Self::open_note(&unlocked.key, note, &gallery.canary_id)
    }

    /// All notes in creation order, decrypted
    pub fn notes(&self, unlocked: &UnlockedGallery) -> VaultResult<Vec<NoteContent>> {
        let gallery = self.gallery(unlocked)?;
        gallery
            .notes
            .iter()
            .map(|n| Self::open_note(&unlocked.key, n, &gallery.canary_id))
            .collect()
    }

    pub fn remove_note(&self, unlocked: &UnlockedGallery, note_id: &Uuid) -> VaultResult<()> {
        let mut state = self.state.lock();
        let gallery = state.gallery(&unlocked.id)?;
        if gallery.canary_id == *note_id {
            return Err(VaultError::CanaryProtected);
        }
        if gallery.note(note_id).is_none() {
            return Err(VaultError::NoteNotFound(*note_id));
        }
        state.commit(JournalRecord::RemoveNote {
            gallery: unlocked.id,
            note: *note_id,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // MEDIA
    // ═══════════════════════════════════════════════════════════════════════

    /// Encrypt `source` into the gallery directory without recording it.
    /// The result must be passed to [`commit_media`](Self::commit_media)
    /// or [`discard_staged`](Self::discard_staged).
    pub fn stage_media(
        &self,
        unlocked: &UnlockedGallery,
        source: &Path,
        expected: Option<MediaKind>,
    ) -> VaultResult<SecureMedia> {
        let original_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();

        let mut header = [0u8; 16];
        let read = File::open(source)?.read(&mut header)?;
        let kind = MediaKind::detect(&header[..read], &original_name)
            .ok_or_else(|| VaultError::InvalidFileFormat(format!("{}: not a photo or video", original_name)))?;
        if let Some(expected) = expected {
            if kind != expected {
                return Err(VaultError::InvalidFileFormat(format!(
                    "{}: expected {:?}, found {:?}",
                    original_name, expected, kind
                )));
            }
        }

        let id = Uuid::new_v4();
        let file = SecureMedia::payload_file(&id);
        let dest = self.gallery_dir(unlocked)?.join(&file);
        let size = encrypt_media_file(source, &dest, &unlocked.key, &id)?;
        debug!("Staged {:?} {} ({} bytes)", kind, id, size);

        Ok(SecureMedia {
            id,
            kind,
            original_name,
            file,
            size,
            created_at: Utc::now(),
            custom_index: None,
        })
    }

    /// Record a staged item in the gallery
    pub fn commit_media(&self, unlocked: &UnlockedGallery, media: SecureMedia) -> VaultResult<()> {
        let mut state = self.state.lock();
        state.gallery(&unlocked.id)?;
        state.commit(JournalRecord::AddMedia {
            gallery: unlocked.id,
            media,
        })
    }

    /// Remove the files of a staged item that will not be committed
    pub fn discard_staged(&self, unlocked: &UnlockedGallery, media: &SecureMedia) -> VaultResult<()> {
        let dir = self.gallery_dir(unlocked)?;
        shred_file(&dir.join(&media.file))?;
        shred_file(&dir.join(media.thumbnail_file()))
    }

    /// Encrypt and record a photo
    pub fn add_photo(&self, unlocked: &UnlockedGallery, source: &Path) -> VaultResult<SecureMedia> {
        self.add_media_of(unlocked, source, Some(MediaKind::Photo))
    }

    /// Encrypt and record a photo or video, detected from its content
    pub fn add_media(&self, unlocked: &UnlockedGallery, source: &Path) -> VaultResult<SecureMedia> {
        self.add_media_of(unlocked, source, None)
    }

    fn add_media_of(&self, unlocked: &UnlockedGallery, source: &Path, kind: Option<MediaKind>) -> VaultResult<SecureMedia> {
        let media = self.stage_media(unlocked, source, kind)?;
        if let Err(e) = self.commit_media(unlocked, media.clone()) {
            let _ = self.discard_staged(unlocked, &media);
            return Err(e);
        }
        Ok(media)
    }

    pub fn media(&self, unlocked: &UnlockedGallery, media_id: &Uuid) -> VaultResult<SecureMedia> {
        let state = self.state.lock();
        state
            .gallery(&unlocked.id)?
            .media_item(media_id)
            .cloned()
            .ok_or(VaultError::MediaNotFound(*media_id))
    }

    /// Media in the gallery's display order
    pub fn sorted_media(&self, unlocked: &UnlockedGallery) -> VaultResult<Vec<SecureMedia>> {
        let state = self.state.lock();
        Ok(state
            .gallery(&unlocked.id)?
            .sorted_media()
            .into_iter()
            .cloned()
            .collect())
    }

    /// Drop the record, then shred payload and cached thumbnail
    pub fn remove_media(&self, unlocked: &UnlockedGallery, media_id: &Uuid) -> VaultResult<()> {
        let mut state = self.state.lock();
        let gallery = state.gallery(&unlocked.id)?;
        let media = gallery
            .media_item(media_id)
            .cloned()
            .ok_or(VaultError::MediaNotFound(*media_id))?;
        let dir = self.fs.full_path(&gallery.dir);

        state.commit(JournalRecord::RemoveMedia {
            gallery: unlocked.id,
            media: *media_id,
        })?;
        drop(state);

        shred_file(&dir.join(&media.file))?;
        shred_file(&dir.join(media.thumbnail_file()))
    }

    pub fn set_sort_order(&self, unlocked: &UnlockedGallery, order: SortOrder) -> VaultResult<()> {
        let mut state = self.state.lock();
        state.gallery(&unlocked.id)?;
        state.commit(JournalRecord::SetSortOrder {
            gallery: unlocked.id,
            order,
        })
    }

    /// Manual ordering: listed items first in the given order, the rest
    /// after them. Switches the gallery to [`SortOrder::Custom`].
    pub fn reorder_media(&self, unlocked: &UnlockedGallery, order: &[Uuid]) -> VaultResult<()> {
        let mut state = self.state.lock();
        let gallery = state.gallery(&unlocked.id)?;
        if let Some(missing) = order.iter().find(|id| gallery.media_item(id).is_none()) {
            return Err(VaultError::MediaNotFound(*missing));
        }
        state.commit(JournalRecord::ReorderMedia {
            gallery: unlocked.id,
            order: order.to_vec(),
        })
    }

    /// Fold the journal into a fresh snapshot
    pub fn flush(&self) -> VaultResult<()> {
        let mut state = self.state.lock();
        if state.journal.records() == 0 {
            return Ok(());
        }
        let StoreState { galleries, journal } = &mut *state;
        journal.compact(galleries)
    }
}
