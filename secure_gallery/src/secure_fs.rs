//! Secure Gallery - Filesystem Operations
//!
//! Atomic writes, per-gallery directories and secure deletion.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{VaultError, VaultResult};

/// Marker that keeps media scanners out of a gallery directory
pub const NO_MEDIA_MARKER: &str = ".nomedia";

/// Filesystem handler rooted at the vault directory
#[derive(Debug, Clone)]
pub struct SecureFs {
    /// Root directory
    root: PathBuf,
}

impl SecureFs {
    /// Create new SecureFs with root directory
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get full path for a relative file
    pub fn full_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Write file atomically
    pub fn write_file(&self, relative_path: &str, data: &[u8]) -> VaultResult<()> {
        let path = self.full_path(relative_path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to temp file first, then rename over the target
        let temp_path = path.with_extension("tmp");

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;

        file.write_all(data)?;
        file.sync_all()?;

        fs::rename(&temp_path, &path)?;

        Ok(())
    }

    /// Read file
    pub fn read_file(&self, relative_path: &str) -> VaultResult<Vec<u8>> {
        let path = self.full_path(relative_path);

        if !path.exists() {
            return Err(VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("file not found: {}", path.display()),
            )));
        }

        let mut file = File::open(&path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        Ok(data)
    }

    /// Delete file, overwriting it with zeros first
    pub fn delete_file(&self, relative_path: &str) -> VaultResult<()> {
        shred_file(&self.full_path(relative_path))
    }

    /// Check if file exists
    pub fn exists(&self, relative_path: &str) -> bool {
        self.full_path(relative_path).exists()
    }

    /// Create a gallery directory with its media-scanner marker
    pub fn create_gallery_dir(&self, dir_name: &str) -> VaultResult<PathBuf> {
        let dir = self.full_path(dir_name);
        fs::create_dir_all(dir.join("media"))?;
        fs::create_dir_all(dir.join("thumbs"))?;

        let marker = dir.join(NO_MEDIA_MARKER);
        if !marker.exists() {
            File::create(&marker)?;
        }

        Ok(dir)
    }

    /// Move a gallery directory
    pub fn rename_dir(&self, from: &str, to: &str) -> VaultResult<()> {
        let source = self.full_path(from);
        if source.exists() {
            fs::rename(source, self.full_path(to))?;
        }
        Ok(())
    }

    /// Remove a gallery directory and everything under it
    pub fn remove_dir(&self, relative_path: &str) -> VaultResult<usize> {
        let dir = self.full_path(relative_path);
        if !dir.exists() {
            return Ok(0);
        }

        let files: Vec<PathBuf> = WalkDir::new(&dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();

        for file in &files {
            shred_file(file)?;
        }
        fs::remove_dir_all(&dir)?;

        Ok(files.len())
    }

    /// Get total size of a directory under the root
    pub fn dir_size(&self, relative_path: &str) -> u64 {
        WalkDir::new(self.full_path(relative_path))
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }
}

/// Overwrite a file with zeros and unlink it
pub fn shred_file(path: &Path) -> VaultResult<()> {
    if !path.exists() {
        return Ok(());
    }

    if let Ok(metadata) = fs::metadata(path) {
        let size = metadata.len() as usize;
        if size > 0 {
            if let Ok(mut file) = OpenOptions::new().write(true).open(path) {
                let zeros = vec![0u8; size.min(1024 * 1024)]; // Max 1MB chunks
                let mut remaining = size;
                while remaining > 0 {
                    let to_write = remaining.min(zeros.len());
                    if file.write_all(&zeros[..to_write]).is_err() {
                        break;
                    }
                    remaining -= to_write;
                }
                let _ = file.sync_all();
            }
        }
    }

    fs::remove_file(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_secure_fs() {
        let dir = tempdir().unwrap();
        let fs = SecureFs::new(dir.path());

        fs.write_file("test/data.enc", b"encrypted data").unwrap();
        assert!(fs.exists("test/data.enc"));
        assert!(!fs.exists("test/data.tmp"));

        let data = fs.read_file("test/data.enc").unwrap();
        assert_eq!(data, b"encrypted data");

        fs.delete_file("test/data.enc").unwrap();
        assert!(!fs.exists("test/data.enc"));
    }

    #[test]
    fn test_gallery_dir_lifecycle() {
        let dir = tempdir().unwrap();
        let fs = SecureFs::new(dir.path());

        fs.create_gallery_dir("vault-1234abcd").unwrap();
        assert!(fs.exists("vault-1234abcd/.nomedia"));
        assert!(fs.exists("vault-1234abcd/media"));

        fs.write_file("vault-1234abcd/media/a.enc", &[1u8; 100]).unwrap();
        assert_eq!(fs.dir_size("vault-1234abcd"), 100);

        fs.rename_dir("vault-1234abcd", "safe-1234abcd").unwrap();
        assert!(fs.exists("safe-1234abcd/media/a.enc"));

        assert_eq!(fs.remove_dir("safe-1234abcd").unwrap(), 2);
        assert!(!fs.exists("safe-1234abcd"));
    }
}
