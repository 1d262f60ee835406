//! Secure Gallery - Configuration
//!
//! Every section has working defaults; a JSON file may override any field.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::error::{VaultError, VaultResult};

const MIB: u64 = 1024 * 1024;

/// Largest first cooldown; the doubled maximum still fits a `chrono::Duration`
const MAX_BASE_COOLDOWN_SECS: i64 = 24 * 60 * 60;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault root directory
    pub root: PathBuf,
    /// Scratch directory for decrypted temporaries. Defaults to `<root>/.cache`.
    pub cache_dir: Option<PathBuf>,
    pub memory: MemoryConfig,
    pub thumbnails: ThumbnailConfig,
    pub playback: PlaybackConfig,
    pub import: ImportConfig,
    pub lockout: LockoutConfig,
    pub journal: JournalConfig,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./calc_vault"),
            cache_dir: None,
            memory: MemoryConfig::default(),
            thumbnails: ThumbnailConfig::default(),
            playback: PlaybackConfig::default(),
            import: ImportConfig::default(),
            lockout: LockoutConfig::default(),
            journal: JournalConfig::default(),
        }
    }
}

impl VaultConfig {
    /// Defaults rooted at `root`
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Load from a JSON file; missing fields keep their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> VaultResult<Self> {
        let raw = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&raw)
            .map_err(|e| VaultError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load if the file exists, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> VaultResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> VaultResult<()> {
        let m = &self.memory;
        if !(0.0 < m.low_threshold && m.low_threshold < m.critical_threshold && m.critical_threshold <= 1.0) {
            return Err(VaultError::Config(format!(
                "memory thresholds must satisfy 0 < low ({}) < critical ({}) <= 1",
                m.low_threshold, m.critical_threshold
            )));
        }
        if !(0.0 < m.bitmap_cache_fraction && m.bitmap_cache_fraction < 1.0) {
            return Err(VaultError::Config("bitmap_cache_fraction must be in (0, 1)".into()));
        }
        let p = &self.playback;
        if p.min_initial_chunk > p.max_initial_chunk {
            return Err(VaultError::Config("playback.min_initial_chunk exceeds max_initial_chunk".into()));
        }
        if self.thumbnails.default_size == 0 || self.import.thumbnail_size == 0 {
            return Err(VaultError::Config("thumbnail sizes must be non-zero".into()));
        }
        let base = self.lockout.base_cooldown_secs;
        if !(0..=MAX_BASE_COOLDOWN_SECS).contains(&base) {
            return Err(VaultError::Config(format!(
                "lockout.base_cooldown_secs must be within 0..={} (got {})",
                MAX_BASE_COOLDOWN_SECS, base
            )));
        }
        if self.journal.compact_after == 0 {
            return Err(VaultError::Config("journal.compact_after must be non-zero".into()));
        }
        Ok(())
    }

    /// Directory for decrypted temporaries
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| self.root.join(".cache"))
    }
}

/// Memory budget settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Heap budget in bytes; queried from the device when unset
    pub max_heap_bytes: Option<u64>,
    /// Usage fraction above which memory counts as low
    pub low_threshold: f64,
    /// Usage fraction above which allocation-heavy work aborts
    pub critical_threshold: f64,
    /// Share of the heap budget the bitmap cache may hold
    pub bitmap_cache_fraction: f64,
    /// Byte budget for cached decrypted video prefixes
    pub prefix_cache_bytes: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_heap_bytes: None,
            low_threshold: 0.85,
            critical_threshold: 0.95,
            bitmap_cache_fraction: 0.125,
            prefix_cache_bytes: 16 * MIB,
        }
    }
}

impl MemoryConfig {
    /// Effective heap budget: the override, or 1/8 of device RAM clamped
    /// to 64 MiB..512 MiB
    pub fn resolve_max_heap(&self) -> u64 {
        if let Some(bytes) = self.max_heap_bytes {
            return bytes.max(1);
        }

        let mut sys = System::new();
        sys.refresh_memory();
        (sys.total_memory() / 8).clamp(64 * MIB, 512 * MIB)
    }
}

/// Thumbnail pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// Square bound used when callers do not ask for a size
    pub default_size: u32,
    /// Position of the video frame to extract
    pub video_frame_ms: u64,
    /// Hard limit on video frame extraction
    pub video_timeout_secs: u64,
    /// Assumed frame rate when mapping a position onto Motion-JPEG frames
    pub assumed_fps: u32,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            default_size: 256,
            video_frame_ms: 1_000,
            video_timeout_secs: 30,
            assumed_fps: 30,
        }
    }
}

impl ThumbnailConfig {
    pub fn video_timeout(&self) -> Duration {
        Duration::from_secs(self.video_timeout_secs)
    }

    pub fn video_frame_position(&self) -> Duration {
        Duration::from_millis(self.video_frame_ms)
    }
}

/// Video playback preparation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Files at or below this size are decrypted whole before playback
    pub whole_file_threshold: u64,
    /// Quick-start chunk bounds for streamed playback
    pub min_initial_chunk: u64,
    pub max_initial_chunk: u64,
    /// Unreferenced temp files older than this are deleted
    pub temp_ttl_secs: u64,
    /// How often the janitor looks for expired temp files
    pub sweep_interval_secs: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            whole_file_threshold: 50 * MIB,
            min_initial_chunk: 2 * MIB,
            max_initial_chunk: 20 * MIB,
            temp_ttl_secs: 30 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl PlaybackConfig {
    pub fn temp_ttl(&self) -> Duration {
        Duration::from_secs(self.temp_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Batch import settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Thumbnail bound generated for each imported item
    pub thumbnail_size: u32,
    /// Pause after an encryption step while memory is low
    pub encrypt_pause_ms: u64,
    /// Pause after a thumbnail step while memory is low
    pub thumbnail_pause_ms: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            thumbnail_size: 256,
            encrypt_pause_ms: 150,
            thumbnail_pause_ms: 400,
        }
    }
}

/// Unlock throttling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutConfig {
    /// Misses allowed before the cooldown starts
    pub max_attempts: u32,
    /// First cooldown; doubles with every further miss
    pub base_cooldown_secs: i64,
    pub enabled: bool,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_cooldown_secs: 30,
            enabled: true,
        }
    }
}

/// Gallery journal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Journal records that trigger a snapshot rewrite
    pub compact_after: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self { compact_after: 32 }
    }
}
