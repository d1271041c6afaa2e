use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use keeper_core::{RestoreStatus, SyncRecord};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::error::StorageError;

const RESTORE_STATUS_FILE: &str = "restore-status.json";
const LAST_SYNC_FILE: &str = "last-sync";
const LAST_SYNC_ERROR_FILE: &str = "last-sync-error";
const SYNC_LOG_FILE: &str = "sync.log";
const WATERMARK_FILE: &str = ".last-sync-marker";
const LOCK_FILE: &str = "sync.lock";
const FORCE_RESTORE_FILE: &str = "force-restore";
const SCAN_STAMP_FILE: &str = ".scan-stamp";

/// Default size at which `sync.log` is trimmed.
const DEFAULT_LOG_MAX_BYTES: u64 = 256 * 1024;

/// File-backed persistence for restore/sync status records.
///
/// Layout under `{state_dir}`:
/// - `restore-status.json` - boot-time restore outcome
/// - `last-sync` / `last-sync-error` - sync record
/// - `sync.log` - activity log, trimmed to its newer half once it outgrows the limit
/// - `.last-sync-marker` - change watermark (its mtime)
/// - `.scan-stamp` - scratch file whose mtime is the start of the current sync
/// - `sync.lock` - advisory lock file
/// - `force-restore` - one-shot "restore from remote regardless" marker
#[derive(Debug, Clone)]
pub struct StatusStore {
    state_dir: PathBuf,
    log_max_bytes: u64,
}

impl StatusStore {
    /// Create a new StatusStore rooted at the given directory.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
            log_max_bytes: DEFAULT_LOG_MAX_BYTES,
        }
    }

    /// Trim the activity log once it exceeds `max_bytes`.
    pub fn with_log_limit(mut self, max_bytes: u64) -> Self {
        self.log_max_bytes = max_bytes;
        self
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.state_dir.join(name)
    }

    /// Path of the advisory lock file guarding storage I/O.
    pub fn lock_path(&self) -> PathBuf {
        self.path(LOCK_FILE)
    }

    async fn ensure_state_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.state_dir).await.map_err(|e| {
            StorageError::Io(format!(
                "Failed to create state dir {}: {}",
                self.state_dir.display(),
                e
            ))
        })
    }

    /// Write a record atomically (temp file + rename).
    async fn write_atomic(&self, name: &str, contents: &str) -> Result<(), StorageError> {
        self.ensure_state_dir().await?;
        let path = self.path(name);
        let temp_path = self.path(&format!("{}.tmp", name));
        fs::write(&temp_path, contents).await.map_err(|e| {
            StorageError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            StorageError::Io(format!("Failed to rename to {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    async fn read_optional(&self, name: &str) -> Result<Option<String>, StorageError> {
        let path = self.path(name);
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn remove_optional(&self, name: &str) -> Result<(), StorageError> {
        let path = self.path(name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    // =========================================================================
    // Restore status
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    pub async fn write_restore_status(&self, status: &RestoreStatus) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(status).map_err(|e| {
            StorageError::Serialization(format!("Failed to serialize restore status: {}", e))
        })?;
        self.write_atomic(RESTORE_STATUS_FILE, &json).await?;
        debug!("Recorded restore status {}", status.state);
        Ok(())
    }

    pub async fn read_restore_status(&self) -> Result<Option<RestoreStatus>, StorageError> {
        let Some(json) = self.read_optional(RESTORE_STATUS_FILE).await? else {
            return Ok(None);
        };
        let status = serde_json::from_str(&json).map_err(|e| {
            StorageError::Serialization(format!("Failed to parse restore status: {}", e))
        })?;
        Ok(Some(status))
    }

    // =========================================================================
    // Sync record
    // =========================================================================

    /// Record a successful sync: set the timestamp and clear any error.
    #[instrument(skip(self), level = "debug")]
    pub async fn record_sync_success(&self, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.write_atomic(LAST_SYNC_FILE, &at.to_rfc3339()).await?;
        self.remove_optional(LAST_SYNC_ERROR_FILE).await
    }

    /// Record a failed sync. The last-sync timestamp is left untouched.
    #[instrument(skip(self, detail), level = "debug")]
    pub async fn record_sync_failure(&self, reason: &str, detail: &str) -> Result<(), StorageError> {
        self.write_atomic(LAST_SYNC_ERROR_FILE, &format!("{}: {}", reason, detail))
            .await
    }

    pub async fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let Some(text) = self.read_optional(LAST_SYNC_FILE).await? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(text.trim()) {
            Ok(at) => Ok(Some(at.with_timezone(&Utc))),
            Err(e) => {
                // An unreadable timestamp just means "never synced" for scheduling purposes
                warn!("Ignoring malformed last-sync record {:?}: {}", text.trim(), e);
                Ok(None)
            }
        }
    }

    pub async fn read_sync_record(&self) -> Result<SyncRecord, StorageError> {
        Ok(SyncRecord {
            last_sync_at: self.last_sync_at().await?,
            last_sync_error: self
                .read_optional(LAST_SYNC_ERROR_FILE)
                .await?
                .map(|e| e.trim().to_string()),
        })
    }

    // =========================================================================
    // Activity log
    // =========================================================================

    /// Append one line to the sync activity log, trimming it when it has
    /// grown past the limit.
    pub async fn append_log(&self, line: &str) -> Result<(), StorageError> {
        self.ensure_state_dir().await?;
        let path = self.path(SYNC_LOG_FILE);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to open sync log: {}", e)))?;
        let entry = format!("[{}] {}\n", Utc::now().to_rfc3339(), line);
        file.write_all(entry.as_bytes())
            .await
            .map_err(|e| StorageError::Io(format!("Failed to append sync log: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to flush sync log: {}", e)))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to stat sync log: {}", e)))?
            .len();
        drop(file);
        if len > self.log_max_bytes {
            self.trim_log().await?;
        }
        Ok(())
    }

    /// Keep the newest whole lines fitting in half the limit.
    async fn trim_log(&self) -> Result<(), StorageError> {
        let Some(log) = self.read_optional(SYNC_LOG_FILE).await? else {
            return Ok(());
        };
        let keep = usize::try_from(self.log_max_bytes / 2).unwrap_or(usize::MAX);
        let cut = log.len().saturating_sub(keep);
        let start = log.as_bytes()[cut..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(log.len(), |i| cut + i + 1);
        self.write_atomic(SYNC_LOG_FILE, &log[start..]).await?;
        debug!("Trimmed sync log from {} to {} bytes", log.len(), log.len() - start);
        Ok(())
    }

    pub async fn read_log(&self) -> Result<String, StorageError> {
        Ok(self.read_optional(SYNC_LOG_FILE).await?.unwrap_or_default())
    }

    // =========================================================================
    // Change watermark
    // =========================================================================

    /// Current time as the filesystem records it, read back from a freshly
    /// written stamp file. Compares exactly with tracked mtimes, which the
    /// kernel stamps from a coarser clock than `SystemTime::now()`.
    #[instrument(skip(self), level = "debug")]
    pub async fn stamp_now(&self) -> Result<SystemTime, StorageError> {
        self.write_atomic(SCAN_STAMP_FILE, "").await?;
        fs::metadata(self.path(SCAN_STAMP_FILE))
            .await
            .and_then(|meta| meta.modified())
            .map_err(|e| StorageError::Io(format!("Failed to read scan stamp: {}", e)))
    }

    /// Current watermark, or `None` before the first successful sync.
    pub async fn watermark(&self) -> Result<Option<SystemTime>, StorageError> {
        match fs::metadata(self.path(WATERMARK_FILE)).await {
            Ok(meta) => meta
                .modified()
                .map(Some)
                .map_err(|e| StorageError::Io(format!("Failed to read watermark: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(format!("Failed to stat watermark: {}", e))),
        }
    }

    /// Move the watermark to `to`. Never moves it backwards.
    #[instrument(skip(self), level = "debug")]
    pub async fn advance_watermark(&self, to: SystemTime) -> Result<(), StorageError> {
        if let Some(current) = self.watermark().await? {
            if current >= to {
                debug!("Watermark already at or past requested time");
                return Ok(());
            }
        }
        self.ensure_state_dir().await?;
        let path = self.path(WATERMARK_FILE);
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            file.set_modified(to)
        })
        .await
        .map_err(|e| StorageError::Internal(format!("Watermark task failed: {}", e)))?
        .map_err(|e| StorageError::Io(format!("Failed to set watermark: {}", e)))
    }

    // =========================================================================
    // Force-restore marker
    // =========================================================================

    pub async fn force_restore_requested(&self) -> bool {
        fs::metadata(self.path(FORCE_RESTORE_FILE)).await.is_ok()
    }

    pub async fn request_force_restore(&self) -> Result<(), StorageError> {
        self.write_atomic(FORCE_RESTORE_FILE, "").await
    }

    pub async fn clear_force_restore(&self) -> Result<(), StorageError> {
        self.remove_optional(FORCE_RESTORE_FILE).await
    }

    /// Open (creating if needed) the lock file. Blocking; callers hold it briefly.
    pub fn open_lock_file(&self) -> Result<File, StorageError> {
        std::fs::create_dir_all(&self.state_dir).map_err(|e| {
            StorageError::Io(format!(
                "Failed to create state dir {}: {}",
                self.state_dir.display(),
                e
            ))
        })?;
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())
            .map_err(|e| StorageError::Io(format!("Failed to open lock file: {}", e)))
    }
}
