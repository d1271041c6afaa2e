use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keeper_core::{RemoteStore, RestoreStatus};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::{diagnostic_tail, StorageError};
use crate::status::StatusStore;
use crate::sync::layout::Layout;
use crate::sync::lock::SyncLock;
use crate::sync::restore;

/// What asked for a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Background loop tick; syncs only on change or when the force interval elapsed
    Scheduled,
    /// External request; always syncs
    Manual,
    /// Final drain on termination; always syncs
    Shutdown,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTrigger::Scheduled => write!(f, "scheduled"),
            SyncTrigger::Manual => write!(f, "manual"),
            SyncTrigger::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Why a sync ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncReason {
    ChangeDetected,
    Periodic,
    #[serde(rename = "change+periodic")]
    ChangeAndPeriodic,
    Manual,
    Shutdown,
}

impl SyncReason {
    /// Reason for a scheduled tick, or `None` when nothing calls for a sync.
    pub fn detect(changed: bool, force_due: bool) -> Option<Self> {
        match (changed, force_due) {
            (true, true) => Some(SyncReason::ChangeAndPeriodic),
            (true, false) => Some(SyncReason::ChangeDetected),
            (false, true) => Some(SyncReason::Periodic),
            (false, false) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncReason::ChangeDetected => "change-detected",
            SyncReason::Periodic => "periodic",
            SyncReason::ChangeAndPeriodic => "change+periodic",
            SyncReason::Manual => "manual",
            SyncReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for SyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one sync invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    NotConfigured,
    LockBusy,
    Idle,
    Synced {
        reason: SyncReason,
        at: DateTime<Utc>,
    },
    Failed {
        reason: SyncReason,
        error: String,
    },
}

/// Boot restore plus lock-guarded mirroring of the tracked trees to remote.
///
/// Remote failures are reported through [`SyncOutcome::Failed`] and the
/// persisted sync record; `Err` is reserved for the state directory itself
/// misbehaving.
pub struct SyncEngine {
    remote: Option<Arc<dyn RemoteStore>>,
    layout: Layout,
    status: StatusStore,
    lock: SyncLock,
    force_interval: Duration,
}

impl SyncEngine {
    /// Create a new SyncEngine. `remote` is `None` when storage is not configured.
    pub fn new(
        remote: Option<Arc<dyn RemoteStore>>,
        layout: Layout,
        status: StatusStore,
        force_interval: Duration,
    ) -> Self {
        let lock = SyncLock::new(status.clone());
        Self {
            remote,
            layout,
            status,
            lock,
            force_interval,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.remote.is_some()
    }

    /// Boot-time restore. Must run before the first scheduled sync.
    pub async fn restore(&self) -> Result<RestoreStatus, StorageError> {
        restore::restore(self.remote.as_deref(), &self.layout, &self.status).await
    }

    /// Run one sync immediately, regardless of detected changes.
    pub async fn trigger_sync(&self) -> Result<SyncOutcome, StorageError> {
        self.sync(SyncTrigger::Manual).await
    }

    /// Run one sync attempt. Never waits for the lock.
    #[instrument(skip(self), level = "debug")]
    pub async fn sync(&self, trigger: SyncTrigger) -> Result<SyncOutcome, StorageError> {
        let Some(remote) = self.remote.as_deref() else {
            return Ok(SyncOutcome::NotConfigured);
        };

        let Some(_guard) = self.lock.try_acquire()? else {
            self.log(&format!("skip (lock busy): {}", trigger)).await;
            info!("Sync skipped, lock busy ({})", trigger);
            return Ok(SyncOutcome::LockBusy);
        };

        // Anything modified at or after this stamp counts as a change next tick
        let scan_started = self.status.stamp_now().await?;
        let reason = match trigger {
            SyncTrigger::Manual => SyncReason::Manual,
            SyncTrigger::Shutdown => SyncReason::Shutdown,
            SyncTrigger::Scheduled => {
                let changed = self.changed().await?;
                let force_due = self.force_due().await?;
                match SyncReason::detect(changed, force_due) {
                    Some(reason) => reason,
                    None => {
                        self.log("idle: no changes, force interval not elapsed").await;
                        debug!("No changes and force interval not elapsed");
                        return Ok(SyncOutcome::Idle);
                    }
                }
            }
        };

        info!("Sync starting ({})", reason);
        match self.push_all(remote).await {
            Ok(()) => {
                let at = Utc::now();
                self.status.record_sync_success(at).await?;
                self.status.advance_watermark(scan_started).await?;
                self.log(&format!("sync ok: {}", reason)).await;
                info!("Sync complete ({})", reason);
                Ok(SyncOutcome::Synced { reason, at })
            }
            Err(e) => {
                let error = diagnostic_tail(&e.to_string(), 1024);
                self.status
                    .record_sync_failure(reason.as_str(), &error)
                    .await?;
                self.log(&format!("sync failed: {}: {}", reason, error)).await;
                warn!("Sync failed ({}): {}", reason, error);
                Ok(SyncOutcome::Failed { reason, error })
            }
        }
    }

    async fn push_all(&self, remote: &dyn RemoteStore) -> Result<(), StorageError> {
        for (tree, excludes) in self.layout.trees() {
            remote.push(&tree.local, &tree.prefix, excludes).await?;
        }
        Ok(())
    }

    async fn changed(&self) -> Result<bool, StorageError> {
        let watermark = self.status.watermark().await?;
        let layout = self.layout.clone();
        tokio::task::spawn_blocking(move || layout.changed_since(watermark))
            .await
            .map_err(|e| StorageError::Internal(format!("Change scan failed: {}", e)))
    }

    async fn force_due(&self) -> Result<bool, StorageError> {
        let Some(last) = self.status.last_sync_at().await? else {
            return Ok(true);
        };
        // A last-sync in the future (clock skew) counts as recent
        Ok((Utc::now() - last)
            .to_std()
            .is_ok_and(|elapsed| elapsed >= self.force_interval))
    }

    async fn log(&self, line: &str) {
        if let Err(e) = self.status.append_log(line).await {
            warn!("Failed to append sync log: {}", e);
        }
    }
}
