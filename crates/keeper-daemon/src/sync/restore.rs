use std::path::Path;

use keeper_core::{ProbeOutcome, RemoteStore, RestoreState, RestoreStatus};
use tracing::{info, instrument, warn};

use crate::error::{diagnostic_tail, StorageError};
use crate::status::StatusStore;
use crate::sync::layout::Layout;

/// One prefix to copy down and where it goes.
struct Pull<'a> {
    prefix: &'a str,
    local: &'a Path,
}

/// Boot-time reconciliation of local state with the remote backup.
///
/// Records and returns exactly one [`RestoreStatus`]. Remote failures end up
/// as a `failed` status, never as an `Err`; `Err` means the status itself
/// could not be persisted.
#[instrument(skip_all, level = "debug")]
pub async fn restore(
    remote: Option<&dyn RemoteStore>,
    layout: &Layout,
    status: &StatusStore,
) -> Result<RestoreStatus, StorageError> {
    let Some(remote) = remote else {
        info!("Remote storage not configured, skipping restore");
        return record(status, RestoreStatus::now(RestoreState::NotConfigured, None)).await;
    };

    let forced = status.force_restore_requested().await;
    if forced {
        info!("Force restore requested, ignoring local state");
    } else {
        let scan = layout.clone();
        let has_local = tokio::task::spawn_blocking(move || scan.has_local_state())
            .await
            .map_err(|e| StorageError::Internal(format!("Local state scan failed: {}", e)))?;
        if has_local {
            info!("Local state present, not restoring from remote");
            return record(status, RestoreStatus::now(RestoreState::SkippedLocal, None)).await;
        }
    }

    let result = match restore_from(remote, layout).await {
        Ok(restored) if restored.is_empty() => {
            info!("No remote backup found, starting fresh");
            RestoreStatus::now(RestoreState::Fresh, None)
        }
        Ok(restored) => {
            info!("Restored {} from remote", restored.join(", "));
            RestoreStatus::now(RestoreState::Restored, Some(restored.join(", ")))
        }
        Err(e) => {
            warn!("Restore failed, continuing without remote state: {}", e);
            RestoreStatus::now(
                RestoreState::Failed,
                Some(diagnostic_tail(&e.to_string(), 1024)),
            )
        }
    };

    let result = record(status, result).await?;
    if forced {
        status.clear_force_restore().await?;
    }
    Ok(result)
}

async fn record(status: &StatusStore, restore: RestoreStatus) -> Result<RestoreStatus, StorageError> {
    status.write_restore_status(&restore).await?;
    let line = match &restore.detail {
        Some(detail) => format!("restore {}: {}", restore.state, detail),
        None => format!("restore {}", restore.state),
    };
    if let Err(e) = status.append_log(&line).await {
        warn!("Failed to append sync log: {}", e);
    }
    Ok(restore)
}

/// Probe every prefix, then copy down the ones that exist. Returns the
/// prefixes restored. Any probe error or copy failure aborts.
async fn restore_from(remote: &dyn RemoteStore, layout: &Layout) -> Result<Vec<String>, StorageError> {
    let mut pulls = Vec::new();
    let mut legacy = false;

    if exists(remote, &layout.config.prefix).await? {
        pulls.push(Pull {
            prefix: &layout.config.prefix,
            local: &layout.config.local,
        });
    } else if exists(remote, &layout.legacy_prefix).await? {
        legacy = true;
        pulls.push(Pull {
            prefix: &layout.legacy_prefix,
            local: &layout.config.local,
        });
    }
    for tree in [&layout.workspace, &layout.extensions] {
        if exists(remote, &tree.prefix).await? {
            pulls.push(Pull {
                prefix: &tree.prefix,
                local: &tree.local,
            });
        }
    }

    let mut restored = Vec::with_capacity(pulls.len());
    for pull in pulls {
        remote.pull(pull.prefix, pull.local).await?;
        restored.push(pull.prefix.to_string());
    }

    if legacy {
        migrate_legacy_config(layout).await?;
    }
    Ok(restored)
}

async fn exists(remote: &dyn RemoteStore, prefix: &str) -> Result<bool, StorageError> {
    match remote.probe(prefix).await {
        ProbeOutcome::Exists => Ok(true),
        ProbeOutcome::Missing => Ok(false),
        ProbeOutcome::Error(detail) => Err(StorageError::Remote(format!(
            "probe of {} failed: {}",
            prefix, detail
        ))),
    }
}

/// Rename the legacy config file to the primary name unless one is already there.
async fn migrate_legacy_config(layout: &Layout) -> Result<(), StorageError> {
    let legacy = layout.legacy_config_file_path();
    let primary = layout.config_file_path();
    if legacy == primary
        || !tokio::fs::try_exists(&legacy).await.unwrap_or(false)
        || tokio::fs::try_exists(&primary).await.unwrap_or(false)
    {
        return Ok(());
    }
    tokio::fs::rename(&legacy, &primary).await.map_err(|e| {
        StorageError::Io(format!(
            "Failed to migrate {} to {}: {}",
            legacy.display(),
            primary.display(),
            e
        ))
    })?;
    info!("Migrated legacy config to {}", primary.display());
    Ok(())
}
