use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of the boot-time local/remote reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreState {
    /// Remote storage credentials are absent
    NotConfigured,
    /// Local state already present; remote was not consulted
    SkippedLocal,
    /// Every remote prefix was empty
    Fresh,
    /// At least one remote prefix was copied down
    Restored,
    /// A probe or copy failed; the host runs without restored state
    Failed,
}

impl std::fmt::Display for RestoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreState::NotConfigured => write!(f, "not_configured"),
            RestoreState::SkippedLocal => write!(f, "skipped_local"),
            RestoreState::Fresh => write!(f, "fresh"),
            RestoreState::Restored => write!(f, "restored"),
            RestoreState::Failed => write!(f, "failed"),
        }
    }
}

/// Restore record, written once per boot and read by status callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreStatus {
    pub state: RestoreState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RestoreStatus {
    /// Create a record stamped with the current time.
    pub fn now(state: RestoreState, detail: Option<String>) -> Self {
        Self {
            state,
            timestamp: Utc::now(),
            detail,
        }
    }
}

/// Outcome of the most recent sync attempts.
///
/// A success sets `last_sync_at` and clears `last_sync_error`; a failure sets
/// `last_sync_error` and leaves `last_sync_at` untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
}
