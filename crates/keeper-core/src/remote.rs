use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result of a read-only existence check against a remote prefix.
///
/// Backends turn whatever their transport reports into one of these three
/// outcomes right at the boundary, so callers never parse diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Exists,
    Missing,
    Error(String),
}

/// Remote object storage holding the durable copy of local state.
///
/// Prefixes are logical directory names inside the configured bucket
/// (e.g. `config`, `workspace`).
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Check whether a prefix holds at least one object.
    async fn probe(&self, prefix: &str) -> ProbeOutcome;

    /// Copy everything under `prefix` into `local_dir`.
    async fn pull(&self, prefix: &str, local_dir: &Path) -> Result<(), StorageError>;

    /// Mirror `local_dir` to `prefix`, skipping any path that has a component
    /// named in `excludes`.
    async fn push(
        &self,
        local_dir: &Path,
        prefix: &str,
        excludes: &[String],
    ) -> Result<(), StorageError>;
}
