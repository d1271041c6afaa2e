// Re-export from keeper-core
pub use keeper_core::{SandboxError, StorageError};

use keeper_core::ProcessStatus;
use thiserror::Error;

/// Errors surfaced by the process lifecycle.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// The process never left `starting`/`running` within the wait budget.
    #[error(
        "Process {process_id} did not complete within {timeout_ms}ms \
         (last status: {last_status}, polls: {polls})"
    )]
    WaitTimeout {
        process_id: String,
        timeout_ms: u64,
        last_status: ProcessStatus,
        polls: u32,
    },

    #[error("Process {0} is no longer known to the sandbox")]
    ProcessVanished(String),

    #[error("Process {process_id} exited during startup ({status}, exit code {exit_code:?}): {detail}")]
    ExitedDuringStartup {
        process_id: String,
        status: ProcessStatus,
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("Process {process_id} was not ready within {timeout_ms}ms")]
    ReadinessTimeout { process_id: String, timeout_ms: u64 },
}

/// Keep the last `max_chars` characters of a diagnostic, trimmed.
pub fn diagnostic_tail(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max_chars).collect();
    format!("...{}", tail.trim_start())
}
