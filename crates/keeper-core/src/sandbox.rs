use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

/// Lifecycle state of a managed process as reported by the sandbox.
///
/// `starting → running → {completed | failed | error}`; the last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Error,
}

impl ProcessStatus {
    /// Terminal states are sticky: once reached, the process never changes again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed | ProcessStatus::Failed | ProcessStatus::Error
        )
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Starting => write!(f, "starting"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Completed => write!(f, "completed"),
            ProcessStatus::Failed => write!(f, "failed"),
            ProcessStatus::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of a process running inside the sandbox.
///
/// This is an observation, not ownership: the status field is only as fresh
/// as the call that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedProcess {
    /// Sandbox-assigned process identifier
    pub id: String,
    /// Full command line the process was started with
    pub command: String,
    /// Status at the time of observation
    pub status: ProcessStatus,
    /// Exit code, if the process reported one
    pub exit_code: Option<i32>,
}

/// Captured output of a managed process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessLogs {
    pub stdout: String,
    pub stderr: String,
}

/// How to start a managed process.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Program to execute
    pub program: String,
    /// Arguments passed to the program
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Working directory (inherits the sandbox default when unset)
    pub cwd: Option<PathBuf>,
}

impl StartOptions {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Command line as it appears in process listings.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Signals that can be delivered to a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Ask the process to exit (SIGTERM)
    Terminate,
    /// Force the process to exit (SIGKILL)
    Kill,
}

/// Session handle addressing one sandbox container.
///
/// Handles can be revoked by the hosting platform at any time; every method
/// may then fail with an error for which
/// [`SandboxError::is_handle_invalidated`] returns true. Callers should not
/// hold on to a handle across calls and should go through a supervisor that
/// reacquires one instead.
#[async_trait]
pub trait SandboxHandle: Send + Sync + std::fmt::Debug {
    /// Identifier of this handle (for diagnostics only).
    fn id(&self) -> &str;

    /// List processes known to the sandbox.
    async fn list_processes(&self) -> Result<Vec<ManagedProcess>, SandboxError>;

    /// Start a new process.
    async fn start_process(&self, options: &StartOptions) -> Result<ManagedProcess, SandboxError>;

    /// Re-query a single process. `None` if the sandbox no longer knows it.
    async fn get_process(&self, process_id: &str) -> Result<Option<ManagedProcess>, SandboxError>;

    /// Fetch captured stdout/stderr for a process.
    async fn get_logs(&self, process_id: &str) -> Result<ProcessLogs, SandboxError>;

    /// Deliver a signal to a process.
    async fn signal_process(
        &self,
        process_id: &str,
        signal: ProcessSignal,
    ) -> Result<(), SandboxError>;
}

/// Source of fresh sandbox handles.
#[async_trait]
pub trait HandleProvider: Send + Sync {
    /// Acquire a new handle. Each call returns a handle independent of any
    /// previously returned one.
    async fn acquire(&self) -> Result<Arc<dyn SandboxHandle>, SandboxError>;
}
