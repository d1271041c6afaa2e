//! Core traits and types for the sandbox keeper.
//!
//! This crate defines the abstractions shared between the daemon and anything
//! that drives or inspects it:
//! - `SandboxHandle` / `HandleProvider`: addressing the container and its processes
//! - `RemoteStore`: durable object storage for backup and restore
//! - `RestoreStatus` / `SyncRecord`: the persisted outcome records

mod error;
mod remote;
mod sandbox;
mod status;

pub use error::{SandboxError, StorageError};
pub use remote::{ProbeOutcome, RemoteStore};
pub use sandbox::{
    HandleProvider, ManagedProcess, ProcessLogs, ProcessSignal, ProcessStatus, SandboxHandle,
    StartOptions,
};
pub use status::{RestoreState, RestoreStatus, SyncRecord};
