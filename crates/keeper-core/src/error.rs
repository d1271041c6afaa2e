use thiserror::Error;

/// Errors that can occur in the storage layer (status records, remote copies).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Phrases the hosting platform uses when it has revoked a session handle.
const INVALIDATION_PHRASES: &[&str] = &[
    "handle invalidated",
    "handle is stale",
    "session was reset",
    "durable object reset",
    "stub is no longer valid",
    "network connection lost",
];

/// Errors raised while talking to the sandbox through a session handle.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The backend revoked the handle; a fresh one must be acquired.
    #[error("Sandbox handle invalidated: {0}")]
    Invalidated(String),

    #[error("Sandbox backend error: {0}")]
    Backend(String),

    #[error("Process not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl SandboxError {
    /// Whether this error carries the "backend invalidated this handle" signature.
    ///
    /// `Invalidated` always matches. `Backend` errors match when their text
    /// contains one of the platform's known invalidation phrases, since some
    /// transports only surface the revocation as free-form text.
    pub fn is_handle_invalidated(&self) -> bool {
        match self {
            SandboxError::Invalidated(_) => true,
            SandboxError::Backend(msg) => {
                let msg = msg.to_lowercase();
                INVALIDATION_PHRASES.iter().any(|p| msg.contains(p))
            }
            _ => false,
        }
    }
}
