use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keeper_core::{HandleProvider, SandboxHandle};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::SandboxError;

/// Per-call retry bookkeeping handed to the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    /// 1-based attempt index
    pub attempt: u32,
    pub max_attempts: u32,
    pub operation_name: String,
}

/// Owns the sandbox session handle and retries operations across invalidation.
///
/// The handle is replaced, never mutated, when the backend revokes it. Callers
/// get it only for the duration of one operation attempt.
pub struct HandleSupervisor {
    provider: Arc<dyn HandleProvider>,
    current: Mutex<Option<Arc<dyn SandboxHandle>>>,
    default_attempts: u32,
    reacquisitions: AtomicU64,
}

impl std::fmt::Debug for HandleSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleSupervisor")
            .field("default_attempts", &self.default_attempts)
            .field("reacquisitions", &self.reacquisitions)
            .finish_non_exhaustive()
    }
}

impl HandleSupervisor {
    /// Create a new HandleSupervisor. `default_attempts` is clamped to at least 1.
    pub fn new(provider: Arc<dyn HandleProvider>, default_attempts: u32) -> Self {
        Self {
            provider,
            current: Mutex::new(None),
            default_attempts: default_attempts.max(1),
            reacquisitions: AtomicU64::new(0),
        }
    }

    /// Number of times a handle was discarded and reacquired.
    pub fn reacquisitions(&self) -> u64 {
        self.reacquisitions.load(Ordering::SeqCst)
    }

    /// Current handle, acquiring one if none is held.
    pub async fn handle(&self) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let mut current = self.current.lock().await;
        if let Some(handle) = current.as_ref() {
            return Ok(handle.clone());
        }
        let handle = self.provider.acquire().await?;
        debug!("Acquired sandbox handle {}", handle.id());
        *current = Some(handle.clone());
        Ok(handle)
    }

    /// Drop `stale` (if it is still the held handle) and acquire a fresh one.
    async fn reacquire(
        &self,
        stale: &Arc<dyn SandboxHandle>,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let mut current = self.current.lock().await;
        if let Some(held) = current.as_ref() {
            if !Arc::ptr_eq(held, stale) {
                // Someone else already replaced it
                return Ok(held.clone());
            }
        }
        *current = None;
        let handle = self.provider.acquire().await?;
        self.reacquisitions.fetch_add(1, Ordering::SeqCst);
        *current = Some(handle.clone());
        Ok(handle)
    }

    /// Run `operation` against a live handle, with the default attempt count.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T, SandboxError>
    where
        F: FnMut(Arc<dyn SandboxHandle>, RetryContext) -> Fut,
        Fut: Future<Output = Result<T, SandboxError>>,
    {
        self.with_retry(operation_name, self.default_attempts, None, operation)
            .await
    }

    /// Run `operation`, reacquiring the handle when it was invalidated.
    ///
    /// Only errors classified by [`SandboxError::is_handle_invalidated`] are
    /// retried, at most `attempts - 1` times. Any other error, or the last
    /// invalidation error once attempts run out, is returned unchanged.
    /// `initial` is used for the first attempt instead of the held handle.
    pub async fn with_retry<T, F, Fut>(
        &self,
        operation_name: &str,
        attempts: u32,
        initial: Option<Arc<dyn SandboxHandle>>,
        mut operation: F,
    ) -> Result<T, SandboxError>
    where
        F: FnMut(Arc<dyn SandboxHandle>, RetryContext) -> Fut,
        Fut: Future<Output = Result<T, SandboxError>>,
    {
        let max_attempts = attempts.max(1);
        let mut handle = match initial {
            Some(handle) => handle,
            None => self.handle().await?,
        };

        let mut attempt = 1;
        loop {
            let ctx = RetryContext {
                attempt,
                max_attempts,
                operation_name: operation_name.to_string(),
            };

            let err = match operation(handle.clone(), ctx).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_handle_invalidated() || attempt >= max_attempts {
                return Err(err);
            }

            warn!(
                "Sandbox handle invalidated during '{}' (attempt {}/{}), reacquiring: {}",
                operation_name, attempt, max_attempts, err
            );
            handle = self.reacquire(&handle).await?;
            attempt += 1;
        }
    }
}
