use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keeper_core::{ManagedProcess, ProcessStatus, RestoreStatus};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, StorageError};
use crate::process::{GatewaySpec, ProcessLifecycle};
use crate::sync::{SyncEngine, SyncOutcome, SyncTrigger};

/// How long a single gateway exit check waits before polling again.
const EXIT_CHECK_WINDOW: Duration = Duration::from_secs(3600);

/// The managed gateway and how long it gets to stop.
#[derive(Debug, Clone)]
struct Gateway {
    process: ManagedProcess,
    stop_grace: Duration,
}

/// Owns everything that must be torn down in order on termination: the
/// background sync loop, the managed gateway process and the shutdown flag.
pub struct Keeper {
    engine: Arc<SyncEngine>,
    lifecycle: Arc<ProcessLifecycle>,
    shutdown_sync_timeout: Duration,
    shutting_down: AtomicBool,
    stop_tx: watch::Sender<bool>,
    sync_loop: Mutex<Option<JoinHandle<()>>>,
    gateway: Mutex<Option<Gateway>>,
}

impl Keeper {
    pub fn new(
        engine: Arc<SyncEngine>,
        lifecycle: Arc<ProcessLifecycle>,
        shutdown_sync_timeout: Duration,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            engine,
            lifecycle,
            shutdown_sync_timeout,
            shutting_down: AtomicBool::new(false),
            stop_tx,
            sync_loop: Mutex::new(None),
            gateway: Mutex::new(None),
        }
    }

    /// Boot-time restore. Runs before the sync loop so the restore status is
    /// always recorded ahead of the first tick.
    pub async fn restore(&self) -> Result<RestoreStatus, StorageError> {
        self.engine.restore().await
    }

    /// Bring the gateway up (or adopt a running one) and remember it for shutdown.
    pub async fn start_gateway(&self, spec: &GatewaySpec) -> Result<ManagedProcess, LifecycleError> {
        let process = self.lifecycle.ensure_running(spec).await?;
        *self.gateway.lock().await = Some(Gateway {
            process: process.clone(),
            stop_grace: spec.stop_grace,
        });
        Ok(process)
    }

    /// Start the background loop running a scheduled sync every `scan_interval`.
    /// Does nothing when storage is not configured or a loop is already running.
    pub async fn spawn_sync_loop(&self, scan_interval: Duration) {
        if !self.engine.is_configured() {
            info!("Remote storage not configured, sync loop disabled");
            return;
        }
        let mut slot = self.sync_loop.lock().await;
        if slot.is_some() {
            return;
        }

        let engine = self.engine.clone();
        let mut stop = self.stop_tx.subscribe();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scan_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; the first sync waits a full interval
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.sync(SyncTrigger::Scheduled).await {
                            Ok(outcome) => debug!("Sync tick: {:?}", outcome),
                            Err(e) => warn!("Sync tick failed: {}", e),
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!("Sync loop stopped");
        }));
        info!("Sync loop started (every {:?})", scan_interval);
    }

    /// Resolves once the managed gateway has exited. Never resolves when no
    /// gateway is managed.
    pub async fn gateway_exited(&self) -> ProcessStatus {
        let gateway = self.gateway.lock().await.clone();
        let Some(gateway) = gateway else {
            return std::future::pending().await;
        };
        loop {
            match self
                .lifecycle
                .wait_for_process(
                    &gateway.process,
                    EXIT_CHECK_WINDOW,
                    self.lifecycle.poll_interval(),
                )
                .await
            {
                Ok(status) => return status,
                Err(LifecycleError::WaitTimeout { .. }) => continue,
                Err(e) => {
                    warn!("Lost track of gateway process: {}", e);
                    return ProcessStatus::Error;
                }
            }
        }
    }

    /// Ordered, bounded teardown. Only the first call acts; later calls
    /// return `false` immediately.
    ///
    /// 1. final `shutdown` sync, cancelled at the deadline
    /// 2. stop the sync loop, aborting it at the deadline
    /// 3. terminate the gateway
    pub async fn shutdown(&self) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return false;
        }
        info!("Shutting down");
        let deadline = Instant::now() + self.shutdown_sync_timeout;

        if self.engine.is_configured() {
            match timeout_at(deadline, self.engine.sync(SyncTrigger::Shutdown)).await {
                Ok(Ok(SyncOutcome::Synced { .. })) => info!("Final sync complete"),
                Ok(Ok(outcome)) => warn!("Final sync did not complete: {:?}", outcome),
                Ok(Err(e)) => warn!("Final sync failed: {}", e),
                Err(_) => warn!(
                    "Final sync exceeded {:?}, abandoning it",
                    self.shutdown_sync_timeout
                ),
            }
        }

        let _ = self.stop_tx.send(true);
        if let Some(mut handle) = self.sync_loop.lock().await.take() {
            if timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Sync loop did not stop in time, aborting it");
                handle.abort();
            }
        }

        if let Some(gateway) = self.gateway.lock().await.take() {
            match self
                .lifecycle
                .terminate(&gateway.process, gateway.stop_grace)
                .await
            {
                Ok(status) => info!("Gateway stopped ({})", status),
                Err(e) => warn!("Failed to stop gateway: {}", e),
            }
        }
        true
    }
}
