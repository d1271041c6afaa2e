use std::sync::Arc;
use std::time::Duration;

use keeper_core::{ManagedProcess, ProcessSignal, ProcessStatus, StartOptions};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, instrument, warn};

use crate::error::{diagnostic_tail, LifecycleError};
use crate::process::outcome::{CommandOutcome, SuccessPredicate};
use crate::sandbox::HandleSupervisor;

/// How long a single readiness connect attempt may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on waiting for exit after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// What the long-lived managed process is and how to tell it is ready.
#[derive(Debug, Clone)]
pub struct GatewaySpec {
    pub start: StartOptions,
    /// Substring identifying the process in sandbox listings
    pub match_pattern: String,
    /// Ready once this local port accepts connections; otherwise once `running`
    pub ready_port: Option<u16>,
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
}

/// Discovers, starts and waits on managed processes through the handle supervisor.
#[derive(Debug)]
pub struct ProcessLifecycle {
    supervisor: Arc<HandleSupervisor>,
    poll_interval: Duration,
}

impl ProcessLifecycle {
    /// Create a new ProcessLifecycle polling at `poll_interval`.
    pub fn new(supervisor: Arc<HandleSupervisor>, poll_interval: Duration) -> Self {
        Self {
            supervisor,
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Find a live (`starting` or `running`) process whose command contains
    /// `match_pattern`. A `running` match wins over a `starting` one.
    #[instrument(skip(self), level = "debug")]
    pub async fn find_existing_process(
        &self,
        match_pattern: &str,
    ) -> Result<Option<ManagedProcess>, LifecycleError> {
        let processes = self
            .supervisor
            .run("find_existing_process", |handle, ctx| async move {
                debug!(
                    "{} attempt {}/{} via {}",
                    ctx.operation_name,
                    ctx.attempt,
                    ctx.max_attempts,
                    handle.id()
                );
                handle.list_processes().await
            })
            .await?;

        let mut candidates: Vec<ManagedProcess> = processes
            .into_iter()
            .filter(|p| p.command.contains(match_pattern) && !p.status.is_terminal())
            .collect();
        candidates.sort_by_key(|p| p.status != ProcessStatus::Running);
        Ok(candidates.into_iter().next())
    }

    /// Make sure exactly one instance of the gateway is up and ready.
    ///
    /// An already-running match is returned unchanged; a starting match is
    /// waited on; otherwise a new process is started.
    #[instrument(skip(self, spec), level = "debug", fields(pattern = %spec.match_pattern))]
    pub async fn ensure_running(&self, spec: &GatewaySpec) -> Result<ManagedProcess, LifecycleError> {
        if let Some(existing) = self.find_existing_process(&spec.match_pattern).await? {
            if existing.status == ProcessStatus::Running {
                info!("Gateway already running as process {}", existing.id);
                return Ok(existing);
            }
            info!("Gateway process {} is starting, waiting for it", existing.id);
            return self.wait_until_ready(&existing, spec).await;
        }

        info!("Starting gateway: {}", spec.start.command_line());
        let process = self.start(&spec.start).await?;
        self.wait_until_ready(&process, spec).await
    }

    /// Start a process. The sandbox rejects calls on a revoked handle before
    /// doing anything, so retrying here cannot start a second copy.
    pub async fn start(&self, options: &StartOptions) -> Result<ManagedProcess, LifecycleError> {
        let process = self
            .supervisor
            .run("start_process", |handle, _| async move {
                handle.start_process(options).await
            })
            .await?;
        Ok(process)
    }

    /// Fresh status of a process, straight from the sandbox.
    async fn query(&self, process_id: &str) -> Result<ManagedProcess, LifecycleError> {
        self.supervisor
            .run("get_process", |handle, _| async move {
                handle.get_process(process_id).await
            })
            .await?
            .ok_or_else(|| LifecycleError::ProcessVanished(process_id.to_string()))
    }

    /// Poll until the process reaches a terminal state.
    ///
    /// Polls at most `ceil(timeout / poll_interval)` times, re-querying the
    /// sandbox each time. A zero timeout fails without polling. A terminal
    /// status on `process` is returned as-is, since terminal states never
    /// change.
    #[instrument(skip(self, process), level = "debug", fields(process_id = %process.id))]
    pub async fn wait_for_process(
        &self,
        process: &ManagedProcess,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<ProcessStatus, LifecycleError> {
        if process.status.is_terminal() {
            return Ok(process.status);
        }

        let poll_ms = (poll_interval.as_millis() as u64).max(1);
        let timeout_ms = timeout.as_millis() as u64;
        let max_polls = u32::try_from(timeout_ms.div_ceil(poll_ms)).unwrap_or(u32::MAX);
        let poll_interval = Duration::from_millis(poll_ms);

        let mut last_status = process.status;
        for poll in 1..=max_polls {
            sleep(poll_interval).await;
            let current = self.query(&process.id).await?;
            last_status = current.status;
            if last_status.is_terminal() {
                debug!(
                    "Process {} reached {} after {} polls",
                    process.id, last_status, poll
                );
                return Ok(last_status);
            }
        }

        Err(LifecycleError::WaitTimeout {
            process_id: process.id.clone(),
            timeout_ms,
            last_status,
            polls: max_polls,
        })
    }

    async fn wait_until_ready(
        &self,
        process: &ManagedProcess,
        spec: &GatewaySpec,
    ) -> Result<ManagedProcess, LifecycleError> {
        let deadline = Instant::now() + spec.startup_timeout;

        loop {
            let current = self.query(&process.id).await?;
            if current.status.is_terminal() {
                let detail = match self.logs_tail(&current.id).await {
                    Some(tail) => tail,
                    None => String::from("no output captured"),
                };
                return Err(LifecycleError::ExitedDuringStartup {
                    process_id: current.id,
                    status: current.status,
                    exit_code: current.exit_code,
                    detail,
                });
            }

            let ready = match spec.ready_port {
                Some(port) => matches!(
                    timeout(CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
                    Ok(Ok(_))
                ),
                None => current.status == ProcessStatus::Running,
            };
            if ready {
                info!("Process {} is ready", current.id);
                return Ok(current);
            }

            if Instant::now() >= deadline {
                return Err(LifecycleError::ReadinessTimeout {
                    process_id: current.id,
                    timeout_ms: spec.startup_timeout.as_millis() as u64,
                });
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn logs_tail(&self, process_id: &str) -> Option<String> {
        let logs = self
            .supervisor
            .run("get_logs", |handle, _| async move {
                handle.get_logs(process_id).await
            })
            .await
            .ok()?;
        let text = if logs.stderr.trim().is_empty() {
            logs.stdout
        } else {
            logs.stderr
        };
        let tail = diagnostic_tail(&text, 1024);
        (!tail.is_empty()).then_some(tail)
    }

    /// Re-query a finished process and judge its outcome.
    pub async fn evaluate_outcome(
        &self,
        process: &ManagedProcess,
        predicate: &dyn SuccessPredicate,
    ) -> Result<CommandOutcome, LifecycleError> {
        let current = self.query(&process.id).await?;
        let process_id = current.id.as_str();
        let logs = self
            .supervisor
            .run("get_logs", |handle, _| async move {
                handle.get_logs(process_id).await
            })
            .await?;
        Ok(CommandOutcome::evaluate(&current, logs, predicate))
    }

    /// Start a one-shot command, wait for it, and evaluate the result.
    pub async fn run_command(
        &self,
        options: &StartOptions,
        timeout: Duration,
        predicate: &dyn SuccessPredicate,
    ) -> Result<CommandOutcome, LifecycleError> {
        let process = self.start(options).await?;
        self.wait_for_process(&process, timeout, self.poll_interval)
            .await?;
        self.evaluate_outcome(&process, predicate).await
    }

    async fn signal(&self, process_id: &str, signal: ProcessSignal) -> Result<(), LifecycleError> {
        self.supervisor
            .run("signal_process", |handle, _| async move {
                handle.signal_process(process_id, signal).await
            })
            .await?;
        Ok(())
    }

    /// Ask a process to exit, escalating to SIGKILL after `grace`.
    #[instrument(skip(self, process), level = "debug", fields(process_id = %process.id))]
    pub async fn terminate(
        &self,
        process: &ManagedProcess,
        grace: Duration,
    ) -> Result<ProcessStatus, LifecycleError> {
        self.signal(&process.id, ProcessSignal::Terminate).await?;
        match self
            .wait_for_process(process, grace, self.poll_interval)
            .await
        {
            Ok(status) => Ok(status),
            Err(LifecycleError::WaitTimeout { .. }) => {
                warn!(
                    "Process {} ignored SIGTERM for {:?}, killing",
                    process.id, grace
                );
                self.signal(&process.id, ProcessSignal::Kill).await?;
                self.wait_for_process(process, KILL_WAIT, self.poll_interval)
                    .await
            }
            Err(e) => Err(e),
        }
    }
}
