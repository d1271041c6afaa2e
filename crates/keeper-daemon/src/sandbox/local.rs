use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use keeper_core::{
    HandleProvider, ManagedProcess, ProcessLogs, ProcessSignal, ProcessStatus, SandboxHandle,
    StartOptions,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::error::SandboxError;

/// Captured output kept per stream; older output is dropped first.
const MAX_LOG_BYTES: usize = 256 * 1024;

#[derive(Debug)]
struct ProcessState {
    status: ProcessStatus,
    exit_code: Option<i32>,
    pid: Option<u32>,
}

#[derive(Debug)]
struct ProcessEntry {
    id: String,
    command: String,
    state: Mutex<ProcessState>,
    logs: Mutex<ProcessLogs>,
}

impl ProcessEntry {
    fn snapshot(&self) -> ManagedProcess {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        ManagedProcess {
            id: self.id.clone(),
            command: self.command.clone(),
            status: state.status,
            exit_code: state.exit_code,
        }
    }

    fn set_state(&self, status: ProcessStatus, exit_code: Option<i32>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // Terminal states are sticky
        if state.status.is_terminal() {
            return;
        }
        state.status = status;
        state.exit_code = exit_code;
    }

    fn append_log(&self, stderr: bool, line: &str) {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        let buf = if stderr { &mut logs.stderr } else { &mut logs.stdout };
        buf.push_str(line);
        buf.push('\n');
        if buf.len() > MAX_LOG_BYTES {
            let mut cut = buf.len() - MAX_LOG_BYTES;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            buf.drain(..cut);
        }
    }
}

#[derive(Debug)]
struct LocalSession {
    id: String,
    generation: AtomicU64,
    processes: DashMap<String, Arc<ProcessEntry>>,
}

/// Sandbox provider backed by local child processes.
///
/// Every handle is stamped with the session generation. [`LocalSandbox::reset`]
/// bumps the generation, which makes every outstanding handle fail with
/// [`SandboxError::Invalidated`] while the processes themselves keep running
/// and stay visible to freshly acquired handles.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    session: Arc<LocalSession>,
}

impl Default for LocalSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSandbox {
    /// Create a new LocalSandbox with an empty process table.
    pub fn new() -> Self {
        Self {
            session: Arc::new(LocalSession {
                id: uuid::Uuid::new_v4().to_string(),
                generation: AtomicU64::new(0),
                processes: DashMap::new(),
            }),
        }
    }

    /// Revoke every outstanding handle.
    #[cfg(test)]
    pub fn reset(&self) {
        let generation = self.session.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "Sandbox session {} reset (generation {})",
            self.session.id, generation
        );
    }
}

#[async_trait]
impl HandleProvider for LocalSandbox {
    async fn acquire(&self) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let generation = self.session.generation.load(Ordering::SeqCst);
        Ok(Arc::new(LocalHandle {
            id: format!("{}/{}", self.session.id, generation),
            generation,
            session: self.session.clone(),
        }))
    }
}

/// Handle onto a [`LocalSandbox`] session at a fixed generation.
#[derive(Debug)]
pub struct LocalHandle {
    id: String,
    generation: u64,
    session: Arc<LocalSession>,
}

impl LocalHandle {
    fn check_live(&self) -> Result<(), SandboxError> {
        if self.session.generation.load(Ordering::SeqCst) != self.generation {
            return Err(SandboxError::Invalidated(format!(
                "handle {} is stale: sandbox session was reset",
                self.id
            )));
        }
        Ok(())
    }

    fn entry(&self, process_id: &str) -> Option<Arc<ProcessEntry>> {
        self.session
            .processes
            .get(process_id)
            .map(|e| e.value().clone())
    }
}

fn spawn_log_reader<R>(entry: Arc<ProcessEntry>, reader: R, stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            entry.append_log(stderr, &line);
        }
    });
}

#[async_trait]
impl SandboxHandle for LocalHandle {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_processes(&self) -> Result<Vec<ManagedProcess>, SandboxError> {
        self.check_live()?;
        Ok(self
            .session
            .processes
            .iter()
            .map(|e| e.value().snapshot())
            .collect())
    }

    #[instrument(skip(self, options), level = "debug", fields(program = %options.program))]
    async fn start_process(&self, options: &StartOptions) -> Result<ManagedProcess, SandboxError> {
        self.check_live()?;

        let id = uuid::Uuid::new_v4().to_string();
        let entry = Arc::new(ProcessEntry {
            id: id.clone(),
            command: options.command_line(),
            state: Mutex::new(ProcessState {
                status: ProcessStatus::Starting,
                exit_code: None,
                pid: None,
            }),
            logs: Mutex::new(ProcessLogs::default()),
        });
        self.session.processes.insert(id.clone(), entry.clone());

        let mut cmd = Command::new(&options.program);
        cmd.args(&options.args)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                entry.set_state(ProcessStatus::Error, None);
                return Err(SandboxError::Spawn(format!(
                    "{}: {}",
                    options.command_line(),
                    e
                )));
            }
        };

        if let Some(stdout) = child.stdout.take() {
            spawn_log_reader(entry.clone(), stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_reader(entry.clone(), stderr, true);
        }

        {
            let mut state = entry.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pid = child.id();
            state.status = ProcessStatus::Running;
        }
        info!(
            "Started process {} (pid {:?}): {}",
            id,
            child.id(),
            entry.command
        );

        let waiter = entry.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    waiter.set_state(ProcessStatus::Completed, status.code());
                }
                Ok(status) => {
                    waiter.set_state(ProcessStatus::Failed, status.code());
                }
                Err(e) => {
                    warn!("Failed to wait for process {}: {}", waiter.id, e);
                    waiter.set_state(ProcessStatus::Error, None);
                }
            }
            debug!("Process {} exited: {:?}", waiter.id, waiter.snapshot().status);
        });

        Ok(entry.snapshot())
    }

    async fn get_process(&self, process_id: &str) -> Result<Option<ManagedProcess>, SandboxError> {
        self.check_live()?;
        Ok(self.entry(process_id).map(|e| e.snapshot()))
    }

    async fn get_logs(&self, process_id: &str) -> Result<ProcessLogs, SandboxError> {
        self.check_live()?;
        let entry = self
            .entry(process_id)
            .ok_or_else(|| SandboxError::NotFound(process_id.to_string()))?;
        let logs = entry.logs.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(logs)
    }

    #[instrument(skip(self), level = "debug")]
    async fn signal_process(
        &self,
        process_id: &str,
        signal: ProcessSignal,
    ) -> Result<(), SandboxError> {
        self.check_live()?;
        let entry = self
            .entry(process_id)
            .ok_or_else(|| SandboxError::NotFound(process_id.to_string()))?;

        let pid = {
            let state = entry.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.status.is_terminal() {
                debug!("Process {} already exited, not signalling", process_id);
                return Ok(());
            }
            state.pid
        };
        let Some(pid) = pid else {
            return Err(SandboxError::Backend(format!(
                "process {} has no pid",
                process_id
            )));
        };

        deliver_signal(pid, signal)
            .map_err(|e| SandboxError::Io(format!("Failed to signal pid {}: {}", pid, e)))
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn deliver_signal(pid: u32, signal: ProcessSignal) -> std::io::Result<()> {
    let sig = match signal {
        ProcessSignal::Terminate => libc::SIGTERM,
        ProcessSignal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill is a well-defined syscall; pid comes from a child we spawned
    let rc = unsafe { libc::kill(pid as i32, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn deliver_signal(pid: u32, _signal: ProcessSignal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("signals are not supported on this platform (pid {})", pid),
    ))
}
