//! In-memory fakes for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use keeper_core::{
    HandleProvider, ManagedProcess, ProbeOutcome, ProcessLogs, ProcessSignal, ProcessStatus,
    RemoteStore, SandboxError, SandboxHandle, StartOptions, StorageError,
};
use tokio::sync::{Notify, Semaphore};

// =============================================================================
// Sandbox
// =============================================================================

#[derive(Debug)]
struct FakeProcess {
    process: ManagedProcess,
    /// Statuses handed out by successive `get_process` calls
    script: VecDeque<(ProcessStatus, Option<i32>)>,
    logs: ProcessLogs,
}

#[derive(Debug, Default)]
struct FakeSandboxState {
    processes: Mutex<Vec<FakeProcess>>,
    start_script: Mutex<Vec<(ProcessStatus, Option<i32>)>>,
    start_logs: Mutex<ProcessLogs>,
    invalidate_next: AtomicU32,
    next_id: AtomicU64,
    list_calls: AtomicU32,
    start_calls: AtomicU32,
    get_calls: AtomicU32,
    signals: Mutex<Vec<(String, ProcessSignal)>>,
}

/// Scriptable sandbox shared by every handle a [`FakeProvider`] hands out.
#[derive(Debug, Clone, Default)]
pub struct FakeSandbox {
    state: Arc<FakeSandboxState>,
}

impl FakeSandbox {
    /// Register an existing process with a status script for `get_process`.
    pub fn add_process(
        &self,
        command: &str,
        status: ProcessStatus,
        script: Vec<(ProcessStatus, Option<i32>)>,
    ) -> ManagedProcess {
        let id = format!("proc-{}", self.state.next_id.fetch_add(1, Ordering::SeqCst));
        let process = ManagedProcess {
            id,
            command: command.to_string(),
            status,
            exit_code: None,
        };
        self.state.processes.lock().unwrap().push(FakeProcess {
            process: process.clone(),
            script: script.into(),
            logs: ProcessLogs::default(),
        });
        process
    }

    /// Status script and logs given to processes started from now on.
    pub fn on_start(&self, script: Vec<(ProcessStatus, Option<i32>)>, logs: ProcessLogs) {
        *self.state.start_script.lock().unwrap() = script;
        *self.state.start_logs.lock().unwrap() = logs;
    }

    /// Make the next `n` handle calls fail with an invalidation error.
    pub fn invalidate_next(&self, n: u32) {
        self.state.invalidate_next.store(n, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> u32 {
        self.state.list_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> u32 {
        self.state.start_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> u32 {
        self.state.get_calls.load(Ordering::SeqCst)
    }

    pub fn signals(&self) -> Vec<(String, ProcessSignal)> {
        self.state.signals.lock().unwrap().clone()
    }

    fn check_invalidated(&self) -> Result<(), SandboxError> {
        let pending = self.state.invalidate_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.state.invalidate_next.store(pending - 1, Ordering::SeqCst);
            return Err(SandboxError::Invalidated("session was reset".into()));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeHandle {
    id: String,
    sandbox: FakeSandbox,
}

#[async_trait]
impl SandboxHandle for FakeHandle {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_processes(&self) -> Result<Vec<ManagedProcess>, SandboxError> {
        self.sandbox.state.list_calls.fetch_add(1, Ordering::SeqCst);
        self.sandbox.check_invalidated()?;
        let processes = self.sandbox.state.processes.lock().unwrap();
        Ok(processes.iter().map(|p| p.process.clone()).collect())
    }

    async fn start_process(&self, options: &StartOptions) -> Result<ManagedProcess, SandboxError> {
        self.sandbox.state.start_calls.fetch_add(1, Ordering::SeqCst);
        self.sandbox.check_invalidated()?;
        let script = self.sandbox.state.start_script.lock().unwrap().clone();
        let logs = self.sandbox.state.start_logs.lock().unwrap().clone();
        let process = self
            .sandbox
            .add_process(&options.command_line(), ProcessStatus::Starting, script);
        let mut processes = self.sandbox.state.processes.lock().unwrap();
        if let Some(entry) = processes.iter_mut().find(|p| p.process.id == process.id) {
            entry.logs = logs;
        }
        Ok(process)
    }

    async fn get_process(&self, process_id: &str) -> Result<Option<ManagedProcess>, SandboxError> {
        self.sandbox.state.get_calls.fetch_add(1, Ordering::SeqCst);
        self.sandbox.check_invalidated()?;
        let mut processes = self.sandbox.state.processes.lock().unwrap();
        let Some(entry) = processes.iter_mut().find(|p| p.process.id == process_id) else {
            return Ok(None);
        };
        if !entry.process.status.is_terminal() {
            if let Some((status, exit_code)) = entry.script.pop_front() {
                entry.process.status = status;
                entry.process.exit_code = exit_code;
            }
        }
        Ok(Some(entry.process.clone()))
    }

    async fn get_logs(&self, process_id: &str) -> Result<ProcessLogs, SandboxError> {
        self.sandbox.check_invalidated()?;
        let processes = self.sandbox.state.processes.lock().unwrap();
        processes
            .iter()
            .find(|p| p.process.id == process_id)
            .map(|p| p.logs.clone())
            .ok_or_else(|| SandboxError::NotFound(process_id.to_string()))
    }

    async fn signal_process(
        &self,
        process_id: &str,
        signal: ProcessSignal,
    ) -> Result<(), SandboxError> {
        self.sandbox.check_invalidated()?;
        self.sandbox
            .state
            .signals
            .lock()
            .unwrap()
            .push((process_id.to_string(), signal));
        let mut processes = self.sandbox.state.processes.lock().unwrap();
        if let Some(entry) = processes.iter_mut().find(|p| p.process.id == process_id) {
            entry.process.status = ProcessStatus::Failed;
            entry.process.exit_code = None;
            entry.script.clear();
        }
        Ok(())
    }
}

/// Provider handing out fresh [`FakeHandle`]s over one [`FakeSandbox`].
#[derive(Debug)]
pub struct FakeProvider {
    sandbox: FakeSandbox,
    acquired: AtomicU64,
}

impl FakeProvider {
    pub fn new(sandbox: FakeSandbox) -> Self {
        Self {
            sandbox,
            acquired: AtomicU64::new(0),
        }
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HandleProvider for FakeProvider {
    async fn acquire(&self) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeHandle {
            id: format!("fake-{}", n),
            sandbox: self.sandbox.clone(),
        }))
    }
}

// =============================================================================
// Remote storage
// =============================================================================

/// Scriptable remote store recording every call it receives.
#[derive(Debug, Default)]
pub struct FakeRemote {
    probes: Mutex<HashMap<String, ProbeOutcome>>,
    contents: Mutex<HashMap<String, Vec<(String, String)>>>,
    failing_pulls: Mutex<HashSet<String>>,
    fail_push: AtomicBool,
    calls: Mutex<Vec<String>>,
    push_gate: Mutex<Option<Arc<Semaphore>>>,
    /// Notified whenever a push starts
    pub push_started: Notify,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `prefix` as existing with the given files (relative path, contents).
    pub fn with_prefix(self, prefix: &str, files: &[(&str, &str)]) -> Self {
        self.probes
            .lock()
            .unwrap()
            .insert(prefix.to_string(), ProbeOutcome::Exists);
        self.contents.lock().unwrap().insert(
            prefix.to_string(),
            files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
        );
        self
    }

    pub fn with_probe(self, prefix: &str, outcome: ProbeOutcome) -> Self {
        self.probes
            .lock()
            .unwrap()
            .insert(prefix.to_string(), outcome);
        self
    }

    pub fn with_failing_pull(self, prefix: &str) -> Self {
        self.failing_pulls.lock().unwrap().insert(prefix.to_string());
        self
    }

    pub fn set_fail_push(&self, fail: bool) {
        self.fail_push.store(fail, Ordering::SeqCst);
    }

    /// Block pushes until permits are added to the returned semaphore.
    pub fn gate_pushes(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.push_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn push_count(&self) -> usize {
        self.calls().iter().filter(|c| c.starts_with("push:")).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn probe(&self, prefix: &str) -> ProbeOutcome {
        self.record(format!("probe:{}", prefix));
        self.probes
            .lock()
            .unwrap()
            .get(prefix)
            .cloned()
            .unwrap_or(ProbeOutcome::Missing)
    }

    async fn pull(&self, prefix: &str, local_dir: &Path) -> Result<(), StorageError> {
        self.record(format!("pull:{}", prefix));
        if self.failing_pulls.lock().unwrap().contains(prefix) {
            return Err(StorageError::Remote(format!("copy of {} failed", prefix)));
        }
        let files = self
            .contents
            .lock()
            .unwrap()
            .get(prefix)
            .cloned()
            .unwrap_or_default();
        for (rel, contents) in files {
            let path = local_dir.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
            }
            std::fs::write(&path, contents).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        Ok(())
    }

    async fn push(
        &self,
        _local_dir: &Path,
        prefix: &str,
        _excludes: &[String],
    ) -> Result<(), StorageError> {
        self.record(format!("push:{}", prefix));
        self.push_started.notify_one();
        let gate = self.push_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| StorageError::Internal(e.to_string()))?;
            permit.forget();
        }
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(StorageError::Remote(format!(
                "upload of {} failed: 403 Forbidden",
                prefix
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Layout
// =============================================================================

/// Layout with every tracked tree under `root`.
pub fn layout_in(root: &Path) -> crate::sync::Layout {
    use crate::sync::{Layout, TrackedTree};
    Layout {
        config: TrackedTree::new(root.join("config"), "config"),
        config_file: "gateway.json".into(),
        legacy_prefix: "legacy".into(),
        legacy_config_file: "config.json".into(),
        workspace: TrackedTree::new(root.join("workspace"), "workspace"),
        extensions: TrackedTree::new(root.join("extensions"), "extensions"),
        excludes: vec![".git".into(), "node_modules".into()],
    }
}
