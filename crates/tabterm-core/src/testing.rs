//! Test doubles: an in-memory execution service and a recording terminal view.

use crate::pipeline::TerminalView;
use crate::service::{ExecutionService, OutputStream, ServiceResult};
use crate::ServiceError;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabterm_types::{
    CreateProcessOptions, OutputChunk, ProcessEvent, ProcessInfo, ProcessStatus,
    ShellIntegrationEvent,
};
use tokio::sync::mpsc;
use uuid::Uuid;

/// A call received by [`FakeExecutionService`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceCall {
    Create {
        tab_id: Uuid,
        opts: CreateProcessOptions,
    },
    Get(Uuid),
    Kill(Uuid),
    Resize {
        process_id: Uuid,
        cols: u16,
        rows: u16,
    },
    Input {
        process_id: Uuid,
        data: Vec<u8>,
    },
    Subscribe(Uuid),
}

/// Ordered record of what views displayed and what the service received,
/// shared between a fake service and recording views.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    ViewWrite(Vec<u8>),
    Call(ServiceCall),
}

#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<JournalEntry>>>);

impl Journal {
    fn push(&self, entry: JournalEntry) {
        if let Ok(mut entries) = self.0.lock() {
            entries.push(entry);
        }
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.0.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

struct FakeProcess {
    info: ProcessInfo,
    sink: Option<mpsc::UnboundedSender<ProcessEvent>>,
    seq: u64,
    input: Vec<u8>,
}

#[derive(Default)]
struct FakeState {
    processes: HashMap<Uuid, FakeProcess>,
    reject_spawns: bool,
    fail_subscribe: bool,
    /// Calls to kill, resize and input that fail with a transport error.
    transport_failures: u32,
    create_delay: Option<Duration>,
    next_pid: u32,
}

impl FakeState {
    fn take_transport_failure(&mut self) -> ServiceResult<()> {
        if self.transport_failures > 0 {
            self.transport_failures -= 1;
            return Err(ServiceError::Transport("connection reset".into()));
        }
        Ok(())
    }
}

/// In-memory [`ExecutionService`]. Processes live until killed or marked
/// dead; output is pushed by the test through `emit_*`.
#[derive(Default)]
pub struct FakeExecutionService {
    state: Mutex<FakeState>,
    journal: Journal,
}

impl FakeExecutionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Journal shared with views built by [`RecordingView::with_journal`].
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: ServiceCall) {
        self.journal.push(JournalEntry::Call(call));
    }

    /// All calls received so far, in order.
    pub fn calls(&self) -> Vec<ServiceCall> {
        self.journal
            .entries()
            .into_iter()
            .filter_map(|entry| match entry {
                JournalEntry::Call(call) => Some(call),
                JournalEntry::ViewWrite(_) => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&ServiceCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn create_count(&self) -> usize {
        self.count(|c| matches!(c, ServiceCall::Create { .. }))
    }

    pub fn kill_count(&self) -> usize {
        self.count(|c| matches!(c, ServiceCall::Kill(_)))
    }

    pub fn set_reject_spawns(&self, reject: bool) {
        self.state().reject_spawns = reject;
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.state().fail_subscribe = fail;
    }

    /// Fail the next `count` kill, resize or input calls with a transport error.
    pub fn set_transport_failures(&self, count: u32) {
        self.state().transport_failures = count;
    }

    /// Make `create_process` take this long before answering.
    pub fn set_create_delay(&self, delay: Duration) {
        self.state().create_delay = Some(delay);
    }

    /// Processes the service still holds as running.
    pub fn running_ids(&self) -> Vec<Uuid> {
        self.state()
            .processes
            .values()
            .filter(|p| p.info.status == ProcessStatus::Running)
            .map(|p| p.info.id)
            .collect()
    }

    /// Seed a running process, as if it had survived an application restart.
    pub fn insert_running(&self, tab_id: Uuid, working_directory: PathBuf) -> ProcessInfo {
        let mut state = self.state();
        state.next_pid += 1;
        let info = ProcessInfo {
            id: Uuid::new_v4(),
            tab_id,
            pid: Some(10_000 + state.next_pid),
            command: "/bin/sh".into(),
            working_directory,
            status: ProcessStatus::Running,
            created_at: Utc::now(),
        };
        state.processes.insert(
            info.id,
            FakeProcess {
                info: info.clone(),
                sink: None,
                seq: 0,
                input: Vec::new(),
            },
        );
        info
    }

    /// The process terminates without the subscriber being told.
    pub fn mark_dead(&self, process_id: Uuid) {
        if let Some(process) = self.state().processes.get_mut(&process_id) {
            process.info.status = ProcessStatus::Stopped;
        }
    }

    /// The service forgets the process entirely.
    pub fn remove(&self, process_id: Uuid) {
        self.state().processes.remove(&process_id);
    }

    /// Push an output chunk to the current subscriber.
    pub fn emit_output(&self, process_id: Uuid, data: &[u8]) -> bool {
        let mut state = self.state();
        let Some(process) = state.processes.get_mut(&process_id) else {
            return false;
        };
        process.seq += 1;
        let event = ProcessEvent::Output(OutputChunk {
            process_id,
            seq: process.seq,
            data: data.to_vec(),
        });
        process
            .sink
            .as_ref()
            .is_some_and(|sink| sink.send(event).is_ok())
    }

    pub fn emit_integration(&self, process_id: Uuid, event: ShellIntegrationEvent) -> bool {
        let state = self.state();
        state
            .processes
            .get(&process_id)
            .and_then(|p| p.sink.as_ref())
            .is_some_and(|sink| sink.send(ProcessEvent::Integration(event)).is_ok())
    }

    /// The process exits and the subscriber is notified.
    pub fn emit_exit(&self, process_id: Uuid, exit_code: Option<i32>) {
        let mut state = self.state();
        if let Some(process) = state.processes.get_mut(&process_id) {
            process.info.status = ProcessStatus::Stopped;
            if let Some(sink) = &process.sink {
                let _ = sink.send(ProcessEvent::Exited {
                    process_id,
                    exit_code,
                });
            }
        }
    }

    /// Close the subscriber's stream while the process keeps running.
    pub fn drop_subscription(&self, process_id: Uuid) {
        if let Some(process) = self.state().processes.get_mut(&process_id) {
            process.sink = None;
        }
    }

    pub fn has_subscriber(&self, process_id: Uuid) -> bool {
        self.state()
            .processes
            .get(&process_id)
            .and_then(|p| p.sink.as_ref())
            .is_some_and(|sink| !sink.is_closed())
    }

    /// Bytes received by a process, concatenated.
    pub fn input(&self, process_id: Uuid) -> Vec<u8> {
        self.state()
            .processes
            .get(&process_id)
            .map(|p| p.input.clone())
            .unwrap_or_default()
    }

    pub fn process_ids(&self) -> Vec<Uuid> {
        self.state().processes.keys().copied().collect()
    }
}

#[async_trait]
impl ExecutionService for FakeExecutionService {
    async fn create_process(
        &self,
        tab_id: Uuid,
        opts: &CreateProcessOptions,
    ) -> ServiceResult<ProcessInfo> {
        self.record(ServiceCall::Create {
            tab_id,
            opts: opts.clone(),
        });
        let delay = self.state().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state().reject_spawns {
            return Err(ServiceError::Rejected(format!(
                "shell not found: {}",
                opts.shell
            )));
        }
        let mut info = self.insert_running(tab_id, opts.working_directory.clone());
        info.command = opts.shell.clone();
        if let Some(process) = self.state().processes.get_mut(&info.id) {
            process.info.command = opts.shell.clone();
        }
        Ok(info)
    }

    async fn get_process(&self, process_id: Uuid) -> ServiceResult<ProcessInfo> {
        self.record(ServiceCall::Get(process_id));
        self.state()
            .processes
            .get(&process_id)
            .map(|p| p.info.clone())
            .ok_or(ServiceError::NotFound)
    }

    async fn kill_process(&self, process_id: Uuid) -> ServiceResult<()> {
        self.record(ServiceCall::Kill(process_id));
        let mut state = self.state();
        state.take_transport_failure()?;
        match state.processes.remove(&process_id) {
            Some(_) => Ok(()),
            None => Err(ServiceError::NotFound),
        }
    }

    async fn resize(&self, process_id: Uuid, cols: u16, rows: u16) -> ServiceResult<()> {
        self.record(ServiceCall::Resize {
            process_id,
            cols,
            rows,
        });
        let mut state = self.state();
        state.take_transport_failure()?;
        match state.processes.get(&process_id) {
            Some(p) if p.info.status == ProcessStatus::Running => Ok(()),
            Some(_) => Err(ServiceError::Dead),
            None => Err(ServiceError::NotFound),
        }
    }

    async fn send_input(&self, process_id: Uuid, data: &[u8], _tab_id: Uuid) -> ServiceResult<()> {
        self.record(ServiceCall::Input {
            process_id,
            data: data.to_vec(),
        });
        let mut state = self.state();
        state.take_transport_failure()?;
        match state.processes.get_mut(&process_id) {
            Some(p) if p.info.status == ProcessStatus::Running => {
                p.input.extend_from_slice(data);
                Ok(())
            }
            Some(_) => Err(ServiceError::Dead),
            None => Err(ServiceError::NotFound),
        }
    }

    async fn subscribe_output(&self, process_id: Uuid) -> ServiceResult<OutputStream> {
        self.record(ServiceCall::Subscribe(process_id));
        let mut state = self.state();
        if state.fail_subscribe {
            return Err(ServiceError::Transport("subscription refused".into()));
        }
        let process = state
            .processes
            .get_mut(&process_id)
            .ok_or(ServiceError::NotFound)?;
        let (tx, stream) = OutputStream::channel();
        process.sink = Some(tx);
        Ok(stream)
    }
}

/// Terminal view that records every write.
#[derive(Debug, Clone, Default)]
pub struct RecordingView {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    journal: Option<Journal>,
}

impl RecordingView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            writes: Arc::default(),
            journal: Some(journal),
        }
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Everything written, decoded lossily.
    pub fn contents(&self) -> String {
        self.writes()
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }
}

impl TerminalView for RecordingView {
    fn write(&self, data: &[u8]) {
        if let Ok(mut writes) = self.writes.lock() {
            writes.push(data.to_vec());
        }
        if let Some(journal) = &self.journal {
            journal.push(JournalEntry::ViewWrite(data.to_vec()));
        }
    }
}

/// Poll `cond` until it holds, panicking after two seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 2s");
}
