//! Execution service backed by local pseudo-terminals.

use crate::service::{ExecutionService, OutputStream, ServiceResult};
use crate::ServiceError;
use async_trait::async_trait;
use chrono::Utc;
use portable_pty::{native_pty_system, Child as PtyChild, CommandBuilder, MasterPty, PtySize};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabterm_types::{
    CreateProcessOptions, OutputChunk, ProcessEvent, ProcessInfo, ProcessStatus,
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Events kept for a process that has no subscriber yet.
const MAX_BACKLOG: usize = 256;

/// How long a hung-up shell gets to exit before the process group is killed.
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(1);

/// Where the reader thread delivers events. Replaced on every subscribe.
#[derive(Default)]
struct SinkSlot {
    tx: Option<mpsc::UnboundedSender<ProcessEvent>>,
    backlog: VecDeque<ProcessEvent>,
    /// Set once the process exited; holds its exit code if known.
    exit: Option<Option<i32>>,
}

impl SinkSlot {
    fn deliver(&mut self, event: ProcessEvent) {
        if let Some(tx) = &self.tx {
            match tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => {
                    // Subscriber went away; keep the event for the next one
                    self.tx = None;
                    self.push_backlog(event);
                }
            }
        } else {
            self.push_backlog(event);
        }
    }

    fn push_backlog(&mut self, event: ProcessEvent) {
        if self.backlog.len() >= MAX_BACKLOG {
            self.backlog.pop_front();
        }
        self.backlog.push_back(event);
    }
}

struct PtyProcess {
    info: ProcessInfo,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    child: Arc<Mutex<Box<dyn PtyChild + Send + Sync>>>,
    sink: Arc<Mutex<SinkSlot>>,
    /// Signal to stop the reader thread
    shutdown: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<()>,
}

impl PtyProcess {
    fn has_exited(&self) -> bool {
        self.sink.lock().map(|slot| slot.exit.is_some()).unwrap_or(true)
    }
}

/// Spawns shells in local PTYs.
pub struct PtyExecutionService {
    processes: Arc<RwLock<HashMap<Uuid, PtyProcess>>>,
}

impl PtyExecutionService {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Shell used when a tab does not name one.
    pub fn default_shell() -> String {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

impl Default for PtyExecutionService {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_err<T>(_: std::sync::PoisonError<T>) -> ServiceError {
    ServiceError::Transport("pty lock poisoned".to_string())
}

fn spawn_reader(
    process_id: Uuid,
    mut reader: Box<dyn Read + Send>,
    child: Arc<Mutex<Box<dyn PtyChild + Send + Sync>>>,
    sink: Arc<Mutex<SinkSlot>>,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    // PTY reading is blocking
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut seq = 0u64;
        debug!(target: "tabterm::process", "PTY reader thread started for process {}", process_id);

        loop {
            if shutdown.load(Ordering::SeqCst) {
                debug!(target: "tabterm::process", "PTY reader for process {} received shutdown signal", process_id);
                break;
            }

            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!(target: "tabterm::process", "PTY reader got EOF for process {}", process_id);
                    break;
                }
                Ok(n) => {
                    seq += 1;
                    trace!(target: "tabterm::process", "PTY output for {} ({} bytes, seq {})", process_id, n, seq);
                    let event = ProcessEvent::Output(OutputChunk {
                        process_id,
                        seq,
                        data: buf[..n].to_vec(),
                    });
                    match sink.lock() {
                        Ok(mut slot) => slot.deliver(event),
                        Err(_) => break,
                    }
                }
                Err(e) => {
                    // Expected when the master is closed during kill
                    if !shutdown.load(Ordering::SeqCst) {
                        error!(target: "tabterm::process", "PTY read error for process {}: {}", process_id, e);
                    }
                    break;
                }
            }
        }

        let exit_code = child
            .lock()
            .ok()
            .and_then(|mut c| c.wait().ok())
            .map(|status| status.exit_code() as i32);
        info!(target: "tabterm::process", "Process {} exited with code {:?}", process_id, exit_code);

        if let Ok(mut slot) = sink.lock() {
            slot.exit = Some(exit_code);
            slot.deliver(ProcessEvent::Exited {
                process_id,
                exit_code,
            });
        }
    })
}

#[async_trait]
impl ExecutionService for PtyExecutionService {
    async fn create_process(
        &self,
        tab_id: Uuid,
        opts: &CreateProcessOptions,
    ) -> ServiceResult<ProcessInfo> {
        if !opts.working_directory.is_dir() {
            error!(target: "tabterm::process", "Working directory does not exist: {:?}", opts.working_directory);
            return Err(ServiceError::Rejected(format!(
                "working directory does not exist: {}",
                opts.working_directory.display()
            )));
        }

        let shell = if opts.shell.is_empty() {
            Self::default_shell()
        } else {
            opts.shell.clone()
        };

        info!(
            target: "tabterm::process",
            "Spawning {} for tab {} in {:?} ({}x{})",
            shell, tab_id, opts.working_directory, opts.cols, opts.rows
        );

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: opts.rows,
                cols: opts.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&shell);
        cmd.cwd(&opts.working_directory);
        cmd.env("TERM", "xterm-256color");
        cmd.env("TABTERM_TAB_ID", tab_id.to_string());
        for (key, value) in &opts.environment {
            cmd.env(key, value);
        }

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!(target: "tabterm::process", "Failed to spawn {}: {}", shell, e);
            ServiceError::Rejected(format!("failed to spawn {}: {}", shell, e))
        })?;
        // The child holds its own copy of the slave side
        drop(pair.slave);

        let pid = child.process_id();
        let child: Arc<Mutex<Box<dyn PtyChild + Send + Sync>>> = Arc::new(Mutex::new(child));

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let process_id = Uuid::new_v4();
        let sink = Arc::new(Mutex::new(SinkSlot::default()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_reader(
            process_id,
            reader,
            child.clone(),
            sink.clone(),
            shutdown.clone(),
        );

        let info = ProcessInfo {
            id: process_id,
            tab_id,
            pid,
            command: shell,
            working_directory: opts.working_directory.clone(),
            status: ProcessStatus::Running,
            created_at: Utc::now(),
        };

        self.processes.write().await.insert(
            process_id,
            PtyProcess {
                info: info.clone(),
                writer: Arc::new(Mutex::new(writer)),
                master: Arc::new(Mutex::new(pair.master)),
                child,
                sink,
                shutdown,
                handle,
            },
        );

        info!(target: "tabterm::process", "Process {} (pid {:?}) spawned for tab {}", process_id, pid, tab_id);
        Ok(info)
    }

    async fn get_process(&self, process_id: Uuid) -> ServiceResult<ProcessInfo> {
        let processes = self.processes.read().await;
        let process = processes.get(&process_id).ok_or(ServiceError::NotFound)?;
        let mut info = process.info.clone();
        if process.has_exited() {
            info.status = ProcessStatus::Stopped;
        }
        Ok(info)
    }

    /// Hang up the shell, give it a moment, then kill the whole process group.
    async fn kill_process(&self, process_id: Uuid) -> ServiceResult<()> {
        let process = self
            .processes
            .write()
            .await
            .remove(&process_id)
            .ok_or(ServiceError::NotFound)?;

        info!(target: "tabterm::process", "Terminating process {}", process_id);
        let pid = process.info.pid;

        #[cfg(unix)]
        if let Some(pid) = pid {
            unsafe {
                // Negative PID signals the entire process group
                libc::kill(-(pid as i32), libc::SIGHUP);
            }
        }

        let start = std::time::Instant::now();
        let mut exited_gracefully = false;
        while start.elapsed() < GRACEFUL_TIMEOUT {
            if process.handle.is_finished() {
                exited_gracefully = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        #[cfg(unix)]
        if !exited_gracefully {
            if let Some(pid) = pid {
                info!(target: "tabterm::process", "Sending SIGKILL to process group {} for process {}", pid, process_id);
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
        }

        #[cfg(not(unix))]
        if !exited_gracefully {
            if let Ok(mut c) = process.child.lock() {
                let _ = c.kill();
            }
        }

        // Closing the master unblocks the reader thread
        process.shutdown.store(true, Ordering::SeqCst);
        let PtyProcess {
            writer,
            master,
            child,
            handle,
            ..
        } = process;
        drop(writer);
        drop(master);

        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => {
                debug!(target: "tabterm::process", "Reader thread joined for process {}", process_id);
            }
            Ok(Err(e)) => {
                warn!(target: "tabterm::process", "Reader thread panicked for process {}: {:?}", process_id, e);
            }
            Err(e) => {
                warn!(target: "tabterm::process", "Failed to join reader thread for process {}: {:?}", process_id, e);
            }
        }

        // Reap the zombie
        if let Ok(mut c) = child.lock() {
            let _ = c.try_wait();
        }

        info!(target: "tabterm::process", "Process {} terminated", process_id);
        Ok(())
    }

    async fn resize(&self, process_id: Uuid, cols: u16, rows: u16) -> ServiceResult<()> {
        let processes = self.processes.read().await;
        let process = processes.get(&process_id).ok_or(ServiceError::NotFound)?;
        if process.has_exited() {
            return Err(ServiceError::Dead);
        }
        debug!(target: "tabterm::process", "Resizing PTY for process {} to {}x{}", process_id, cols, rows);
        let master = process.master.lock().map_err(lock_err)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ServiceError::Transport(e.to_string()))
    }

    async fn send_input(&self, process_id: Uuid, data: &[u8], tab_id: Uuid) -> ServiceResult<()> {
        let processes = self.processes.read().await;
        let process = processes.get(&process_id).ok_or(ServiceError::NotFound)?;
        if process.has_exited() {
            return Err(ServiceError::Dead);
        }
        trace!(target: "tabterm::process", "Input for process {} from tab {} ({} bytes)", process_id, tab_id, data.len());
        let mut writer = process.writer.lock().map_err(lock_err)?;
        let result = writer.write_all(data).and_then(|_| writer.flush());
        result.map_err(|e| {
            if process.has_exited() {
                ServiceError::Dead
            } else {
                ServiceError::Transport(e.to_string())
            }
        })
    }

    async fn subscribe_output(&self, process_id: Uuid) -> ServiceResult<OutputStream> {
        let processes = self.processes.read().await;
        let process = processes.get(&process_id).ok_or(ServiceError::NotFound)?;
        let (tx, stream) = OutputStream::channel();

        let mut slot = process.sink.lock().map_err(lock_err)?;
        for event in slot.backlog.drain(..) {
            let _ = tx.send(event);
        }
        if slot.tx.replace(tx).is_some() {
            debug!(target: "tabterm::process", "Replaced output subscriber for process {}", process_id);
        }
        Ok(stream)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn opts(shell: &str, dir: &std::path::Path) -> CreateProcessOptions {
        CreateProcessOptions {
            shell: shell.to_string(),
            working_directory: dir.to_path_buf(),
            environment: BTreeMap::new(),
            cols: 80,
            rows: 24,
        }
    }

    #[tokio::test]
    async fn test_missing_shell_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = PtyExecutionService::new();
        let err = service
            .create_process(Uuid::new_v4(), &opts("/nonexistent/shell", dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_missing_working_directory_is_rejected() {
        let service = PtyExecutionService::new();
        let err = service
            .create_process(
                Uuid::new_v4(),
                &opts("/bin/sh", std::path::Path::new("/nonexistent/dir")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_unknown_process() {
        let service = PtyExecutionService::new();
        let id = Uuid::new_v4();
        assert_eq!(service.get_process(id).await.unwrap_err(), ServiceError::NotFound);
        assert_eq!(service.kill_process(id).await.unwrap_err(), ServiceError::NotFound);
        assert_eq!(
            service.send_input(id, b"ls\n", Uuid::new_v4()).await.unwrap_err(),
            ServiceError::NotFound
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shell_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let service = PtyExecutionService::new();
        let tab_id = Uuid::new_v4();
        let info = service
            .create_process(tab_id, &opts("/bin/sh", dir.path()))
            .await
            .unwrap();
        assert_eq!(info.status, ProcessStatus::Running);
        assert_eq!(info.tab_id, tab_id);

        let mut stream = service.subscribe_output(info.id).await.unwrap();
        service
            .send_input(info.id, b"echo tabterm-marker\n", tab_id)
            .await
            .unwrap();

        let mut seen = String::new();
        let mut last_seq = 0;
        let found = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = stream.recv().await {
                if let ProcessEvent::Output(chunk) = event {
                    assert!(chunk.seq > last_seq);
                    last_seq = chunk.seq;
                    seen.push_str(&String::from_utf8_lossy(&chunk.data));
                    // The echoed input plus the command output
                    if seen.matches("tabterm-marker").count() >= 2 {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(found, "output was: {seen:?}");

        service.kill_process(info.id).await.unwrap();
        assert_eq!(
            service.get_process(info.id).await.unwrap_err(),
            ServiceError::NotFound
        );
    }
}
