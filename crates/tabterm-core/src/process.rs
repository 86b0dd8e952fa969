//! Tab-to-process mapping and liveness tracking.

use crate::service::{ExecutionService, OutputStream};
use crate::{Result, ServiceError, TabtermError};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tabterm_types::{CreateProcessOptions, ProcessInfo, ProcessStatus};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts made to kill a process while the service reports transport errors.
const KILL_ATTEMPTS: u32 = 3;
const KILL_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Maps tabs to their external process and owns every call to the execution
/// service. Cached statuses are hints only: `probe` always asks the service.
pub struct ProcessRegistry {
    service: Arc<dyn ExecutionService>,
    by_tab: RwLock<HashMap<Uuid, ProcessInfo>>,
    /// Serializes `send_input` per process so keystrokes keep their order.
    input_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ProcessRegistry {
    pub fn new(service: Arc<dyn ExecutionService>) -> Self {
        Self {
            service,
            by_tab: RwLock::new(HashMap::new()),
            input_locks: DashMap::new(),
        }
    }

    /// Cached process record for a tab. May be stale.
    pub async fn get_by_tab_id(&self, tab_id: Uuid) -> Option<ProcessInfo> {
        self.by_tab.read().await.get(&tab_id).cloned()
    }

    /// Spawn a process for a tab. The new record replaces any previous one.
    pub async fn create(&self, tab_id: Uuid, opts: &CreateProcessOptions) -> Result<ProcessInfo> {
        let mut info = self
            .service
            .create_process(tab_id, opts)
            .await
            .map_err(|e| {
                warn!(target: "tabterm::process", "Spawn for tab {} failed: {}", tab_id, e);
                match e {
                    ServiceError::Rejected(msg) | ServiceError::Transport(msg) => {
                        TabtermError::SpawnError(msg)
                    }
                    other => TabtermError::SpawnError(other.to_string()),
                }
            })?;
        info.status = ProcessStatus::Running;

        info!(
            target: "tabterm::process",
            "Process {} created for tab {} in {:?}",
            info.id, tab_id, info.working_directory
        );
        self.by_tab.write().await.insert(tab_id, info.clone());
        Ok(info)
    }

    /// Kill a process. Idempotent: an already-dead or unknown process counts
    /// as killed. Transport failures are retried; if they persist the record
    /// keeps its status and the error is returned so the caller can retry.
    pub async fn kill(&self, process_id: Uuid) -> Result<()> {
        let mut delay = KILL_RETRY_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.service.kill_process(process_id).await {
                Ok(()) => {
                    info!(target: "tabterm::process", "Killed process {}", process_id);
                    break;
                }
                Err(ServiceError::NotFound) | Err(ServiceError::Dead) => {
                    debug!(target: "tabterm::process", "Process {} already gone", process_id);
                    break;
                }
                Err(ServiceError::Transport(msg)) if attempt < KILL_ATTEMPTS => {
                    warn!(
                        target: "tabterm::process",
                        "Kill of process {} failed (attempt {}/{}): {}",
                        process_id, attempt, KILL_ATTEMPTS, msg
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(target: "tabterm::process", "Kill of process {} failed: {}", process_id, e);
                    return Err(TabtermError::ServiceFailure(e.to_string()));
                }
            }
        }
        self.set_status(process_id, ProcessStatus::Stopped).await;
        self.input_locks.remove(&process_id);
        Ok(())
    }

    pub async fn resize(&self, process_id: Uuid, cols: u16, rows: u16) -> Result<()> {
        let result = self.service.resize(process_id, cols, rows).await;
        self.map_call(process_id, result).await
    }

    /// Forward input to a process. Calls for the same process never interleave.
    pub async fn send_input(&self, process_id: Uuid, data: &[u8], tab_id: Uuid) -> Result<()> {
        let lock = self
            .input_locks
            .entry(process_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        let result = self.service.send_input(process_id, data, tab_id).await;
        self.map_call(process_id, result).await
    }

    /// Ask the service whether a process is alive and refresh the cached record.
    pub async fn probe(&self, process_id: Uuid) -> ProcessStatus {
        let status = match self.service.get_process(process_id).await {
            Ok(info) => info.status,
            Err(ServiceError::NotFound) | Err(ServiceError::Dead) => ProcessStatus::Stopped,
            Err(e) => {
                warn!(target: "tabterm::process", "Probe of process {} failed: {}", process_id, e);
                ProcessStatus::Error
            }
        };
        debug!(target: "tabterm::process", "Probe of process {}: {:?}", process_id, status);
        self.set_status(process_id, status).await;
        status
    }

    /// Probe a process recovered from a persisted snapshot and, if it is still
    /// running, register it for the tab.
    pub async fn reattach(&self, tab_id: Uuid, process_id: Uuid) -> Option<ProcessInfo> {
        match self.service.get_process(process_id).await {
            Ok(info) if info.status == ProcessStatus::Running => {
                info!(
                    target: "tabterm::process",
                    "Reattached surviving process {} to tab {}",
                    process_id, tab_id
                );
                let info = ProcessInfo { tab_id, ..info };
                self.by_tab.write().await.insert(tab_id, info.clone());
                Some(info)
            }
            Ok(info) => {
                debug!(target: "tabterm::process", "Recorded process {} is {:?}", process_id, info.status);
                None
            }
            Err(e) => {
                debug!(target: "tabterm::process", "Recorded process {} not available: {}", process_id, e);
                None
            }
        }
    }

    /// Open the output stream of a process.
    pub async fn subscribe(&self, process_id: Uuid) -> Result<OutputStream> {
        match self.service.subscribe_output(process_id).await {
            Ok(stream) => Ok(stream),
            Err(ServiceError::NotFound) => {
                self.set_status(process_id, ProcessStatus::Stopped).await;
                Err(TabtermError::ProcessNotFound(process_id))
            }
            Err(ServiceError::Dead) => {
                self.set_status(process_id, ProcessStatus::Stopped).await;
                Err(TabtermError::ProcessDead(process_id))
            }
            Err(e) => Err(TabtermError::SubscriptionError(e.to_string())),
        }
    }

    pub async fn mark_stopped(&self, process_id: Uuid) {
        self.set_status(process_id, ProcessStatus::Stopped).await;
    }

    /// Drop the record for a tab, returning it.
    pub async fn forget(&self, tab_id: Uuid) -> Option<ProcessInfo> {
        let info = self.by_tab.write().await.remove(&tab_id)?;
        self.input_locks.remove(&info.id);
        Some(info)
    }

    async fn set_status(&self, process_id: Uuid, status: ProcessStatus) {
        let mut by_tab = self.by_tab.write().await;
        if let Some(info) = by_tab.values_mut().find(|info| info.id == process_id) {
            info.status = status;
        }
    }

    async fn map_call(
        &self,
        process_id: Uuid,
        result: std::result::Result<(), ServiceError>,
    ) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(ServiceError::NotFound) => {
                self.set_status(process_id, ProcessStatus::Stopped).await;
                Err(TabtermError::ProcessNotFound(process_id))
            }
            Err(ServiceError::Dead) => {
                self.set_status(process_id, ProcessStatus::Stopped).await;
                Err(TabtermError::ProcessDead(process_id))
            }
            // Says nothing about the process itself
            Err(e) => {
                warn!(target: "tabterm::process", "Call to process {} failed: {}", process_id, e);
                Err(TabtermError::ServiceFailure(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExecutionService, ServiceCall};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn opts() -> CreateProcessOptions {
        CreateProcessOptions {
            shell: "/bin/bash".into(),
            working_directory: PathBuf::from("/tmp"),
            environment: BTreeMap::new(),
            cols: 80,
            rows: 24,
        }
    }

    fn registry() -> (Arc<FakeExecutionService>, ProcessRegistry) {
        let fake = Arc::new(FakeExecutionService::new());
        let registry = ProcessRegistry::new(fake.clone());
        (fake, registry)
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let (_fake, registry) = registry();
        let tab = Uuid::new_v4();
        let info = registry.create(tab, &opts()).await.unwrap();
        assert_eq!(info.status, ProcessStatus::Running);
        assert_eq!(registry.get_by_tab_id(tab).await.unwrap().id, info.id);
        assert!(registry.get_by_tab_id(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_rejected_spawn_maps_to_spawn_error() {
        let (fake, registry) = registry();
        fake.set_reject_spawns(true);
        let err = registry.create(Uuid::new_v4(), &opts()).await.unwrap_err();
        assert!(matches!(err, TabtermError::SpawnError(_)));
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let (fake, registry) = registry();
        let tab = Uuid::new_v4();
        let info = registry.create(tab, &opts()).await.unwrap();

        registry.kill(info.id).await.unwrap();
        registry.kill(info.id).await.unwrap();
        assert_eq!(
            registry.get_by_tab_id(tab).await.unwrap().status,
            ProcessStatus::Stopped
        );
        assert_eq!(fake.count(|c| matches!(c, ServiceCall::Kill(_))), 2);
    }

    #[tokio::test]
    async fn test_input_to_dead_process() {
        let (fake, registry) = registry();
        let tab = Uuid::new_v4();
        let info = registry.create(tab, &opts()).await.unwrap();
        fake.mark_dead(info.id);

        let err = registry.send_input(info.id, b"ls\n", tab).await.unwrap_err();
        assert!(matches!(err, TabtermError::ProcessDead(_)));
        assert_eq!(
            registry.get_by_tab_id(tab).await.unwrap().status,
            ProcessStatus::Stopped
        );

        let err = registry
            .resize(Uuid::new_v4(), 80, 24)
            .await
            .unwrap_err();
        assert!(matches!(err, TabtermError::ProcessNotFound(_)));
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_process_running() {
        let (fake, registry) = registry();
        let tab = Uuid::new_v4();
        let info = registry.create(tab, &opts()).await.unwrap();
        fake.set_transport_failures(2);

        let err = registry.send_input(info.id, b"ls\n", tab).await.unwrap_err();
        assert!(matches!(err, TabtermError::ServiceFailure(_)));
        assert!(!err.is_stale_process());
        let err = registry.resize(info.id, 100, 30).await.unwrap_err();
        assert!(matches!(err, TabtermError::ServiceFailure(_)));
        assert_eq!(
            registry.get_by_tab_id(tab).await.unwrap().status,
            ProcessStatus::Running
        );

        registry.send_input(info.id, b"ls\n", tab).await.unwrap();
        assert_eq!(fake.input(info.id), b"ls\n");
    }

    #[tokio::test]
    async fn test_kill_retries_transport_errors() {
        let (fake, registry) = registry();
        let tab = Uuid::new_v4();
        let info = registry.create(tab, &opts()).await.unwrap();

        fake.set_transport_failures(KILL_ATTEMPTS - 1);
        registry.kill(info.id).await.unwrap();
        assert!(fake.running_ids().is_empty());
        assert_eq!(
            fake.count(|c| matches!(c, ServiceCall::Kill(_))),
            KILL_ATTEMPTS as usize
        );
    }

    #[tokio::test]
    async fn test_kill_gives_up_without_marking_stopped() {
        let (fake, registry) = registry();
        let tab = Uuid::new_v4();
        let info = registry.create(tab, &opts()).await.unwrap();

        fake.set_transport_failures(KILL_ATTEMPTS);
        let err = registry.kill(info.id).await.unwrap_err();
        assert!(matches!(err, TabtermError::ServiceFailure(_)));
        assert_eq!(
            registry.get_by_tab_id(tab).await.unwrap().status,
            ProcessStatus::Running
        );
        assert_eq!(fake.running_ids(), vec![info.id]);

        registry.kill(info.id).await.unwrap();
        assert!(fake.running_ids().is_empty());
    }

    #[tokio::test]
    async fn test_probe_never_trusts_cache() {
        let (fake, registry) = registry();
        let tab = Uuid::new_v4();
        let info = registry.create(tab, &opts()).await.unwrap();

        assert_eq!(registry.probe(info.id).await, ProcessStatus::Running);
        fake.remove(info.id);
        assert_eq!(registry.probe(info.id).await, ProcessStatus::Stopped);
        assert_eq!(
            registry.get_by_tab_id(tab).await.unwrap().status,
            ProcessStatus::Stopped
        );
        assert_eq!(fake.count(|c| matches!(c, ServiceCall::Get(_))), 2);
    }

    #[tokio::test]
    async fn test_reattach_surviving_process() {
        let (fake, registry) = registry();
        let tab = Uuid::new_v4();
        let survivor = fake.insert_running(tab, PathBuf::from("/srv"));

        let info = registry.reattach(tab, survivor.id).await.unwrap();
        assert_eq!(info.id, survivor.id);
        assert_eq!(registry.get_by_tab_id(tab).await.unwrap().id, survivor.id);

        fake.mark_dead(survivor.id);
        assert!(registry.reattach(tab, survivor.id).await.is_none());
        assert!(registry.reattach(tab, Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_input_order_is_preserved() {
        let (fake, registry) = registry();
        let tab = Uuid::new_v4();
        let info = registry.create(tab, &opts()).await.unwrap();
        let registry = Arc::new(registry);

        for ch in ["l", "s", " ", "-", "l", "\n"] {
            registry.send_input(info.id, ch.as_bytes(), tab).await.unwrap();
        }
        assert_eq!(fake.input(info.id), b"ls -l\n");
    }

    #[tokio::test]
    async fn test_forget() {
        let (_fake, registry) = registry();
        let tab = Uuid::new_v4();
        let info = registry.create(tab, &opts()).await.unwrap();
        assert_eq!(registry.forget(tab).await.unwrap().id, info.id);
        assert!(registry.forget(tab).await.is_none());
        assert!(registry.get_by_tab_id(tab).await.is_none());
    }
}
