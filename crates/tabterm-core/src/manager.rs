//! Session manager: the presentation layer's single entry point. Owns the tab
//! registry and wires tabs to processes, output pipelines and persistence.

use crate::correlator::CommandCorrelator;
use crate::output_parser::{OutputClassification, DEFAULT_CLASSIFIER_CEILING};
use crate::pipeline::{
    OutputPump, PumpEnd, PumpEndFn, ResubscribePolicy, TabPipeline, TerminalView, ViewHandle,
};
use crate::process::ProcessRegistry;
use crate::reconnect::{ConnectionStates, ProbeOutcome, Reconnector};
use crate::scheduler::{FlushFn, FlushScheduler, FlushTiming};
use crate::service::{ExecutionService, OutputStream};
use crate::store::{SessionStore, StoredTab, DEFAULT_SCROLLBACK_CAP};
use crate::tabs::TabRegistry;
use crate::{Result, TabtermError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tabterm_types::{
    ActiveTab, CommandHistoryEntry, ConnectionState, FramingSource, OutputCounts, ProcessStatus,
    SessionEvent, SessionOverview, Tab, TabGroup, TabOverview, TabSpec, TabStatus,
};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Configuration for the session manager.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub db_path: PathBuf,
    /// Scrollback lines kept in memory and persisted per tab.
    pub scrollback_cap: usize,
    pub flush_interval: Duration,
    pub flush_debounce: Duration,
    /// Bytes of recent output kept for error/warning classification.
    pub classifier_ceiling: usize,
    pub resubscribe_attempts: u32,
    pub resubscribe_backoff: Duration,
    /// (cols, rows) used until a view reports its size.
    pub default_size: (u16, u16),
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        let timing = FlushTiming::default();
        let policy = ResubscribePolicy::default();
        Self {
            db_path: dirs::data_local_dir()
                .unwrap_or_default()
                .join("tabterm")
                .join("sessions.db"),
            scrollback_cap: DEFAULT_SCROLLBACK_CAP,
            flush_interval: timing.interval,
            flush_debounce: timing.debounce,
            classifier_ceiling: DEFAULT_CLASSIFIER_CEILING,
            resubscribe_attempts: policy.attempts,
            resubscribe_backoff: policy.backoff,
            default_size: (80, 24),
        }
    }
}

impl SessionManagerConfig {
    fn flush_timing(&self) -> FlushTiming {
        FlushTiming {
            interval: self.flush_interval,
            debounce: self.flush_debounce,
        }
    }

    fn resubscribe_policy(&self) -> ResubscribePolicy {
        ResubscribePolicy {
            attempts: self.resubscribe_attempts,
            backoff: self.resubscribe_backoff,
        }
    }
}

/// Live state of one tab.
struct TabRuntime {
    pipeline: Arc<TabPipeline>,
    pump: Mutex<Option<OutputPump>>,
    scheduler: Mutex<Option<FlushScheduler>>,
    /// One connection attempt at a time per tab.
    connect_lock: tokio::sync::Mutex<()>,
}

impl TabRuntime {
    fn pump_process(&self) -> Option<Uuid> {
        self.pump
            .lock()
            .ok()
            .and_then(|p| p.as_ref().map(|pump| pump.process_id()))
    }

    fn pump_alive_for(&self, process_id: Uuid) -> bool {
        self.pump
            .lock()
            .map(|p| {
                p.as_ref()
                    .is_some_and(|pump| pump.process_id() == process_id && !pump.is_finished())
            })
            .unwrap_or(false)
    }

    /// Install a pump, aborting the previous one.
    fn set_pump(&self, pump: OutputPump) {
        if let Ok(mut slot) = self.pump.lock() {
            *slot = Some(pump);
        }
    }

    fn stop_pump(&self) {
        if let Ok(mut slot) = self.pump.lock() {
            slot.take();
        }
    }

    fn take_scheduler(&self) -> Option<FlushScheduler> {
        self.scheduler.lock().ok().and_then(|mut s| s.take())
    }
}

struct Inner {
    config: SessionManagerConfig,
    store: Arc<SessionStore>,
    registry: Arc<ProcessRegistry>,
    correlator: Arc<CommandCorrelator>,
    tabs: RwLock<TabRegistry>,
    runtimes: RwLock<HashMap<Uuid, Arc<TabRuntime>>>,
    connections: ConnectionStates,
    events: broadcast::Sender<SessionEvent>,
}

/// Orchestrates terminal tabs and the processes behind them.
///
/// Processes belong to tabs: only `close_tab` kills a live one, and a respawn
/// releases the dead one it replaces. Views come and go
/// freely through `mount` and the returned [`ViewHandle`].
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a session manager backed by the SQLite store at `config.db_path`.
    pub fn new(config: SessionManagerConfig, service: Arc<dyn ExecutionService>) -> Result<Self> {
        let store = Arc::new(SessionStore::open(&config.db_path, config.scrollback_cap)?);
        Ok(Self::with_store(config, service, store))
    }

    /// Create a session manager over an already opened store.
    pub fn with_store(
        config: SessionManagerConfig,
        service: Arc<dyn ExecutionService>,
        store: Arc<SessionStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                registry: Arc::new(ProcessRegistry::new(service)),
                correlator: Arc::new(CommandCorrelator::new()),
                tabs: RwLock::new(TabRegistry::new()),
                runtimes: RwLock::new(HashMap::new()),
                connections: ConnectionStates::new(events.clone()),
                events,
            }),
        }
    }

    /// Restore the persisted tab list. Nothing is connected until a tab is
    /// activated or mounted.
    pub async fn init(&self) -> Result<()> {
        let stored = self.inner.store.list_tabs()?;
        let mut restored = 0;
        for StoredTab { tab, active } in stored {
            if self.inner.tabs.read().await.contains(tab.id) {
                continue;
            }
            let tab_id = tab.id;
            self.inner.add_runtime(&tab).await;
            let mut tabs = self.inner.tabs.write().await;
            tabs.insert(tab);
            if active {
                tabs.set_active(tab_id);
            }
            restored += 1;
        }
        info!(target: "tabterm::session", "Restored {} tabs", restored);
        Ok(())
    }

    /// Flush every tab and stop all pumps. Processes keep running so the next
    /// start can reattach to them.
    pub async fn shutdown(&self) {
        let runtimes: Vec<Arc<TabRuntime>> = self
            .inner
            .runtimes
            .write()
            .await
            .drain()
            .map(|(_, rt)| rt)
            .collect();
        for rt in &runtimes {
            rt.stop_pump();
            if let Some(scheduler) = rt.take_scheduler() {
                scheduler.shutdown().await;
            }
        }
        self.inner.persist_tabs().await;
        info!(target: "tabterm::session", "Session manager stopped ({} tabs flushed)", runtimes.len());
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Create a tab. It is not activated and has no process yet.
    pub async fn create_tab(&self, spec: TabSpec) -> Result<Uuid> {
        let tab = Tab::from_spec(spec);
        let tab_id = tab.id;
        self.inner.add_runtime(&tab).await;
        self.inner.tabs.write().await.insert(tab.clone());
        self.inner.persist_tabs().await;

        info!(
            target: "tabterm::session",
            "Created tab {} '{}' in group {}",
            tab_id, tab.title, tab.group
        );
        let _ = self.inner.events.send(SessionEvent::TabCreated { tab });
        Ok(tab_id)
    }

    /// Close a tab: stop its output, kill its process, drop its history and
    /// snapshot. Closing an unknown or already closed tab does nothing.
    ///
    /// Waits for an in-flight connect so a process it spawns is killed too. If
    /// the kill fails the process record is kept and a repeated close retries it.
    pub async fn close_tab(&self, tab_id: Uuid) -> Result<()> {
        let removed = {
            let mut tabs = self.inner.tabs.write().await;
            if let Some(tab) = tabs.get(tab_id) {
                if !tab.closable {
                    return Err(TabtermError::NotClosable(tab_id));
                }
            }
            tabs.remove(tab_id)
        };
        let runtime = self.inner.runtimes.write().await.remove(&tab_id);

        let guard = match &runtime {
            Some(rt) => Some(rt.connect_lock.lock().await),
            None => None,
        };
        if let Some(rt) = &runtime {
            rt.stop_pump();
            if let Some(scheduler) = rt.take_scheduler() {
                scheduler.discard().await;
            }
        }

        let killed = match self.inner.registry.get_by_tab_id(tab_id).await {
            Some(info) => match self.inner.registry.kill(info.id).await {
                Ok(()) => {
                    self.inner.registry.forget(tab_id).await;
                    Ok(())
                }
                Err(e) => {
                    error!(
                        target: "tabterm::session",
                        "Could not kill process {} of closed tab {}: {}",
                        info.id, tab_id, e
                    );
                    Err(e)
                }
            },
            None => Ok(()),
        };
        self.inner.correlator.remove_tab(tab_id);
        self.inner.connections.remove(tab_id);
        if let Err(e) = self.inner.store.delete(tab_id) {
            warn!(target: "tabterm::store", "Failed to delete snapshot for tab {}: {}", tab_id, e);
        }
        drop(guard);

        let Some(removed) = removed else {
            debug!(target: "tabterm::session", "Tab {} already closed", tab_id);
            return killed;
        };

        self.inner.persist_tabs().await;
        info!(target: "tabterm::session", "Closed tab {}", tab_id);
        let _ = self.inner.events.send(SessionEvent::TabClosed { tab_id });

        if let Some(promoted) = removed.promoted {
            let _ = self.inner.events.send(SessionEvent::ActiveTabChanged {
                group: removed.tab.group.clone(),
                tab_id: promoted,
            });
            self.inner.connect_if_idle(promoted).await;
        }
        killed
    }

    /// Make a tab the active one of its group and connect it if needed.
    /// Unknown ids are ignored.
    pub async fn set_active_tab(&self, tab_id: Uuid) -> Result<()> {
        let Some(group) = self.inner.tabs.write().await.set_active(tab_id) else {
            debug!(target: "tabterm::session", "Ignoring activation of unknown tab {}", tab_id);
            return Ok(());
        };
        self.inner.persist_tabs().await;
        let _ = self
            .inner
            .events
            .send(SessionEvent::ActiveTabChanged { group, tab_id });
        self.inner.connect_if_idle(tab_id).await;
        Ok(())
    }

    /// Move a tab within its group. Out-of-range indices return `false`.
    pub async fn reorder_tabs(&self, group: &TabGroup, from: usize, to: usize) -> bool {
        let order = {
            let mut tabs = self.inner.tabs.write().await;
            if !tabs.reorder(group, from, to) {
                return false;
            }
            tabs.list(group).into_iter().map(|t| t.id).collect()
        };
        self.inner.persist_tabs().await;
        let _ = self.inner.events.send(SessionEvent::TabsReordered {
            group: group.clone(),
            order,
        });
        true
    }

    pub async fn rename_tab(&self, tab_id: Uuid, title: &str) -> Result<()> {
        if !self.inner.tabs.write().await.rename(tab_id, title) {
            return Err(TabtermError::TabNotFound(tab_id));
        }
        self.inner.persist_tabs().await;
        let _ = self.inner.events.send(SessionEvent::TabRenamed {
            tab_id,
            title: title.to_string(),
        });
        Ok(())
    }

    /// Tabs of a group in display order.
    pub async fn tabs(&self, group: &TabGroup) -> Vec<Tab> {
        self.inner.tabs.read().await.list(group)
    }

    /// Every tab in display order.
    pub async fn all_tabs(&self) -> Vec<Tab> {
        self.inner.tabs.read().await.all().to_vec()
    }

    pub async fn tab(&self, tab_id: Uuid) -> Option<Tab> {
        self.inner.tabs.read().await.get(tab_id).cloned()
    }

    pub async fn groups(&self) -> Vec<TabGroup> {
        self.inner.tabs.read().await.groups()
    }

    pub async fn active_tab(&self, group: &TabGroup) -> Option<Uuid> {
        self.inner.tabs.read().await.active(group)
    }

    /// Attach a view to a tab and run the reconnection protocol. The handle
    /// keeps the view attached; connection failures are reported through the
    /// tab status and events, not as an error here.
    pub async fn mount(
        &self,
        tab_id: Uuid,
        view: Arc<dyn TerminalView>,
        size: (u16, u16),
    ) -> Result<ViewHandle> {
        let rt = self
            .inner
            .runtime(tab_id)
            .await
            .ok_or(TabtermError::TabNotFound(tab_id))?;
        rt.pipeline.set_size(size);
        let handle = rt.pipeline.attach(view);

        if let Err(e) = self.inner.connect(tab_id).await {
            debug!(target: "tabterm::session", "Mount of tab {} left it unconnected: {}", tab_id, e);
        }
        Ok(handle)
    }

    /// Run the reconnection protocol for a tab.
    pub async fn connect(&self, tab_id: Uuid) -> Result<ConnectionState> {
        self.inner.connect(tab_id).await
    }

    /// Retry after a failed spawn or a lost connection.
    pub async fn retry_connection(&self, tab_id: Uuid) -> Result<ConnectionState> {
        let state = self.inner.connections.get(tab_id);
        if state.is_connected() || state.is_pending() {
            return Ok(state);
        }
        info!(target: "tabterm::session", "Retrying connection for tab {}", tab_id);
        self.inner.connect(tab_id).await
    }

    pub fn connection_state(&self, tab_id: Uuid) -> ConnectionState {
        self.inner.connections.get(tab_id)
    }

    /// Forward user input to the tab's process.
    pub async fn send_input(&self, tab_id: Uuid, data: &[u8]) -> Result<()> {
        self.inner.send_input(tab_id, data).await
    }

    pub async fn resize(&self, tab_id: Uuid, cols: u16, rows: u16) -> Result<()> {
        let rt = self
            .inner
            .runtime(tab_id)
            .await
            .ok_or(TabtermError::TabNotFound(tab_id))?;
        rt.pipeline.set_size((cols, rows));
        if !self.inner.connections.get(tab_id).is_connected() {
            return Ok(());
        }
        let Some(info) = self.inner.registry.get_by_tab_id(tab_id).await else {
            return Ok(());
        };
        match self.inner.registry.resize(info.id, cols, rows).await {
            Err(e) if e.is_stale_process() => {
                self.inner.mark_disconnected(tab_id, info.id).await;
                Err(e)
            }
            other => other,
        }
    }

    /// Run a command on behalf of the user: track it as an intercepted entry,
    /// then type it into the shell.
    pub async fn execute_quick_command(&self, tab_id: Uuid, text: &str) -> Result<()> {
        self.inner.ensure_connected(tab_id).await?;
        let command = text.trim();
        let changed = self
            .inner
            .correlator
            .start_command(tab_id, command, FramingSource::Heuristic, true);
        for entry in changed {
            let _ = self.inner.events.send(SessionEvent::CommandUpdated { entry });
        }
        debug!(target: "tabterm::session", "Quick command for tab {}: {}", tab_id, command);
        self.inner
            .send_input(tab_id, format!("{}\n", command).as_bytes())
            .await
    }

    pub fn history(&self, tab_id: Uuid) -> Vec<CommandHistoryEntry> {
        self.inner.correlator.history(tab_id)
    }

    pub async fn clear_history(&self, tab_id: Uuid) -> Result<()> {
        if !self.inner.tabs.read().await.contains(tab_id) {
            return Err(TabtermError::TabNotFound(tab_id));
        }
        self.inner.correlator.clear_history(tab_id);
        let _ = self.inner.events.send(SessionEvent::HistoryCleared { tab_id });
        Ok(())
    }

    pub async fn output_counts(&self, tab_id: Uuid) -> Option<OutputCounts> {
        Some(self.inner.runtime(tab_id).await?.pipeline.counts())
    }

    /// Counts plus the most recent error and warning lines.
    pub async fn output_classification(&self, tab_id: Uuid) -> Option<OutputClassification> {
        Some(self.inner.runtime(tab_id).await?.pipeline.classification())
    }

    /// Read-only view of every tab, its connection and its counts.
    pub async fn overview(&self) -> SessionOverview {
        let (tabs, active) = {
            let registry = self.inner.tabs.read().await;
            let active: Vec<ActiveTab> = registry
                .active_tabs()
                .into_iter()
                .map(|(group, tab_id)| ActiveTab { group, tab_id })
                .collect();
            (registry.all().to_vec(), active)
        };

        let mut overview = Vec::with_capacity(tabs.len());
        for tab in tabs {
            let tab_id = tab.id;
            let process_id = self
                .inner
                .registry
                .get_by_tab_id(tab_id)
                .await
                .filter(|p| p.status == ProcessStatus::Running)
                .map(|p| p.id);
            let counts = match self.inner.runtime(tab_id).await {
                Some(rt) => rt.pipeline.counts(),
                None => OutputCounts::default(),
            };
            overview.push(TabOverview {
                tab,
                connection: self.inner.connections.get(tab_id),
                process_id,
                counts,
                running_command: self.inner.correlator.running(tab_id).map(|e| e.command),
            });
        }

        SessionOverview {
            tabs: overview,
            active,
        }
    }
}

impl Inner {
    async fn runtime(&self, tab_id: Uuid) -> Option<Arc<TabRuntime>> {
        self.runtimes.read().await.get(&tab_id).cloned()
    }

    async fn add_runtime(self: &Arc<Self>, tab: &Tab) {
        let pipeline = Arc::new(TabPipeline::new(
            tab.id,
            tab.working_directory.clone(),
            self.config.default_size,
            self.config.scrollback_cap,
            self.config.classifier_ceiling,
            self.correlator.clone(),
            self.events.clone(),
        ));
        let scheduler = FlushScheduler::spawn(
            tab.id,
            self.config.flush_timing(),
            flush_fn(Arc::downgrade(self), Arc::downgrade(&pipeline)),
        );
        pipeline.set_flush_handle(scheduler.handle());

        let rt = Arc::new(TabRuntime {
            pipeline,
            pump: Mutex::new(None),
            scheduler: Mutex::new(Some(scheduler)),
            connect_lock: tokio::sync::Mutex::new(()),
        });
        self.runtimes.write().await.insert(tab.id, rt);
    }

    /// Write the tab list (order and active flags) to the store.
    async fn persist_tabs(&self) {
        let stored: Vec<StoredTab> = {
            let tabs = self.tabs.read().await;
            tabs.all()
                .iter()
                .map(|tab| StoredTab {
                    tab: tab.clone(),
                    active: tabs.is_active(tab.id),
                })
                .collect()
        };
        if let Err(e) = self.store.replace_tabs(&stored) {
            warn!(target: "tabterm::store", "Failed to persist tab list: {}", e);
        }
    }

    async fn save_snapshot(&self, pipeline: &TabPipeline) {
        if !pipeline.is_touched() {
            return;
        }
        let tab_id = pipeline.tab_id();
        let environment = self
            .tabs
            .read()
            .await
            .get(tab_id)
            .map(|t| t.environment.clone())
            .unwrap_or_default();
        let process_id = self
            .registry
            .get_by_tab_id(tab_id)
            .await
            .filter(|p| p.status == ProcessStatus::Running)
            .map(|p| p.id);

        let snapshot = pipeline.snapshot(process_id, environment);
        match self.store.save(&snapshot) {
            Ok(()) => trace!(target: "tabterm::store", "Snapshot saved for tab {}", tab_id),
            Err(e) => {
                warn!(target: "tabterm::store", "Failed to save snapshot for tab {}: {}", tab_id, e)
            }
        }
    }

    async fn set_status(&self, tab_id: Uuid, status: TabStatus) {
        if self.tabs.write().await.set_status(tab_id, status) {
            let _ = self
                .events
                .send(SessionEvent::TabStatusChanged { tab_id, status });
        }
    }

    async fn connect_if_idle(self: &Arc<Self>, tab_id: Uuid) {
        let state = self.connections.get(tab_id);
        if state.is_connected() || state.is_pending() {
            return;
        }
        if let Err(e) = self.connect(tab_id).await {
            debug!(target: "tabterm::session", "Connecting tab {} failed: {}", tab_id, e);
        }
    }

    /// Reconnection protocol: probe for a live process, reattach to it, or
    /// spawn a new one and replay the saved scrollback.
    async fn connect(self: &Arc<Self>, tab_id: Uuid) -> Result<ConnectionState> {
        let rt = self
            .runtime(tab_id)
            .await
            .ok_or(TabtermError::TabNotFound(tab_id))?;
        let _guard = rt.connect_lock.lock().await;
        let tab = self
            .tabs
            .read()
            .await
            .get(tab_id)
            .cloned()
            .ok_or(TabtermError::TabNotFound(tab_id))?;

        self.connections.transition(tab_id, ConnectionState::Probing);
        self.set_status(tab_id, TabStatus::Loading).await;

        let reconnector = Reconnector::new(&self.registry, &self.store);
        let snapshot = reconnector.load_snapshot(tab_id);

        match reconnector.probe(tab_id, snapshot.as_ref()).await {
            ProbeOutcome::Alive(info) => {
                if !rt.pump_alive_for(info.id) {
                    let stream = match self.registry.subscribe(info.id).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(target: "tabterm::session", "Subscribe to process {} failed: {}", info.id, e);
                            self.connections.transition(tab_id, ConnectionState::Unbound);
                            self.set_status(tab_id, TabStatus::Disconnected).await;
                            self.report_error(tab_id, &e);
                            return Err(e);
                        }
                    };
                    if let Some(snapshot) = &snapshot {
                        rt.pipeline.seed(&snapshot.scrollback);
                    }
                    self.start_pump(&rt, tab_id, info.id, stream);
                }

                let (cols, rows) = rt.pipeline.size();
                if let Err(e) = self.registry.resize(info.id, cols, rows).await {
                    debug!(target: "tabterm::session", "Resize after reconnect failed: {}", e);
                }

                self.connections
                    .transition(tab_id, ConnectionState::Reconnected);
                self.set_status(tab_id, TabStatus::Active).await;
                info!(target: "tabterm::session", "Tab {} reconnected to process {}", tab_id, info.id);
                Ok(ConnectionState::Reconnected)
            }
            ProbeOutcome::Dead => {
                rt.stop_pump();
                // Release the replaced record; its process may still be running
                if let Some(old) = self.registry.get_by_tab_id(tab_id).await {
                    if let Err(e) = self.registry.kill(old.id).await {
                        return Err(self.spawn_failed(tab_id, e).await);
                    }
                    self.registry.forget(tab_id).await;
                }
                self.connections.transition(tab_id, ConnectionState::Spawning);

                let info = match reconnector
                    .spawn(&tab, snapshot.as_ref(), rt.pipeline.size())
                    .await
                {
                    Ok(info) => info,
                    Err(e) => return Err(self.spawn_failed(tab_id, e).await),
                };
                rt.pipeline
                    .set_working_directory(info.working_directory.clone());

                let stream = match self.registry.subscribe(info.id).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        self.registry.kill(info.id).await?;
                        return Err(self.spawn_failed(tab_id, e).await);
                    }
                };

                // Restore the screen before any live output reaches the views
                let lines = if rt.pipeline.is_touched() {
                    rt.pipeline.scrollback_lines()
                } else {
                    snapshot.map(|s| s.scrollback).unwrap_or_default()
                };
                if !lines.is_empty() {
                    rt.pipeline.replay(&lines);
                }
                self.start_pump(&rt, tab_id, info.id, stream);

                self.connections.transition(tab_id, ConnectionState::Bound);
                self.set_status(tab_id, TabStatus::Active).await;
                info!(target: "tabterm::session", "Tab {} bound to new process {}", tab_id, info.id);
                Ok(ConnectionState::Bound)
            }
        }
    }

    async fn spawn_failed(&self, tab_id: Uuid, e: TabtermError) -> TabtermError {
        error!(target: "tabterm::session", "Could not start a process for tab {}: {}", tab_id, e);
        self.connections
            .transition(tab_id, ConnectionState::SpawnFailed);
        self.set_status(tab_id, TabStatus::Error).await;
        self.report_error(tab_id, &e);
        e
    }

    fn report_error(&self, tab_id: Uuid, e: &TabtermError) {
        let _ = self.events.send(SessionEvent::ConnectionError {
            tab_id,
            message: e.to_string(),
            retryable: true,
        });
    }

    fn start_pump(
        self: &Arc<Self>,
        rt: &TabRuntime,
        tab_id: Uuid,
        process_id: Uuid,
        stream: OutputStream,
    ) {
        let weak = Arc::downgrade(self);
        let on_end: PumpEndFn = Box::new(move |end| {
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_pump_end(tab_id, end).await;
                }
            })
        });
        rt.set_pump(OutputPump::spawn(
            rt.pipeline.clone(),
            self.registry.clone(),
            process_id,
            stream,
            self.config.resubscribe_policy(),
            on_end,
        ));
    }

    async fn handle_pump_end(&self, tab_id: Uuid, end: PumpEnd) {
        let Some(rt) = self.runtime(tab_id).await else {
            return;
        };
        let _guard = rt.connect_lock.lock().await;
        let process_id = match &end {
            PumpEnd::Exited { process_id, .. } | PumpEnd::Disconnected { process_id, .. } => {
                *process_id
            }
        };
        // A newer connection already replaced this pump
        if rt.pump_process() != Some(process_id) {
            return;
        }

        match end {
            PumpEnd::Exited { exit_code, .. } => {
                let _ = self.events.send(SessionEvent::ProcessExited {
                    tab_id,
                    process_id,
                    exit_code,
                });
            }
            PumpEnd::Disconnected { reason, .. } => {
                warn!(target: "tabterm::session", "Tab {} lost its output stream: {}", tab_id, reason);
                self.report_error(
                    tab_id,
                    &TabtermError::SubscriptionError(reason),
                );
            }
        }
        self.connections.transition(tab_id, ConnectionState::Unbound);
        self.set_status(tab_id, TabStatus::Disconnected).await;
        self.save_snapshot(&rt.pipeline).await;
    }

    async fn ensure_connected(&self, tab_id: Uuid) -> Result<Uuid> {
        if !self.tabs.read().await.contains(tab_id) {
            return Err(TabtermError::TabNotFound(tab_id));
        }
        if !self.connections.get(tab_id).is_connected() {
            return Err(TabtermError::NotConnected(tab_id));
        }
        self.registry
            .get_by_tab_id(tab_id)
            .await
            .map(|info| info.id)
            .ok_or(TabtermError::NotConnected(tab_id))
    }

    async fn send_input(&self, tab_id: Uuid, data: &[u8]) -> Result<()> {
        let process_id = self.ensure_connected(tab_id).await?;
        match self.registry.send_input(process_id, data, tab_id).await {
            Err(e) if e.is_stale_process() => {
                self.mark_disconnected(tab_id, process_id).await;
                Err(e)
            }
            other => other,
        }
    }

    /// The process behind a connected tab turned out to be gone.
    async fn mark_disconnected(&self, tab_id: Uuid, process_id: Uuid) {
        warn!(target: "tabterm::session", "Process {} for tab {} is gone", process_id, tab_id);
        if let Some(rt) = self.runtime(tab_id).await {
            rt.stop_pump();
        }
        self.connections.transition(tab_id, ConnectionState::Unbound);
        self.set_status(tab_id, TabStatus::Disconnected).await;
    }
}

fn flush_fn(inner: Weak<Inner>, pipeline: Weak<TabPipeline>) -> FlushFn {
    Arc::new(move || {
        let inner = inner.clone();
        let pipeline = pipeline.clone();
        Box::pin(async move {
            if let (Some(inner), Some(pipeline)) = (inner.upgrade(), pipeline.upgrade()) {
                inner.save_snapshot(&pipeline).await;
            }
        })
    })
}
