//! Reconnection protocol: decide whether a tab reattaches to a surviving
//! process or spawns a new one, and track each tab's connection state.

use crate::process::ProcessRegistry;
use crate::store::SessionStore;
use crate::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use tabterm_types::{
    ConnectionState, CreateProcessOptions, ProcessInfo, ProcessStatus, SessionEvent,
    SessionSnapshot, Tab,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Connection state per tab. Every accepted transition is broadcast.
pub struct ConnectionStates {
    states: Mutex<HashMap<Uuid, ConnectionState>>,
    events: broadcast::Sender<SessionEvent>,
}

impl ConnectionStates {
    pub fn new(events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn get(&self, tab_id: Uuid) -> ConnectionState {
        self.states
            .lock()
            .map(|s| s.get(&tab_id).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Move a tab to `next`. Transitions the state machine does not allow are
    /// refused and logged.
    pub fn transition(&self, tab_id: Uuid, next: ConnectionState) -> bool {
        let Ok(mut states) = self.states.lock() else {
            return false;
        };
        let current = states.get(&tab_id).copied().unwrap_or_default();
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!(
                target: "tabterm::session",
                "Refused connection transition {:?} -> {:?} for tab {}",
                current, next, tab_id
            );
            return false;
        }
        states.insert(tab_id, next);
        drop(states);

        debug!(target: "tabterm::session", "Tab {} connection {:?} -> {:?}", tab_id, current, next);
        let _ = self.events.send(SessionEvent::ConnectionChanged {
            tab_id,
            state: next,
        });
        true
    }

    pub fn remove(&self, tab_id: Uuid) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(&tab_id);
        }
    }
}

/// Outcome of the probing step.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// A live process is attached to the tab.
    Alive(ProcessInfo),
    /// No live process; a new one must be spawned.
    Dead,
}

/// The probe/spawn steps of the protocol. State transitions are driven by
/// the session manager.
pub struct Reconnector<'a> {
    registry: &'a ProcessRegistry,
    store: &'a SessionStore,
}

impl<'a> Reconnector<'a> {
    pub fn new(registry: &'a ProcessRegistry, store: &'a SessionStore) -> Self {
        Self { registry, store }
    }

    /// Load the tab's snapshot. A failed load counts as no snapshot.
    pub fn load_snapshot(&self, tab_id: Uuid) -> Option<SessionSnapshot> {
        match self.store.load(tab_id) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(target: "tabterm::store", "Failed to load snapshot for tab {}: {}", tab_id, e);
                None
            }
        }
    }

    /// Find the tab's candidate process and ask the service about it, exactly
    /// once. The registry entry wins over the process recorded in the snapshot.
    pub async fn probe(&self, tab_id: Uuid, snapshot: Option<&SessionSnapshot>) -> ProbeOutcome {
        if let Some(info) = self.registry.get_by_tab_id(tab_id).await {
            return match self.registry.probe(info.id).await {
                ProcessStatus::Running => ProbeOutcome::Alive(ProcessInfo {
                    status: ProcessStatus::Running,
                    ..info
                }),
                status => {
                    debug!(target: "tabterm::session", "Process {} for tab {} is {:?}", info.id, tab_id, status);
                    ProbeOutcome::Dead
                }
            };
        }

        match snapshot.and_then(|s| s.process_id) {
            Some(process_id) => match self.registry.reattach(tab_id, process_id).await {
                Some(info) => ProbeOutcome::Alive(info),
                None => ProbeOutcome::Dead,
            },
            None => ProbeOutcome::Dead,
        }
    }

    /// Spawn a new process for the tab. The snapshot's working directory wins
    /// over the tab's so a restored shell starts where it left off.
    pub async fn spawn(
        &self,
        tab: &Tab,
        snapshot: Option<&SessionSnapshot>,
        size: (u16, u16),
    ) -> Result<ProcessInfo> {
        let working_directory = snapshot
            .map(|s| s.working_directory.clone())
            .unwrap_or_else(|| tab.working_directory.clone());
        let mut environment = tab.environment.clone();
        if let Some(snapshot) = snapshot {
            for (key, value) in &snapshot.environment {
                environment.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        let opts = CreateProcessOptions {
            shell: tab.shell.clone(),
            working_directory,
            environment,
            cols: size.0,
            rows: size.1,
        };
        self.registry.create(tab.id, &opts).await
    }
}
