//! Events and read-only views exposed to the presentation layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CommandHistoryEntry, OutputCounts, Tab, TabGroup, TabStatus};

/// Per-tab connection state machine.
///
/// `Unbound -> Probing -> {Reconnected, Spawning} -> Bound`, with `SpawnFailed`
/// as the failure state. `Bound` and `Reconnected` are equivalent success states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Unbound,
    Probing,
    Reconnected,
    Spawning,
    Bound,
    SpawnFailed,
}

impl ConnectionState {
    /// Output subscription is active and input is accepted.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Bound | ConnectionState::Reconnected)
    }

    /// A connection attempt is in flight.
    pub fn is_pending(self) -> bool {
        matches!(self, ConnectionState::Probing | ConnectionState::Spawning)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            // Any state can fall back to unbound (stream lost, process exited, tab closed).
            (_, Unbound) => true,
            (Unbound | Reconnected | Bound | SpawnFailed, Probing) => true,
            (Probing, Reconnected | Spawning) => true,
            (Spawning, Bound | SpawnFailed) => true,
            _ => false,
        }
    }
}

/// Events broadcast to presentation subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    TabCreated { tab: Tab },
    TabClosed { tab_id: Uuid },
    TabsReordered { group: TabGroup, order: Vec<Uuid> },
    TabRenamed { tab_id: Uuid, title: String },
    ActiveTabChanged { group: TabGroup, tab_id: Uuid },
    TabStatusChanged { tab_id: Uuid, status: TabStatus },
    ConnectionChanged { tab_id: Uuid, state: ConnectionState },
    CommandUpdated { entry: CommandHistoryEntry },
    HistoryCleared { tab_id: Uuid },
    CountsChanged { tab_id: Uuid, counts: OutputCounts },
    ProcessExited { tab_id: Uuid, process_id: Uuid, exit_code: Option<i32> },
    /// A connection attempt failed; `retryable` tells the UI to offer "retry connection".
    ConnectionError { tab_id: Uuid, message: String, retryable: bool },
}

/// One tab as seen in the overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabOverview {
    pub tab: Tab,
    pub connection: ConnectionState,
    pub process_id: Option<Uuid>,
    pub counts: OutputCounts,
    pub running_command: Option<String>,
}

/// Active tab of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTab {
    pub group: TabGroup,
    pub tab_id: Uuid,
}

/// Read-only snapshot of the whole tab registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOverview {
    /// In display order.
    pub tabs: Vec<TabOverview>,
    pub active: Vec<ActiveTab>,
}

impl SessionOverview {
    pub fn active_in(&self, group: &TabGroup) -> Option<Uuid> {
        self.active
            .iter()
            .find(|a| &a.group == group)
            .map(|a| a.tab_id)
    }
}
