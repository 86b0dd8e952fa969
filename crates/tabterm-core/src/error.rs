//! Error types for tabterm.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TabtermError {
    #[error("Tab not found: {0}")]
    TabNotFound(Uuid),

    #[error("Process spawn failed: {0}")]
    SpawnError(String),

    #[error("Process not found: {0}")]
    ProcessNotFound(Uuid),

    #[error("Process is no longer running: {0}")]
    ProcessDead(Uuid),

    #[error("Tab {0} is not connected to a process")]
    NotConnected(Uuid),

    #[error("Tab {0} cannot be closed")]
    NotClosable(Uuid),

    /// The execution service could not be reached or refused a call. The
    /// process may still be running.
    #[error("Execution service call failed: {0}")]
    ServiceFailure(String),

    #[error("Output subscription failed: {0}")]
    SubscriptionError(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl TabtermError {
    /// Errors that mean the process handle is stale and a re-probe is due.
    pub fn is_stale_process(&self) -> bool {
        matches!(
            self,
            TabtermError::ProcessNotFound(_) | TabtermError::ProcessDead(_)
        )
    }

    /// Errors that come from the session store.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            TabtermError::PersistenceError(_)
                | TabtermError::DatabaseError(_)
                | TabtermError::JsonError(_)
        )
    }
}

/// Errors reported by an execution service. Never leaves the core: the
/// process registry maps these onto [`TabtermError`] at each call site.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The service refused the request (bad shell path, bad cwd...).
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("process not found")]
    NotFound,

    /// The process terminated while the call was in flight.
    #[error("process terminated")]
    Dead,

    /// IPC / transport failure.
    #[error("transport: {0}")]
    Transport(String),
}
