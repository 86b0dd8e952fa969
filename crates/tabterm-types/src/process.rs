//! Process records and the events an execution service pushes back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle status of an external process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Stopped,
    Error,
}

/// A process as known to the execution service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub id: Uuid,
    pub tab_id: Uuid,
    /// OS pid, when the service exposes it.
    pub pid: Option<u32>,
    pub command: String,
    pub working_directory: PathBuf,
    pub status: ProcessStatus,
    pub created_at: DateTime<Utc>,
}

/// Options for creating a process behind a tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateProcessOptions {
    pub shell: String,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// A piece of process output. Sequence numbers are per process and monotonic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub process_id: Uuid,
    pub seq: u64,
    pub data: Vec<u8>,
}

/// Shell-emitted command markers. Authoritative when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShellIntegrationEvent {
    CommandStart {
        id: Uuid,
        command: String,
        working_directory: Option<PathBuf>,
        timestamp: DateTime<Utc>,
    },
    CommandOutput {
        process_id: Uuid,
        content: String,
    },
    CommandEnd {
        id: Uuid,
        exit_code: i32,
        /// Duration measured by the shell, if it reports one.
        duration_ms: Option<u64>,
    },
}

/// Events pushed by an execution service for one subscribed process.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Output(OutputChunk),
    Integration(ShellIntegrationEvent),
    Exited {
        process_id: Uuid,
        exit_code: Option<i32>,
    },
}
