//! Command history entries reconstructed from terminal output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where the framing of a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingSource {
    /// Shell integration events (`CommandStart` / `CommandEnd`).
    Authoritative,
    /// Prompt pattern matching on raw output.
    Heuristic,
}

/// How a command entry was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// The exit code was reported by the shell or the caller.
    Reported,
    /// A new prompt appeared; the exit code `0` is assumed, not observed.
    PromptDefault,
    /// Another command started while this one was still open.
    Superseded,
}

/// One command execution in a tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandHistoryEntry {
    pub id: Uuid,
    pub tab_id: Uuid,
    pub command: String,
    pub output: String,
    /// `None` while the command is running.
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    /// Set together with `exit_code`.
    pub duration_ms: Option<u64>,
    /// Started through the UI (quick command) rather than typed into the shell.
    pub intercepted: bool,
    pub source: FramingSource,
    pub completion: Option<Completion>,
}

impl CommandHistoryEntry {
    pub fn is_running(&self) -> bool {
        self.exit_code.is_none()
    }

    /// True when the exit code is a guess rather than an observation.
    pub fn exit_code_assumed(&self) -> bool {
        matches!(
            self.completion,
            Some(Completion::PromptDefault) | Some(Completion::Superseded)
        )
    }
}

/// Aggregated output classification counts for a tab.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCounts {
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
}
