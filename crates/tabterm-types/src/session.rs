//! Persisted terminal session snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Point-in-time capture of a tab's terminal state, used to restore it after restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub tab_id: Uuid,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Oldest line first.
    pub scrollback: Vec<String>,
    /// (col, row)
    pub cursor: (u16, u16),
    /// (cols, rows)
    pub size: (u16, u16),
    pub last_activity: DateTime<Utc>,
    /// Process that was attached when the snapshot was taken.
    pub process_id: Option<Uuid>,
}

impl SessionSnapshot {
    /// Empty snapshot for a tab.
    pub fn empty(tab_id: Uuid, working_directory: PathBuf, size: (u16, u16)) -> Self {
        Self {
            tab_id,
            working_directory,
            environment: BTreeMap::new(),
            scrollback: Vec::new(),
            cursor: (0, 0),
            size,
            last_activity: Utc::now(),
            process_id: None,
        }
    }
}
