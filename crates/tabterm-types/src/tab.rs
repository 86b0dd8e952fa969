//! Tab types and grouping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Owning resource of a tab. Tabs are partitioned into independent pools by group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TabGroup {
    /// Terminals not tied to any resource.
    #[default]
    Global,
    /// Terminals opened from a project.
    Project(String),
    /// Terminals owned by some other resource (cluster, SDK, task...).
    Resource(String),
}

impl fmt::Display for TabGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TabGroup::Global => write!(f, "global"),
            TabGroup::Project(id) => write!(f, "project:{}", id),
            TabGroup::Resource(id) => write!(f, "resource:{}", id),
        }
    }
}

/// What the tab hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabKind {
    #[default]
    Shell,
    /// A tab that runs a single task command (build, deploy...).
    Task,
    /// Remote shell (ssh, kubectl exec...).
    Remote,
}

/// Tab status as shown by the presentation layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabStatus {
    /// Connection in progress.
    #[default]
    Loading,
    /// Process attached and streaming.
    Active,
    /// The process could not be spawned; retry is available.
    Error,
    /// The output stream was lost (or the process exited); the tab stays open.
    Disconnected,
}

/// Parameters for creating a tab.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TabSpec {
    pub title: String,
    #[serde(default)]
    pub kind: TabKind,
    pub working_directory: PathBuf,
    /// Shell command line, e.g. `/bin/zsh` or `bash -l`.
    pub shell: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default = "default_closable")]
    pub closable: bool,
    #[serde(default)]
    pub group: TabGroup,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_closable() -> bool {
    true
}

/// A terminal tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tab {
    /// Stable across restarts.
    pub id: Uuid,
    pub title: String,
    pub kind: TabKind,
    pub working_directory: PathBuf,
    pub shell: String,
    pub icon: Option<String>,
    pub closable: bool,
    pub group: TabGroup,
    pub status: TabStatus,
    pub environment: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Tab {
    /// Build a new tab from a spec with a freshly generated id.
    pub fn from_spec(spec: TabSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: spec.title,
            kind: spec.kind,
            working_directory: spec.working_directory,
            shell: spec.shell,
            icon: spec.icon,
            closable: spec.closable,
            group: spec.group,
            status: TabStatus::Loading,
            environment: spec.environment,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_serde_shape() {
        let json = serde_json::to_string(&TabGroup::Project("p1".into())).unwrap();
        assert_eq!(json, r#"{"kind":"project","id":"p1"}"#);
        let global: TabGroup = serde_json::from_str(r#"{"kind":"global"}"#).unwrap();
        assert_eq!(global, TabGroup::Global);
    }

    #[test]
    fn test_spec_defaults() {
        let spec: TabSpec = serde_json::from_str(
            r#"{"title":"zsh","working_directory":"/tmp","shell":"/bin/zsh"}"#,
        )
        .unwrap();
        assert!(spec.closable);
        assert_eq!(spec.group, TabGroup::Global);
        assert_eq!(spec.kind, TabKind::Shell);
    }
}
