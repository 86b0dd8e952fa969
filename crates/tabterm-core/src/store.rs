//! SQLite persistence for session snapshots and the tab list.

use crate::{Result, TabtermError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tabterm_types::{SessionSnapshot, Tab, TabStatus};
use tracing::debug;
use uuid::Uuid;

/// Default number of scrollback lines kept per snapshot.
pub const DEFAULT_SCROLLBACK_CAP: usize = 1000;

/// A persisted tab plus whether it was the active tab of its group.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTab {
    pub tab: Tab,
    pub active: bool,
}

/// SQLite-based session store.
///
/// Snapshots are keyed by tab id and outlive both the tab and its process.
/// Writes are last-write-wins.
pub struct SessionStore {
    conn: Mutex<Connection>,
    scrollback_cap: usize,
}

impl SessionStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path, scrollback_cap: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::with_connection(conn, scrollback_cap)
    }

    /// In-memory store, used by tests and ephemeral sessions.
    pub fn open_in_memory(scrollback_cap: usize) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, scrollback_cap)
    }

    fn with_connection(conn: Connection, scrollback_cap: usize) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            scrollback_cap: scrollback_cap.max(1),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn scrollback_cap(&self) -> usize {
        self.scrollback_cap
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TabtermError::PersistenceError("store connection poisoned".into()))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                tab_id TEXT PRIMARY KEY,
                working_directory TEXT NOT NULL,
                environment TEXT NOT NULL DEFAULT '{}',
                scrollback TEXT NOT NULL DEFAULT '[]',
                cursor_col INTEGER NOT NULL DEFAULT 0,
                cursor_row INTEGER NOT NULL DEFAULT 0,
                cols INTEGER NOT NULL,
                rows INTEGER NOT NULL,
                last_activity TEXT NOT NULL,
                process_id TEXT
            );

            CREATE TABLE IF NOT EXISTS tabs (
                id TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                data TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_tabs_position ON tabs(position);
            "#,
        )?;
        Ok(())
    }

    /// Write a snapshot, superseding any previous one for the same tab.
    /// Scrollback is truncated to the most recent `scrollback_cap` lines.
    pub fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let skip = snapshot.scrollback.len().saturating_sub(self.scrollback_cap);
        let scrollback = serde_json::to_string(&snapshot.scrollback[skip..])?;
        let environment = serde_json::to_string(&snapshot.environment)?;

        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO snapshots (
                tab_id, working_directory, environment, scrollback,
                cursor_col, cursor_row, cols, rows, last_activity, process_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(tab_id) DO UPDATE SET
                working_directory = excluded.working_directory,
                environment = excluded.environment,
                scrollback = excluded.scrollback,
                cursor_col = excluded.cursor_col,
                cursor_row = excluded.cursor_row,
                cols = excluded.cols,
                rows = excluded.rows,
                last_activity = excluded.last_activity,
                process_id = excluded.process_id
            "#,
            params![
                snapshot.tab_id.to_string(),
                snapshot.working_directory.to_string_lossy(),
                environment,
                scrollback,
                snapshot.cursor.0,
                snapshot.cursor.1,
                snapshot.size.0,
                snapshot.size.1,
                snapshot.last_activity.to_rfc3339(),
                snapshot.process_id.map(|id| id.to_string()),
            ],
        )?;
        debug!(
            target: "tabterm::store",
            "Saved snapshot for tab {} ({} lines)",
            snapshot.tab_id,
            snapshot.scrollback.len() - skip
        );
        Ok(())
    }

    /// Load the snapshot for a tab.
    pub fn load(&self, tab_id: Uuid) -> Result<Option<SessionSnapshot>> {
        let conn = self.conn()?;
        let snapshot = conn
            .query_row(
                "SELECT * FROM snapshots WHERE tab_id = ?1",
                params![tab_id.to_string()],
                |row| Self::row_to_snapshot(row),
            )
            .optional()?;
        Ok(snapshot)
    }

    /// Delete the snapshot for a tab. Deleting a missing snapshot is not an error.
    pub fn delete(&self, tab_id: Uuid) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM snapshots WHERE tab_id = ?1",
            params![tab_id.to_string()],
        )?;
        Ok(())
    }

    /// Replace the persisted tab list (order and active flags included).
    pub fn replace_tabs(&self, tabs: &[StoredTab]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM tabs", [])?;
        for (position, stored) in tabs.iter().enumerate() {
            tx.execute(
                "INSERT INTO tabs (id, position, data, active) VALUES (?1, ?2, ?3, ?4)",
                params![
                    stored.tab.id.to_string(),
                    position as i64,
                    serde_json::to_string(&stored.tab)?,
                    stored.active,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Persisted tabs in display order. Status is reset to `Loading`: nothing is
    /// connected yet after a restart.
    pub fn list_tabs(&self) -> Result<Vec<StoredTab>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT data, active FROM tabs ORDER BY position ASC")?;
        let rows = stmt
            .query_map([], |row| {
                let data: String = row.get(0)?;
                let active: bool = row.get(1)?;
                Ok((data, active))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut tabs = Vec::with_capacity(rows.len());
        for (data, active) in rows {
            let mut tab: Tab = serde_json::from_str(&data)?;
            tab.status = TabStatus::Loading;
            tabs.push(StoredTab { tab, active });
        }
        Ok(tabs)
    }

    /// Write a row that cannot be decoded.
    #[cfg(test)]
    pub(crate) fn corrupt_snapshot_for_test(&self, tab_id: Uuid) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO snapshots (tab_id, working_directory, cols, rows, last_activity)
             VALUES (?1, '/tmp', -1, 'tall', 'yesterday')",
            params![tab_id.to_string()],
        )?;
        Ok(())
    }

    fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<SessionSnapshot> {
        let tab_id: String = row.get("tab_id")?;
        let working_directory: String = row.get("working_directory")?;
        let environment: String = row.get("environment")?;
        let scrollback: String = row.get("scrollback")?;
        let cursor_col: u16 = row.get("cursor_col")?;
        let cursor_row: u16 = row.get("cursor_row")?;
        let cols: u16 = row.get("cols")?;
        let rows: u16 = row.get("rows")?;
        let last_activity: String = row.get("last_activity")?;
        let process_id: Option<String> = row.get("process_id")?;

        Ok(SessionSnapshot {
            tab_id: Uuid::parse_str(&tab_id).unwrap_or_default(),
            working_directory: working_directory.into(),
            environment: serde_json::from_str(&environment).unwrap_or_default(),
            scrollback: serde_json::from_str(&scrollback).unwrap_or_default(),
            cursor: (cursor_col, cursor_row),
            size: (cols, rows),
            last_activity: DateTime::parse_from_rfc3339(&last_activity)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_default(),
            process_id: process_id.and_then(|id| Uuid::parse_str(&id).ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tabterm_types::TabSpec;

    fn snapshot(tab_id: Uuid, lines: usize) -> SessionSnapshot {
        let mut environment = BTreeMap::new();
        environment.insert("TERM".to_string(), "xterm-256color".to_string());
        SessionSnapshot {
            tab_id,
            working_directory: PathBuf::from("/home/x"),
            environment,
            scrollback: (0..lines).map(|i| format!("line {}", i)).collect(),
            cursor: (4, 2),
            size: (120, 40),
            last_activity: Utc::now(),
            process_id: Some(Uuid::new_v4()),
        }
    }

    #[test]
    fn test_snapshot_round_trip() {
        let store = SessionStore::open_in_memory(100).unwrap();
        let tab_id = Uuid::new_v4();
        let saved = snapshot(tab_id, 3);
        store.save(&saved).unwrap();

        let loaded = store.load(tab_id).unwrap().unwrap();
        assert_eq!(loaded.working_directory, saved.working_directory);
        assert_eq!(loaded.scrollback, saved.scrollback);
        assert_eq!(loaded.cursor, saved.cursor);
        assert_eq!(loaded.size, saved.size);
        assert_eq!(loaded.environment, saved.environment);
        assert_eq!(loaded.process_id, saved.process_id);
    }

    #[test]
    fn test_scrollback_truncated_to_cap() {
        let store = SessionStore::open_in_memory(5).unwrap();
        let tab_id = Uuid::new_v4();
        store.save(&snapshot(tab_id, 12)).unwrap();

        let loaded = store.load(tab_id).unwrap().unwrap();
        assert_eq!(loaded.scrollback.len(), 5);
        // Most recent lines are kept
        assert_eq!(loaded.scrollback.first().unwrap(), "line 7");
        assert_eq!(loaded.scrollback.last().unwrap(), "line 11");
    }

    #[test]
    fn test_last_write_wins() {
        let store = SessionStore::open_in_memory(100).unwrap();
        let tab_id = Uuid::new_v4();
        store.save(&snapshot(tab_id, 3)).unwrap();

        let mut newer = snapshot(tab_id, 1);
        newer.working_directory = PathBuf::from("/srv");
        newer.process_id = None;
        store.save(&newer).unwrap();

        let loaded = store.load(tab_id).unwrap().unwrap();
        assert_eq!(loaded.working_directory, PathBuf::from("/srv"));
        assert_eq!(loaded.scrollback.len(), 1);
        assert_eq!(loaded.process_id, None);
    }

    #[test]
    fn test_delete_and_missing() {
        let store = SessionStore::open_in_memory(100).unwrap();
        let tab_id = Uuid::new_v4();
        assert!(store.load(tab_id).unwrap().is_none());

        store.save(&snapshot(tab_id, 2)).unwrap();
        store.delete(tab_id).unwrap();
        assert!(store.load(tab_id).unwrap().is_none());
        // Deleting twice is fine
        store.delete(tab_id).unwrap();
    }

    #[test]
    fn test_tabs_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sessions.db");

        let mut first = Tab::from_spec(TabSpec {
            title: "zsh".into(),
            working_directory: "/tmp".into(),
            shell: "/bin/zsh".into(),
            closable: true,
            ..Default::default()
        });
        first.status = TabStatus::Active;
        let second = Tab::from_spec(TabSpec {
            title: "build".into(),
            working_directory: "/src".into(),
            shell: "/bin/bash".into(),
            ..Default::default()
        });

        {
            let store = SessionStore::open(&path, 100).unwrap();
            store
                .replace_tabs(&[
                    StoredTab { tab: second.clone(), active: false },
                    StoredTab { tab: first.clone(), active: true },
                ])
                .unwrap();
        }

        let store = SessionStore::open(&path, 100).unwrap();
        let tabs = store.list_tabs().unwrap();
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[0].tab.id, second.id);
        assert_eq!(tabs[1].tab.id, first.id);
        assert!(tabs[1].active);
        // Status is not carried over a restart
        assert_eq!(tabs[1].tab.status, TabStatus::Loading);
    }

    #[test]
    fn test_snapshot_schema_is_created_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let tab_id = Uuid::new_v4();
        let saved = snapshot(tab_id, 2);
        {
            let store = SessionStore::open(&path, 100).unwrap();
            let sql: String = store
                .conn()
                .unwrap()
                .query_row(
                    "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'snapshots'",
                    [],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(sql.contains("process_id TEXT"));
            store.save(&saved).unwrap();
        }

        let store = SessionStore::open(&path, 100).unwrap();
        let loaded = store.load(tab_id).unwrap().unwrap();
        assert_eq!(loaded.process_id, saved.process_id);
    }
}
