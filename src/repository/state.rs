//! Worker-state and progress singleton rows.

use chrono::Utc;
use rusqlite::params;

use super::{parse_datetime, to_option, Repository, Result};
use crate::models::{ProgressSnapshot, WorkerState};

impl Repository {
    /// Overwrite the derived worker-state cache. The ops-request applier is
    /// the only caller.
    pub fn write_worker_state(&self, state: &WorkerState) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO worker_state \
                 (id, stop_requested, paused_workspaces, paused_documents, max_parallel, updated_at) \
             VALUES (1, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 stop_requested = excluded.stop_requested, \
                 paused_workspaces = excluded.paused_workspaces, \
                 paused_documents = excluded.paused_documents, \
                 max_parallel = excluded.max_parallel, \
                 updated_at = excluded.updated_at",
            params![
                state.stop_requested as i64,
                serde_json::to_string(&state.paused_workspaces)?,
                serde_json::to_string(&state.paused_documents)?,
                state.max_parallel as i64,
                state.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Read the worker-state cache; defaults apply when no row exists yet.
    pub fn read_worker_state(&self) -> Result<WorkerState> {
        let conn = self.connect()?;
        let row = to_option(conn.query_row(
            "SELECT stop_requested, paused_workspaces, paused_documents, max_parallel, updated_at \
             FROM worker_state WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        ))?;

        match row {
            None => Ok(WorkerState::default()),
            Some((stop, workspaces, documents, max_parallel, updated)) => Ok(WorkerState {
                stop_requested: stop != 0,
                paused_workspaces: serde_json::from_str(&workspaces).unwrap_or_default(),
                paused_documents: serde_json::from_str(&documents).unwrap_or_default(),
                max_parallel: max_parallel.max(1) as u32,
                updated_at: parse_datetime(&updated),
            }),
        }
    }

    /// Overwrite the live progress snapshot row.
    pub fn write_progress(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO progress (id, snapshot, updated_at) VALUES (1, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 snapshot = excluded.snapshot, updated_at = excluded.updated_at",
            params![
                serde_json::to_string(snapshot)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Read the latest progress snapshot, if one has been written.
    pub fn read_progress(&self) -> Result<Option<ProgressSnapshot>> {
        let conn = self.connect()?;
        let raw: Option<String> = to_option(conn.query_row(
            "SELECT snapshot FROM progress WHERE id = 1",
            [],
            |row| row.get(0),
        ))?;
        match raw {
            None => Ok(None),
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::new(&dir.path().join("docmill.db")).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_worker_state_defaults_when_absent() {
        let (_dir, repo) = test_repo();
        let state = repo.read_worker_state().unwrap();
        assert!(!state.stop_requested);
        assert!(state.paused_workspaces.is_empty());
    }

    #[test]
    fn test_worker_state_roundtrip() {
        let (_dir, repo) = test_repo();
        let mut state = WorkerState::default();
        state.stop_requested = true;
        state.paused_workspaces.insert("classroom".to_string());
        state.max_parallel = 4;
        repo.write_worker_state(&state).unwrap();

        let read = repo.read_worker_state().unwrap();
        assert!(read.stop_requested);
        assert!(read.paused_workspaces.contains("classroom"));
        assert_eq!(read.max_parallel, 4);
    }

    #[test]
    fn test_worker_state_is_single_row() {
        let (_dir, repo) = test_repo();
        repo.write_worker_state(&WorkerState::default()).unwrap();
        repo.write_worker_state(&WorkerState::default()).unwrap();

        let conn = repo.connect().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM worker_state", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_progress_roundtrip() {
        let (_dir, repo) = test_repo();
        assert!(repo.read_progress().unwrap().is_none());

        let mut snapshot = ProgressSnapshot::default();
        snapshot.success_count = 7;
        snapshot.is_processing = true;
        repo.write_progress(&snapshot).unwrap();

        let read = repo.read_progress().unwrap().unwrap();
        assert_eq!(read.success_count, 7);
        assert!(read.is_processing);
    }
}
