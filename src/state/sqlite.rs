//! SQLite 持久层
//!
//! 表 run_states(trace_id 主键)；写入为带版本条件的 upsert，旧版本不会覆盖新版本。
//! rusqlite 是同步 API，所有调用经 spawn_blocking 执行。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::core::StoreError;
use crate::state::{RunState, StateBackend};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS run_states (
    trace_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    version INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_run_states_session ON run_states(session_id);";

#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Join("sqlite connection mutex poisoned".to_string()))?;
            f(&*guard)
        })
        .await?
    }
}

#[async_trait]
impl StateBackend for SqliteBackend {
    async fn save(&self, state: &RunState) -> Result<(), StoreError> {
        let body = serde_json::to_string(state)?;
        let trace_id = state.trace_id.clone();
        let session_id = state.session_id.clone();
        let created_at = state.created_at.to_rfc3339();
        let version = state.version as i64;

        let written = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "INSERT INTO run_states (trace_id, session_id, created_at, version, body)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(trace_id) DO UPDATE SET
                         version = excluded.version,
                         body = excluded.body
                     WHERE excluded.version > run_states.version",
                    params![trace_id, session_id, created_at, version, body],
                )?)
            })
            .await?;

        if written == 0 {
            tracing::debug!(trace_id = %state.trace_id, version = state.version, "Skipped stale state write");
        }
        Ok(())
    }

    async fn load(&self, trace_id: &str) -> Result<Option<RunState>, StoreError> {
        let key = trace_id.to_string();
        let body: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT body FROM run_states WHERE trace_id = ?1",
                        [key],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    async fn list(&self) -> Result<Vec<RunState>, StoreError> {
        let bodies: Vec<String> = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT body FROM run_states")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                let bodies = rows.collect::<Result<Vec<_>, _>>()?;
                Ok(bodies)
            })
            .await?;

        Ok(bodies
            .into_iter()
            .filter_map(|b| match serde_json::from_str::<RunState>(&b) {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable run state row");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EventStatus;

    #[tokio::test]
    async fn test_save_and_load() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let mut state = RunState::new("s1", "重写", None);
        state.version = 1;
        backend.save(&state).await.unwrap();

        let loaded = backend.load(&state.trace_id).await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(backend.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_version_does_not_overwrite() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let mut newer = RunState::new("s1", "x", None);
        newer.push_event("planner", EventStatus::Started, serde_json::json!({}));
        newer.push_event("planner", EventStatus::Ok, serde_json::json!({}));
        newer.version = 2;

        let mut stale = newer.clone();
        stale.events.truncate(1);
        stale.version = 1;

        backend.save(&newer).await.unwrap();
        backend.save(&stale).await.unwrap();

        let loaded = backend.load(&newer.trace_id).await.unwrap().unwrap();
        assert_eq!(loaded.events.len(), 2);
        assert_eq!(loaded.version, 2);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let state = RunState::new("s1", "x", Some("expand".into()));
        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend.save(&state).await.unwrap();
        }
        let backend = SqliteBackend::open(&path).unwrap();
        let all = backend.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].action_guess.as_deref(), Some("expand"));
    }
}
