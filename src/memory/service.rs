use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use super::store;
use super::types::{ForgetTarget, MemoryLogEntry, MemoryRecord, ReadOptions, Role, SessionSummary};
use crate::config::MemoryConfig;
use crate::db::{open_memory_database, ConnectionPool};
use crate::error::{CoreError, Result};

/// Async front for the memory store.
///
/// Writes to one session are serialized through that session's lane, so
/// appends land in issue order; different sessions run in parallel and only
/// meet at SQLite's IMMEDIATE write lock.
#[derive(Clone)]
pub struct MemoryService {
    pool: Arc<ConnectionPool>,
    lanes: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    config: MemoryConfig,
}

impl MemoryService {
    /// Create the schema if needed and build a pool over `path`.
    pub fn open(path: impl AsRef<Path>, pool_size: usize, config: MemoryConfig) -> Result<Self> {
        let path = path.as_ref();
        drop(open_memory_database(path)?);
        Ok(Self {
            pool: ConnectionPool::new(path, pool_size),
            lanes: Arc::new(Mutex::new(HashMap::new())),
            config,
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    fn lane(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(lanes.entry(session_id.to_string()).or_default())
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| CoreError::storage("memory worker", e))?
    }

    async fn run_in_lane<T, F>(&self, session_id: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let lane = self.lane(session_id);
        let result = {
            let _guard = lane.lock().await;
            self.run(f).await
        };
        drop(lane);
        self.release_lane(session_id);
        result
    }

    /// Forget a session's lane once no caller holds or waits on it. Clones are
    /// only handed out under the map lock, so a count of one means idle.
    fn release_lane(&self, session_id: &str) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        if lanes
            .get(session_id)
            .is_some_and(|lane| Arc::strong_count(lane) == 1)
        {
            lanes.remove(session_id);
        }
    }

    #[cfg(test)]
    fn lane_count(&self) -> usize {
        self.lanes.lock().map(|l| l.len()).unwrap_or_default()
    }

    pub async fn append(&self, session_id: &str, role: Role, content: &str) -> Result<MemoryRecord> {
        let session = session_id.to_string();
        let content = content.to_string();
        self.run_in_lane(session_id, move |conn| store::append(conn, &session, role, &content))
            .await
    }

    pub async fn read(&self, session_id: &str, options: ReadOptions) -> Result<Vec<MemoryRecord>> {
        let session = session_id.to_string();
        self.run(move |conn| store::read(conn, &session, &options)).await
    }

    /// Pinned facts plus the most recent turns, read from one snapshot.
    pub async fn context_window(
        &self,
        session_id: &str,
        turns: usize,
    ) -> Result<(Vec<MemoryRecord>, Vec<MemoryRecord>)> {
        let session = session_id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let pinned = store::pinned_facts(&tx, &session)?;
            let recent = store::recent_turns(&tx, &session, turns)?;
            tx.finish()?;
            Ok((pinned, recent))
        })
        .await
    }

    pub async fn clear(&self, session_id: &str) -> Result<usize> {
        let session = session_id.to_string();
        self.run_in_lane(session_id, move |conn| store::clear(conn, &session))
            .await
    }

    pub async fn restore(&self, session_id: &str) -> Result<usize> {
        let session = session_id.to_string();
        self.run_in_lane(session_id, move |conn| store::restore(conn, &session))
            .await
    }

    pub async fn forget(&self, session_id: &str, target: ForgetTarget) -> Result<usize> {
        let session = session_id.to_string();
        self.run_in_lane(session_id, move |conn| store::forget(conn, &session, &target))
            .await
    }

    pub async fn compact(&self, session_id: Option<&str>) -> Result<usize> {
        let session = session_id.map(str::to_string);
        match session_id {
            Some(id) => {
                self.run_in_lane(id, move |conn| store::compact(conn, session.as_deref()))
                    .await
            }
            None => self.run(move |conn| store::compact(conn, None)).await,
        }
    }

    pub async fn sessions(&self) -> Result<Vec<SessionSummary>> {
        self.run(|conn| store::sessions(conn)).await
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<MemoryLogEntry>> {
        let session = session_id.to_string();
        self.run(move |conn| store::history(conn, &session)).await
    }
}
