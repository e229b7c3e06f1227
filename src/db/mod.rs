pub mod migrations;
pub mod schema;

use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use crate::error::{Result, StorageContext};

static SQLITE_VEC_INIT: Once = Once::new();

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open a connection with the pragmas every Scriptorium database uses.
/// Does not touch the schema.
pub fn open_connection(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    load_sqlite_vec();

    let conn = Connection::open(path)
        .storage_context(|| format!("failed to open database at {}", path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .storage_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    Ok(())
}

/// Open (or create) the corpus database: documents, chunks, and both indexes.
pub fn open_corpus_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    ensure_parent(path)?;
    let conn = open_connection(path)?;

    schema::init_corpus_schema(&conn)
        .storage_context(|| format!("failed to initialize corpus schema at {}", path.display()))?;
    migrations::run_migrations(&conn, migrations::CORPUS_MIGRATIONS)
        .storage_context(|| format!("failed to migrate {}", path.display()))?;

    tracing::info!(path = %path.display(), "corpus database initialized");
    Ok(conn)
}

/// Open (or create) the memory database. Independent of the corpus database.
pub fn open_memory_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    ensure_parent(path)?;
    let conn = open_connection(path)?;

    schema::init_memory_schema(&conn)
        .storage_context(|| format!("failed to initialize memory schema at {}", path.display()))?;
    migrations::run_migrations(&conn, migrations::MEMORY_MIGRATIONS)
        .storage_context(|| format!("failed to migrate {}", path.display()))?;

    tracing::info!(path = %path.display(), "memory database initialized");
    Ok(conn)
}

/// A small pool of connections to one database file. Connections are opened
/// lazily and returned to the pool when the guard drops.
pub struct ConnectionPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
}

impl ConnectionPool {
    pub fn new(path: impl Into<PathBuf>, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            idle: Mutex::new(Vec::new()),
            max_idle: max_idle.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(self: &Arc<Self>) -> Result<PooledConnection> {
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let conn = match reused {
            Some(conn) => conn,
            None => open_connection(&self.path)?,
        };
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
        })
    }
}

pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<ConnectionPool>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else { return };
        if let Ok(mut idle) = self.pool.idle.lock() {
            if idle.len() < self.pool.max_idle {
                idle.push(conn);
            }
        }
    }
}

/// Result of [`check_database_health`].
#[derive(Debug, serde::Serialize)]
pub struct HealthReport {
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub schema_version: u32,
    pub sqlite_vec_version: String,
    pub embedding_model: Option<String>,
}

/// Run `PRAGMA integrity_check` and collect schema metadata.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let integrity_details: String =
        conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    let sqlite_vec_version: String = conn.query_row("SELECT vec_version()", [], |r| r.get(0))?;

    Ok(HealthReport {
        integrity_ok: integrity_details == "ok",
        integrity_details,
        schema_version: migrations::get_schema_version(conn)?,
        sqlite_vec_version,
        embedding_model: migrations::get_embedding_model(conn)?,
    })
}

/// Open an in-memory corpus database for testing.
#[cfg(test)]
pub fn open_memory_corpus() -> Connection {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().unwrap();
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    schema::init_corpus_schema(&conn).unwrap();
    migrations::run_migrations(&conn, migrations::CORPUS_MIGRATIONS).unwrap();
    conn
}

/// Open an in-memory memory-store database for testing.
#[cfg(test)]
pub fn open_memory_store() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    schema::init_memory_schema(&conn).unwrap();
    migrations::run_migrations(&conn, migrations::MEMORY_MIGRATIONS).unwrap();
    conn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_connections() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("corpus.db");
        drop(open_corpus_database(&path).unwrap());

        let pool = ConnectionPool::new(&path, 2);
        {
            let a = pool.get().unwrap();
            let b = pool.get().unwrap();
            let n: i64 = a
                .query_row("SELECT COUNT(*) FROM documents", [], |r| r.get(0))
                .unwrap();
            assert_eq!(n, 0);
            drop(b);
        }
        assert_eq!(pool.idle.lock().unwrap().len(), 2);
        let _again = pool.get().unwrap();
        assert_eq!(pool.idle.lock().unwrap().len(), 1);
    }

    #[test]
    fn health_check_passes_on_fresh_corpus() {
        let conn = open_memory_corpus();
        let report = check_database_health(&conn).unwrap();
        assert!(report.integrity_ok);
        assert_eq!(report.schema_version, migrations::CURRENT_SCHEMA_VERSION);
        assert!(!report.sqlite_vec_version.is_empty());
        assert!(report.embedding_model.is_none());
    }
}
