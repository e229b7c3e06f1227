//! Forward-only schema migration framework.
//!
//! Tracks the schema version in `schema_meta` and runs sequential migrations
//! to bring a database up to [`CURRENT_SCHEMA_VERSION`]. The corpus and memory
//! databases each carry their own migration list.

use rusqlite::Connection;

/// The schema version that the current binary expects, for both databases.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    apply: fn(&Connection) -> rusqlite::Result<()>,
}

pub const CORPUS_MIGRATIONS: &[Migration] = &[Migration {
    version: 2,
    description: "index chunk fingerprints per document",
    apply: corpus_v1_to_v2,
}];

pub const MEMORY_MIGRATIONS: &[Migration] = &[Migration {
    version: 2,
    description: "record tombstone timestamps",
    apply: memory_v1_to_v2,
}];

/// Get the current schema version from the database.
pub fn get_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'schema_version'",
        [],
        |row| {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().unwrap_or(0))
        },
    )
}

fn update_schema_version(conn: &Connection, version: u32) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE schema_meta SET value = ?1 WHERE key = 'schema_version'",
        [version.to_string()],
    )?;
    Ok(())
}

/// Get the embedding model identifier the vector index was built with, if any.
pub fn get_embedding_model(conn: &Connection) -> rusqlite::Result<Option<String>> {
    match conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'embedding_model'",
        [],
        |row| row.get::<_, String>(0),
    ) {
        Ok(val) => Ok(Some(val)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Set the stored embedding model identifier.
pub fn set_embedding_model(conn: &Connection, model: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('embedding_model', ?1)",
        [model],
    )?;
    Ok(())
}

/// Run any pending forward-only migrations. Each migration runs in its own transaction.
pub fn run_migrations(conn: &Connection, migrations: &[Migration]) -> rusqlite::Result<()> {
    let mut version = get_schema_version(conn)?;
    tracing::debug!(schema_version = version, target = CURRENT_SCHEMA_VERSION, "checking migrations");

    for migration in migrations {
        if migration.version <= version || migration.version > CURRENT_SCHEMA_VERSION {
            continue;
        }
        tracing::info!(
            from = version,
            to = migration.version,
            description = migration.description,
            "running migration"
        );
        let tx = conn.unchecked_transaction()?;
        (migration.apply)(&tx)?;
        update_schema_version(&tx, migration.version)?;
        tx.commit()?;
        version = migration.version;
    }

    Ok(())
}

/// Corpus v1 → v2: speed up the fingerprint comparison done on re-ingestion.
fn corpus_v1_to_v2(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_chunks_fingerprint ON chunks(document_id, fingerprint);",
    )
}

/// Memory v1 → v2: keep the time a record was tombstoned for auditing.
fn memory_v1_to_v2(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("ALTER TABLE memory_records ADD COLUMN deleted_at TEXT;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::schema::init_memory_schema(&conn).unwrap();
        conn
    }

    fn fresh_corpus_db() -> Connection {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        crate::db::schema::init_corpus_schema(&conn).unwrap();
        conn
    }

    fn column_names(conn: &Connection, table: &str) -> Vec<String> {
        conn.prepare(&format!("PRAGMA table_info({table})"))
            .unwrap()
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn fresh_db_starts_at_version_1() {
        let conn = fresh_memory_db();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn memory_migration_adds_deleted_at() {
        let conn = fresh_memory_db();
        assert!(!column_names(&conn, "memory_records").contains(&"deleted_at".to_string()));

        run_migrations(&conn, MEMORY_MIGRATIONS).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
        assert!(column_names(&conn, "memory_records").contains(&"deleted_at".to_string()));
    }

    #[test]
    fn corpus_migration_adds_fingerprint_index() {
        let conn = fresh_corpus_db();
        run_migrations(&conn, CORPUS_MIGRATIONS).unwrap();

        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'index' AND name = 'idx_chunks_fingerprint'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(exists);
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = fresh_memory_db();
        run_migrations(&conn, MEMORY_MIGRATIONS).unwrap();
        run_migrations(&conn, MEMORY_MIGRATIONS).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn set_and_get_embedding_model() {
        let conn = fresh_corpus_db();
        assert!(get_embedding_model(&conn).unwrap().is_none());

        set_embedding_model(&conn, "hashed-384").unwrap();
        assert_eq!(
            get_embedding_model(&conn).unwrap(),
            Some("hashed-384".to_string())
        );
    }
}
