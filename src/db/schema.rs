//! SQL DDL for both Scriptorium databases.
//!
//! The corpus database holds `documents`, `chunks`, the `chunks_fts` (FTS5)
//! lexical index and the `chunks_vec` (vec0) vector index. The memory database
//! holds `memory_records` and its `memory_log` audit trail. Both carry a
//! `schema_meta` table. All DDL uses `IF NOT EXISTS`.

use rusqlite::Connection;

const CORPUS_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    lineage TEXT NOT NULL,
    source TEXT NOT NULL CHECK(source IN ('wikipedia','mitre_attack','arxiv','other')),
    title TEXT NOT NULL,
    raw_text TEXT NOT NULL,
    retrieved_at TEXT NOT NULL,
    superseded_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_documents_lineage ON documents(lineage);
CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source);
CREATE INDEX IF NOT EXISTS idx_documents_listing ON documents(retrieved_at, id);

CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    fingerprint TEXT NOT NULL,
    start_offset INTEGER NOT NULL,
    end_offset INTEGER NOT NULL,
    text TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);

-- Lexical index; rowid mirrors chunks.rowid
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    text,
    tokenize = 'porter unicode61'
);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
const CORPUS_VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_vec USING vec0(
    chunk_id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

const MEMORY_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS memory_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL CHECK(role IN ('user','assistant','pinned-fact')),
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0 CHECK(deleted IN (0, 1)),
    UNIQUE(session_id, id)
);

CREATE INDEX IF NOT EXISTS idx_memory_session ON memory_records(session_id, deleted, seq);

CREATE TABLE IF NOT EXISTS memory_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('create','tombstone','restore','compact')),
    session_id TEXT NOT NULL,
    record_id TEXT,
    details TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize the corpus tables. Idempotent.
pub fn init_corpus_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CORPUS_SCHEMA_SQL)?;
    conn.execute_batch(CORPUS_VEC_TABLE_SQL)?;
    set_initial_version(conn)
}

/// Initialize the memory tables. Idempotent.
pub fn init_memory_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(MEMORY_SCHEMA_SQL)?;
    set_initial_version(conn)
}

fn set_initial_version(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn corpus_schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_corpus_schema(&conn).unwrap();

        let tables = table_names(&conn);
        for expected in ["documents", "chunks", "chunks_fts", "chunks_vec", "schema_meta"] {
            assert!(tables.contains(&expected.to_string()), "{expected} missing");
        }
        assert!(!tables.contains(&"memory_records".to_string()));
    }

    #[test]
    fn memory_schema_is_independent_of_corpus() {
        let conn = Connection::open_in_memory().unwrap();
        init_memory_schema(&conn).unwrap();

        let tables = table_names(&conn);
        assert!(tables.contains(&"memory_records".to_string()));
        assert!(tables.contains(&"memory_log".to_string()));
        assert!(!tables.contains(&"documents".to_string()));
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_corpus_schema(&conn).unwrap();
        init_corpus_schema(&conn).unwrap();
        init_memory_schema(&conn).unwrap();
        init_memory_schema(&conn).unwrap();
    }
}
