use rusqlite::Connection;
use scriptorium::db::{self, check_database_health};
use scriptorium::CoreError;
use tempfile::TempDir;

fn table_names(conn: &Connection) -> Vec<String> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type IN ('table', 'view') ORDER BY name")
        .unwrap();
    stmt.query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<String>, _>>()
        .unwrap()
}

#[test]
fn databases_are_created_at_nested_paths() {
    let tmp = TempDir::new().unwrap();
    let corpus_path = tmp.path().join("a").join("b").join("corpus.db");
    let memory_path = tmp.path().join("c").join("memory.db");

    let corpus = db::open_corpus_database(&corpus_path).unwrap();
    let memory = db::open_memory_database(&memory_path).unwrap();
    assert!(corpus_path.exists());
    assert!(memory_path.exists());

    let corpus_tables = table_names(&corpus);
    for table in ["documents", "chunks", "chunks_fts", "chunks_vec", "schema_meta"] {
        assert!(corpus_tables.iter().any(|t| t == table), "missing {table}");
    }
    assert!(!corpus_tables.iter().any(|t| t == "memory_records"));

    let memory_tables = table_names(&memory);
    for table in ["memory_records", "memory_log", "schema_meta"] {
        assert!(memory_tables.iter().any(|t| t == table), "missing {table}");
    }
    assert!(!memory_tables.iter().any(|t| t == "documents"));
}

#[test]
fn connections_use_wal_and_a_busy_timeout() {
    let tmp = TempDir::new().unwrap();
    let conn = db::open_corpus_database(tmp.path().join("corpus.db")).unwrap();

    let mode: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0)).unwrap();
    assert_eq!(mode.to_lowercase(), "wal");
    let timeout: i64 = conn.query_row("PRAGMA busy_timeout", [], |r| r.get(0)).unwrap();
    assert_eq!(timeout, 5000);
    let fk: i64 = conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0)).unwrap();
    assert_eq!(fk, 1);
}

#[test]
fn reopening_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("memory.db");
    drop(db::open_memory_database(&path).unwrap());
    let conn = db::open_memory_database(&path).unwrap();
    let version = db::migrations::get_schema_version(&conn).unwrap();
    assert_eq!(version, db::migrations::CURRENT_SCHEMA_VERSION);
}

#[test]
fn health_check_reports_integrity() {
    let tmp = TempDir::new().unwrap();
    let conn = db::open_corpus_database(tmp.path().join("corpus.db")).unwrap();
    let report = check_database_health(&conn).unwrap();
    assert!(report.integrity_ok);
    assert_eq!(report.schema_version, db::migrations::CURRENT_SCHEMA_VERSION);
    assert!(report.sqlite_vec_version.starts_with('v'));
    assert!(report.embedding_model.is_none());
}

#[test]
fn unwritable_location_is_storage_unavailable() {
    let tmp = TempDir::new().unwrap();
    let blocker = tmp.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();

    let err = db::open_corpus_database(blocker.join("corpus.db")).unwrap_err();
    assert!(matches!(err, CoreError::StorageUnavailable { .. }));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn pooled_connections_are_reused() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("corpus.db");
    drop(db::open_corpus_database(&path).unwrap());

    let pool = db::ConnectionPool::new(&path, 2);
    {
        let conn = pool.get().unwrap();
        conn.execute("CREATE TEMP TABLE marker (x INTEGER)", []).unwrap();
    }
    // the idle connection comes back with its temp schema intact
    let conn = pool.get().unwrap();
    let found: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_temp_master WHERE name = 'marker'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(found, 1);
}
