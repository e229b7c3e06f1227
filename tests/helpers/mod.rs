#![allow(dead_code)]

use std::sync::Arc;

use rusqlite::Connection;
use scriptorium::config::ScriptoriumConfig;
use scriptorium::corpus::{RawDocument, Source};
use scriptorium::db;
use scriptorium::embedding::hashed::HashedEmbeddingProvider;
use scriptorium::embedding::EmbeddingProvider;
use scriptorium::router::Router;
use tempfile::TempDir;

/// Open a fresh in-memory corpus database with schema and migrations applied.
pub fn test_corpus() -> Connection {
    db::load_sqlite_vec();
    let conn = Connection::open_in_memory().unwrap();
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    db::schema::init_corpus_schema(&conn).unwrap();
    db::migrations::run_migrations(&conn, db::migrations::CORPUS_MIGRATIONS).unwrap();
    conn
}

/// Config rooted in a temp dir, with everything else at defaults.
pub fn test_config(tmp: &TempDir) -> ScriptoriumConfig {
    ScriptoriumConfig::with_data_dir(tmp.path())
}

/// Router over a temp dir using the deterministic hashed embedder.
pub fn test_router(tmp: &TempDir) -> Router {
    router_with(test_config(tmp))
}

pub fn router_with(config: ScriptoriumConfig) -> Router {
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashedEmbeddingProvider::new());
    Router::with_embedder(config, Some(embedder)).unwrap()
}

pub fn doc(source: Source, title: &str, text: &str, retrieved_at: &str) -> RawDocument {
    let mut raw = RawDocument::new(source, title, text);
    raw.retrieved_at = Some(retrieved_at.to_string());
    raw
}

/// A small mixed corpus: two ATT&CK techniques, two Wikipedia articles and an
/// arXiv abstract, all mentioning credentials or memory in some way.
pub fn security_corpus() -> Vec<RawDocument> {
    vec![
        doc(
            Source::MitreAttack,
            "T1003 OS Credential Dumping",
            "Adversaries may attempt to dump credentials to obtain account login and credential material, \
             normally in the form of a hash or a clear text password, from the operating system and software.",
            "2024-04-01T00:00:00Z",
        ),
        doc(
            Source::MitreAttack,
            "T1003.001 LSASS Memory",
            "Adversaries may attempt to access credential material stored in the process memory of the \
             Local Security Authority Subsystem Service (LSASS). Credential dumping tools such as Mimikatz read it.",
            "2024-04-01T00:00:00Z",
        ),
        doc(
            Source::Wikipedia,
            "Local Security Authority Subsystem Service",
            "The Local Security Authority Subsystem Service (LSASS) is a process in Microsoft Windows operating \
             systems that is responsible for enforcing the security policy on the system.",
            "2024-03-15T00:00:00Z",
        ),
        doc(
            Source::Wikipedia,
            "Kerberos (protocol)",
            "Kerberos is a computer-network authentication protocol that works on the basis of tickets to allow \
             nodes communicating over a non-secure network to prove their identity to one another.",
            "2024-03-16T00:00:00Z",
        ),
        doc(
            Source::Arxiv,
            "Detecting credential theft with memory forensics",
            "We present a memory forensics approach for detecting credential theft from process memory on \
             enterprise endpoints, evaluated on synthetic and real incident data.",
            "2024-02-01T00:00:00Z",
        ),
    ]
}

/// Inline ingest parameters for the router.
pub fn ingest_params(docs: &[RawDocument]) -> serde_json::Value {
    serde_json::json!({ "documents": docs })
}
