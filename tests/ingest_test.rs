mod helpers;

use helpers::{doc, ingest_params, security_corpus, test_corpus, test_router};
use scriptorium::config::IndexingConfig;
use scriptorium::corpus::indexer::{check_index, ingest};
use scriptorium::corpus::store;
use scriptorium::corpus::{RawDocument, Source};
use scriptorium::embedding::hashed::HashedEmbeddingProvider;
use scriptorium::router::ToolOutcome;
use tempfile::TempDir;

fn small_chunks() -> IndexingConfig {
    IndexingConfig {
        chunk_size: 120,
        chunk_overlap: 20,
        workers: 2,
    }
}

fn long_text(paragraphs: &[&str]) -> String {
    paragraphs.join(" ")
}

#[test]
fn reingesting_unchanged_content_is_a_noop() {
    let mut conn = test_corpus();
    let raw = doc(Source::Wikipedia, "Kerberos", "Kerberos uses tickets to authenticate.", "2024-01-01T00:00:00Z");

    let first = ingest(&mut conn, &raw, &small_chunks(), None).unwrap();
    assert!(!first.unchanged);
    assert_eq!(first.chunks_added, 1);

    let chunks_before: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0)).unwrap();
    let second = ingest(&mut conn, &raw, &small_chunks(), None).unwrap();
    assert!(second.unchanged);
    assert_eq!(second.document_id, first.document_id);
    assert_eq!(second.chunks_added + second.chunks_updated + second.chunks_removed, 0);

    let chunks_after: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0)).unwrap();
    assert_eq!(chunks_before, chunks_after);
}

#[test]
fn changed_document_carries_surviving_chunks() {
    let mut conn = test_corpus();
    let embedder = HashedEmbeddingProvider::new();
    // longer than one chunk window, so the first chunk is identical in both versions
    let kept = "Kerberos is a network authentication protocol designed at MIT for the Athena project in the eighties and later standardized by the IETF.";
    let dropped = "Version four was mainly of academic interest and is now considered obsolete by most vendors.";
    let added = "Windows domains use Kerberos as the default authentication protocol since Windows 2000 shipped.";

    let v1 = RawDocument::new(Source::Wikipedia, "Kerberos", long_text(&[kept, dropped]));
    let v2 = RawDocument::new(Source::Wikipedia, "Kerberos", long_text(&[kept, added]));

    let r1 = ingest(&mut conn, &v1, &small_chunks(), Some(&embedder)).unwrap();
    let r2 = ingest(&mut conn, &v2, &small_chunks(), Some(&embedder)).unwrap();

    assert_ne!(r1.document_id, r2.document_id);
    assert!(!r2.unchanged);
    assert!(r2.chunks_updated >= 1, "first chunk should be carried over: {r2:?}");
    assert!(r2.chunks_added >= 1);
    assert!(r2.chunks_removed >= 1);

    let old = store::get(&conn, &r1.document_id).unwrap().unwrap();
    assert_eq!(old.superseded_by.as_deref(), Some(r2.document_id.as_str()));
    let live: Vec<_> = store::list(&conn, Some(Source::Wikipedia))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, r2.document_id);

    // every chunk belongs to the new version and is indexed exactly once
    let orphaned: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM chunks WHERE document_id != ?1",
            [&r2.document_id],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(orphaned, 0);
    let report = check_index(&mut conn, false, Some(&embedder)).unwrap();
    assert!(report.is_healthy(), "{report:?}");
    assert_eq!(report.lexical_entries, report.chunks);
    assert_eq!(report.vector_entries, report.chunks);
}

#[test]
fn index_check_repairs_dangling_and_missing_entries() {
    let mut conn = test_corpus();
    let embedder = HashedEmbeddingProvider::new();
    for raw in security_corpus() {
        ingest(&mut conn, &raw, &small_chunks(), Some(&embedder)).unwrap();
    }

    conn.execute("INSERT INTO chunks_fts (rowid, text) VALUES (999999, 'ghost')", []).unwrap();
    conn.execute(
        "DELETE FROM chunks_vec WHERE chunk_id = (SELECT id FROM chunks ORDER BY rowid LIMIT 1)",
        [],
    )
    .unwrap();

    let broken = check_index(&mut conn, false, Some(&embedder)).unwrap();
    assert_eq!(broken.dangling_lexical, 1);
    assert_eq!(broken.missing_vector, 1);
    assert!(!broken.is_healthy());

    let repaired = check_index(&mut conn, true, Some(&embedder)).unwrap();
    assert!(repaired.repaired);
    let after = check_index(&mut conn, false, Some(&embedder)).unwrap();
    assert!(after.is_healthy(), "{after:?}");
    assert_eq!(after.lexical_entries, after.chunks);
}

#[test]
fn purge_removes_document_chunks_and_entries() {
    let mut conn = test_corpus();
    let embedder = HashedEmbeddingProvider::new();
    let raw = doc(Source::Arxiv, "Paper", "Memory forensics for credential theft.", "2024-01-01T00:00:00Z");
    let report = ingest(&mut conn, &raw, &small_chunks(), Some(&embedder)).unwrap();

    assert!(store::purge(&mut conn, &report.document_id).unwrap());
    assert!(store::get(&conn, &report.document_id).unwrap().is_none());
    let check = check_index(&mut conn, false, Some(&embedder)).unwrap();
    assert_eq!((check.chunks, check.lexical_entries, check.vector_entries), (0, 0, 0));
    assert!(!store::purge(&mut conn, &report.document_id).unwrap());
}

#[tokio::test]
async fn batch_isolates_malformed_documents() {
    let tmp = TempDir::new().unwrap();
    let router = test_router(&tmp);

    let mut docs = security_corpus();
    docs.push(RawDocument::new(Source::Other, "   ", "no title"));
    docs.push(RawDocument::new(Source::Other, "Empty", ""));

    let outcome = router.invoke("ingest", ingest_params(&docs)).await.unwrap();
    let ToolOutcome::Ingest(outcome) = outcome else {
        panic!("expected ingest outcome");
    };
    assert_eq!(outcome.batch.reports.len(), 5);
    assert_eq!(outcome.batch.errors.len(), 2);
    assert!(outcome.batch.errors.iter().all(|e| !e.document_id.is_empty()));

    // second run: every good document is unchanged
    let again = router.invoke("ingest", ingest_params(&docs)).await.unwrap();
    let ToolOutcome::Ingest(again) = again else {
        panic!("expected ingest outcome");
    };
    assert!(again.batch.reports.iter().all(|r| r.unchanged));
}

#[tokio::test]
async fn stix_bundle_loads_attack_patterns() {
    let tmp = TempDir::new().unwrap();
    let router = test_router(&tmp);

    let bundle = serde_json::json!({
        "type": "bundle",
        "id": "bundle--1",
        "objects": [
            {
                "type": "attack-pattern",
                "id": "attack-pattern--1",
                "name": "LSASS Memory",
                "description": "Adversaries may attempt to access credential material stored in LSASS.",
                "modified": "2024-04-15T12:00:00.000Z",
                "external_references": [
                    {"source_name": "mitre-attack", "external_id": "T1003.001"}
                ]
            },
            {
                "type": "attack-pattern",
                "id": "attack-pattern--2",
                "name": "Old Technique",
                "description": "Revoked.",
                "revoked": true,
                "external_references": [
                    {"source_name": "mitre-attack", "external_id": "T9999"}
                ]
            },
            {"type": "malware", "id": "malware--1", "name": "Mimikatz"}
        ]
    });
    let path = tmp.path().join("enterprise-attack.json");
    std::fs::write(&path, serde_json::to_string(&bundle).unwrap()).unwrap();

    let outcome = router
        .invoke("ingest", serde_json::json!({"path": path.to_string_lossy()}))
        .await
        .unwrap();
    let ToolOutcome::Ingest(outcome) = outcome else {
        panic!("expected ingest outcome");
    };
    assert_eq!(outcome.batch.reports.len(), 1);

    let retrieved = router
        .invoke("retrieve", serde_json::json!({"query": "lsass credential"}))
        .await
        .unwrap();
    let ToolOutcome::Retrieve { passages } = retrieved else {
        panic!("expected retrieve outcome");
    };
    assert_eq!(passages[0].provenance.source, Source::MitreAttack);
    assert_eq!(passages[0].provenance.title, "T1003.001 LSASS Memory");
    assert!(passages[0].provenance.retrieved_at.starts_with("2024-04-15T12:00:00"));
}

#[tokio::test]
async fn jsonl_and_text_files_from_a_directory() {
    let tmp = TempDir::new().unwrap();
    let router = test_router(&tmp);
    let corpus_dir = tmp.path().join("corpus");
    std::fs::create_dir_all(&corpus_dir).unwrap();

    std::fs::write(
        corpus_dir.join("wiki.jsonl"),
        concat!(
            r#"{"source": "wikipedia", "title": "Kerberos", "text": "Kerberos uses tickets."}"#,
            "\n",
            r#"{"source": "wikipedia", "title": "NTLM", "text": "NTLM is a challenge-response protocol."}"#,
            "\n",
            "not json\n",
        ),
    )
    .unwrap();
    std::fs::write(corpus_dir.join("notes.md"), "Pass-the-hash reuses NTLM hashes.").unwrap();

    let outcome = router
        .invoke(
            "ingest",
            serde_json::json!({"path": corpus_dir.to_string_lossy()}),
        )
        .await
        .unwrap();
    let ToolOutcome::Ingest(outcome) = outcome else {
        panic!("expected ingest outcome");
    };
    assert_eq!(outcome.batch.reports.len(), 3);
    assert_eq!(outcome.skipped.len(), 1);
}

#[tokio::test]
async fn bad_file_in_directory_is_rejected_not_fatal() {
    let tmp = TempDir::new().unwrap();
    let router = test_router(&tmp);
    let corpus_dir = tmp.path().join("mixed");
    std::fs::create_dir_all(&corpus_dir).unwrap();
    std::fs::write(corpus_dir.join("a_good.txt"), "Golden tickets forge Kerberos TGTs.").unwrap();
    std::fs::write(corpus_dir.join("b_bad.json"), "{ not json").unwrap();
    std::fs::write(corpus_dir.join("c_good.md"), "Silver tickets forge service tickets.").unwrap();

    let outcome = router
        .invoke("ingest", serde_json::json!({"path": corpus_dir.to_string_lossy()}))
        .await
        .unwrap();
    let ToolOutcome::Ingest(outcome) = outcome else {
        panic!("expected ingest outcome");
    };
    assert_eq!(outcome.batch.reports.len(), 2);
    assert_eq!(outcome.skipped.len(), 1);
    assert!(outcome.skipped[0].contains("b_bad.json"));

    let ToolOutcome::CorpusStats(stats) = router
        .invoke("corpus-stats", serde_json::json!({}))
        .await
        .unwrap()
    else {
        panic!("expected stats outcome");
    };
    assert_eq!(stats.live_documents, 2);
}
