//! Incremental indexing: chunk, embed, and commit one document atomically.
//!
//! The expensive half ([`plan`]: chunking and embedding) needs no database
//! access and runs in parallel across workers. The cheap half ([`commit`])
//! runs on the single writer connection inside one IMMEDIATE transaction, so
//! readers on WAL snapshots observe a document's chunks all at once or not at
//! all.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::chunker::chunk_text;
use super::store::{delete_chunk, insert_document, prepare_document};
use super::types::{text_fingerprint, Document, OffsetRange, RawDocument};
use crate::config::IndexingConfig;
use crate::db::migrations;
use crate::embedding::{embedding_to_bytes, EmbeddingProvider, EMBEDDING_DIM};
use crate::error::{CoreError, IngestError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub chunks_added: usize,
    /// Chunks carried over unchanged from the previous version of the document.
    pub chunks_updated: usize,
    pub chunks_removed: usize,
    pub unchanged: bool,
}

impl IngestReport {
    fn unchanged(document_id: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            chunks_added: 0,
            chunks_updated: 0,
            chunks_removed: 0,
            unchanged: true,
        }
    }
}

/// Outcome of a batch: per-document reports plus isolated per-document failures.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchReport {
    pub reports: Vec<IngestReport>,
    pub errors: Vec<IngestError>,
}

#[derive(Debug, Clone)]
pub struct PlannedChunk {
    pub range: OffsetRange,
    pub text: String,
    pub fingerprint: String,
    pub embedding: Option<Vec<f32>>,
}

/// A document ready to commit: validated, chunked and embedded.
#[derive(Debug, Clone)]
pub struct PlannedDocument {
    pub document: Document,
    pub chunks: Vec<PlannedChunk>,
    pub embedding_model: Option<String>,
}

/// Validate, chunk and embed a document. Touches no database.
pub fn plan(
    raw: &RawDocument,
    config: &IndexingConfig,
    embedder: Option<&dyn EmbeddingProvider>,
) -> std::result::Result<PlannedDocument, IngestError> {
    let document = prepare_document(raw)?;

    let mut seen = HashSet::new();
    let mut chunks: Vec<PlannedChunk> = chunk_text(
        &document.raw_text,
        config.chunk_size,
        config.chunk_overlap,
    )
    .into_iter()
    .filter_map(|span| {
        let fingerprint = text_fingerprint(span.text);
        // repeated passages inside one document are indexed once
        seen.insert(fingerprint.clone()).then(|| PlannedChunk {
            range: span.range,
            text: span.text.to_string(),
            fingerprint,
            embedding: None,
        })
    })
    .collect();

    let embedding_model = match embedder {
        Some(provider) => {
            let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
            let vectors = provider.embed_batch(&texts).map_err(|e| IngestError {
                document_id: document.id.clone(),
                cause: format!("embedding failed: {e:#}"),
            })?;
            if vectors.len() != chunks.len() || vectors.iter().any(|v| v.len() != EMBEDDING_DIM) {
                return Err(IngestError {
                    document_id: document.id.clone(),
                    cause: format!("embedding provider returned vectors not of dimension {EMBEDDING_DIM}"),
                });
            }
            for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                chunk.embedding = Some(vector);
            }
            Some(provider.model_id())
        }
        None => None,
    };

    Ok(PlannedDocument {
        document,
        chunks,
        embedding_model,
    })
}

/// Apply a planned document to the index in one transaction.
pub fn commit(conn: &mut Connection, planned: &PlannedDocument) -> Result<IngestReport> {
    let doc = &planned.document;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let already_indexed: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM chunks WHERE document_id = ?1)",
        params![doc.id],
        |row| row.get(0),
    )?;
    if already_indexed {
        tracing::debug!(document_id = %doc.id, "document unchanged");
        return Ok(IngestReport::unchanged(&doc.id));
    }

    insert_document(&tx, doc)?;
    // re-ingesting an older version makes it current again
    tx.execute(
        "UPDATE documents SET superseded_by = NULL WHERE id = ?1",
        params![doc.id],
    )?;

    let previous: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT id FROM documents WHERE lineage = ?1 AND id != ?2 AND superseded_by IS NULL",
        )?;
        let ids = stmt
            .query_map(params![doc.lineage, doc.id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        ids
    };

    // fingerprint -> (rowid, chunk id) of chunks owned by previous versions
    let mut reusable: HashMap<String, Vec<(i64, String)>> = HashMap::new();
    for prev in &previous {
        let mut stmt = tx.prepare_cached(
            "SELECT rowid, id, fingerprint FROM chunks WHERE document_id = ?1 ORDER BY start_offset",
        )?;
        let rows = stmt.query_map(params![prev], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        for row in rows {
            let (rowid, id, fingerprint) = row?;
            reusable.entry(fingerprint).or_default().push((rowid, id));
        }
    }
    reusable.values_mut().for_each(|v| v.reverse());

    let mut report = IngestReport {
        document_id: doc.id.clone(),
        chunks_added: 0,
        chunks_updated: 0,
        chunks_removed: 0,
        unchanged: false,
    };

    for chunk in &planned.chunks {
        let carried = reusable.get_mut(&chunk.fingerprint).and_then(|v| v.pop());
        match carried {
            Some((rowid, _)) => {
                tx.execute(
                    "UPDATE chunks SET document_id = ?1, start_offset = ?2, end_offset = ?3 WHERE rowid = ?4",
                    params![
                        doc.id,
                        chunk.range.start as i64,
                        chunk.range.end as i64,
                        rowid
                    ],
                )?;
                report.chunks_updated += 1;
            }
            None => {
                insert_chunk(&tx, &doc.id, chunk)?;
                report.chunks_added += 1;
            }
        }
    }

    for (rowid, chunk_id) in reusable.into_values().flatten() {
        delete_chunk(&tx, rowid, &chunk_id)?;
        report.chunks_removed += 1;
    }

    for prev in &previous {
        tx.execute(
            "UPDATE documents SET superseded_by = ?1 WHERE id = ?2",
            params![doc.id, prev],
        )?;
    }

    if let Some(model) = &planned.embedding_model {
        if migrations::get_embedding_model(&tx)?.is_none() {
            migrations::set_embedding_model(&tx, model)?;
        }
    }

    tx.commit()?;

    tracing::info!(
        document_id = %doc.id,
        source = %doc.source,
        added = report.chunks_added,
        updated = report.chunks_updated,
        removed = report.chunks_removed,
        superseded = previous.len(),
        "document indexed"
    );
    Ok(report)
}

fn insert_chunk(conn: &Connection, document_id: &str, chunk: &PlannedChunk) -> Result<()> {
    let id = uuid::Uuid::now_v7().to_string();
    conn.execute(
        "INSERT INTO chunks (id, document_id, fingerprint, start_offset, end_offset, text) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            document_id,
            chunk.fingerprint,
            chunk.range.start as i64,
            chunk.range.end as i64,
            chunk.text
        ],
    )?;
    let rowid = conn.last_insert_rowid();

    // Must use the same rowid as the chunks row.
    conn.execute(
        "INSERT INTO chunks_fts (rowid, text) VALUES (?1, ?2)",
        params![rowid, chunk.text],
    )?;
    if let Some(embedding) = &chunk.embedding {
        conn.execute(
            "INSERT INTO chunks_vec (chunk_id, embedding) VALUES (?1, ?2)",
            params![id, embedding_to_bytes(embedding)],
        )?;
    }
    Ok(())
}

/// Plan and commit a single document.
pub fn ingest(
    conn: &mut Connection,
    raw: &RawDocument,
    config: &IndexingConfig,
    embedder: Option<&dyn EmbeddingProvider>,
) -> Result<IngestReport> {
    let planned = plan(raw, config, embedder)?;
    commit(conn, &planned)
}

fn lock_writer(writer: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>> {
    writer
        .lock()
        .map_err(|e| CoreError::storage("corpus writer", e.to_string()))
}

/// Ingest many documents with up to `workers` planned concurrently.
///
/// Per-document failures are collected in [`BatchReport::errors`] and the batch
/// continues. A storage failure aborts the remaining work and is returned.
/// Reports are in input order.
pub async fn ingest_batch(
    writer: Arc<Mutex<Connection>>,
    documents: Vec<RawDocument>,
    config: IndexingConfig,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
) -> Result<BatchReport> {
    let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));
    let config = Arc::new(config);
    let total = documents.len();
    let mut tasks = JoinSet::new();

    for (index, raw) in documents.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let writer = Arc::clone(&writer);
        let config = Arc::clone(&config);
        let embedder = embedder.clone();

        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| CoreError::storage("ingest worker pool", e))?;
            let outcome = tokio::task::spawn_blocking(move || {
                let planned = match plan(&raw, &config, embedder.as_deref()) {
                    Ok(planned) => planned,
                    Err(e) => return Ok(Err(e)),
                };
                let mut conn = lock_writer(&writer)?;
                match commit(&mut conn, &planned) {
                    Ok(report) => Ok(Ok(report)),
                    Err(CoreError::StorageUnavailable { context, source }) => {
                        Err(CoreError::StorageUnavailable { context, source })
                    }
                    Err(other) => Ok(Err(IngestError {
                        document_id: planned.document.id.clone(),
                        cause: other.to_string(),
                    })),
                }
            })
            .await
            .map_err(|e| CoreError::storage("ingest worker", e))?;
            Ok::<_, CoreError>((index, outcome?))
        });
    }

    let mut slots: Vec<Option<std::result::Result<IngestReport, IngestError>>> =
        (0..total).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        let (index, outcome) = match joined {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                tasks.abort_all();
                tracing::error!(error = %e, "ingest batch aborted");
                return Err(e);
            }
            Err(e) => {
                tasks.abort_all();
                return Err(CoreError::storage("ingest worker", e));
            }
        };
        slots[index] = Some(outcome);
    }

    let mut batch = BatchReport::default();
    for outcome in slots.into_iter().flatten() {
        match outcome {
            Ok(report) => batch.reports.push(report),
            Err(e) => {
                tracing::warn!(document_id = %e.document_id, cause = %e.cause, "document rejected");
                batch.errors.push(e);
            }
        }
    }
    Ok(batch)
}

/// Consistency of the derived index data against the chunk table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexCheckReport {
    pub chunks: u64,
    pub lexical_entries: u64,
    pub vector_entries: u64,
    pub vectors_enabled: bool,
    pub orphan_chunks: u64,
    pub dangling_lexical: u64,
    pub dangling_vector: u64,
    pub missing_lexical: u64,
    pub missing_vector: u64,
    pub repaired: bool,
}

impl IndexCheckReport {
    pub fn is_healthy(&self) -> bool {
        self.orphan_chunks == 0
            && self.dangling_lexical == 0
            && self.dangling_vector == 0
            && self.missing_lexical == 0
            && self.missing_vector == 0
    }
}

fn count(conn: &Connection, sql: &str) -> Result<u64> {
    let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(n as u64)
}

fn inspect(conn: &Connection, vectors_enabled: bool) -> Result<IndexCheckReport> {
    Ok(IndexCheckReport {
        chunks: count(conn, "SELECT COUNT(*) FROM chunks")?,
        lexical_entries: count(conn, "SELECT COUNT(*) FROM chunks_fts")?,
        vector_entries: count(conn, "SELECT COUNT(*) FROM chunks_vec")?,
        vectors_enabled,
        orphan_chunks: count(
            conn,
            "SELECT COUNT(*) FROM chunks WHERE document_id NOT IN (SELECT id FROM documents)",
        )?,
        dangling_lexical: count(
            conn,
            "SELECT COUNT(*) FROM chunks_fts WHERE rowid NOT IN (SELECT rowid FROM chunks)",
        )?,
        dangling_vector: count(
            conn,
            "SELECT COUNT(*) FROM chunks_vec WHERE chunk_id NOT IN (SELECT id FROM chunks)",
        )?,
        missing_lexical: count(
            conn,
            "SELECT COUNT(*) FROM chunks WHERE rowid NOT IN (SELECT rowid FROM chunks_fts)",
        )?,
        missing_vector: if vectors_enabled {
            count(
                conn,
                "SELECT COUNT(*) FROM chunks WHERE id NOT IN (SELECT chunk_id FROM chunks_vec)",
            )?
        } else {
            0
        },
        repaired: false,
    })
}

/// Check the lexical and vector indexes against the chunks table. With
/// `repair`, orphaned chunks are dropped and both indexes are rebuilt from the
/// chunks, re-embedding every chunk with `embedder`.
pub fn check_index(
    conn: &mut Connection,
    repair: bool,
    embedder: Option<&dyn EmbeddingProvider>,
) -> Result<IndexCheckReport> {
    let report = inspect(conn, embedder.is_some())?;
    if !repair {
        return Ok(report);
    }

    let chunks: Vec<(i64, String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT rowid, id, text FROM chunks WHERE document_id IN (SELECT id FROM documents) ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    let vectors = match embedder {
        Some(provider) => {
            let texts: Vec<&str> = chunks.iter().map(|(_, _, text)| text.as_str()).collect();
            let vectors = provider
                .embed_batch(&texts)
                .map_err(|e| CoreError::Embedding { cause: format!("{e:#}") })?;
            Some(vectors)
        }
        None => None,
    };

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "DELETE FROM chunks WHERE document_id NOT IN (SELECT id FROM documents)",
        [],
    )?;
    tx.execute("DELETE FROM chunks_fts", [])?;
    tx.execute(
        "INSERT INTO chunks_fts (rowid, text) SELECT rowid, text FROM chunks",
        [],
    )?;
    tx.execute("DELETE FROM chunks_vec", [])?;
    if let (Some(vectors), Some(provider)) = (vectors, embedder) {
        let mut stmt = tx.prepare("INSERT INTO chunks_vec (chunk_id, embedding) VALUES (?1, ?2)")?;
        for ((_, id, _), vector) in chunks.iter().zip(&vectors) {
            stmt.execute(params![id, embedding_to_bytes(vector)])?;
        }
        drop(stmt);
        migrations::set_embedding_model(&tx, &provider.model_id())?;
    }
    tx.commit()?;

    let mut after = inspect(conn, embedder.is_some())?;
    after.repaired = true;
    tracing::info!(
        chunks = after.chunks,
        vectors = after.vector_entries,
        "index rebuilt"
    );
    Ok(after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::types::Source;
    use crate::db::open_memory_corpus;
    use crate::embedding::hashed::HashedEmbeddingProvider;

    fn small_config() -> IndexingConfig {
        IndexingConfig {
            chunk_size: 64,
            chunk_overlap: 8,
            workers: 2,
        }
    }

    fn paragraph(tag: &str, n: usize) -> String {
        (0..n).map(|i| format!("{tag}{i}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn first_ingest_adds_chunks_with_index_entries() {
        let mut conn = open_memory_corpus();
        let embedder = HashedEmbeddingProvider::new();
        let raw = RawDocument::new(Source::Wikipedia, "Alpha", paragraph("alpha", 60));

        let report = ingest(&mut conn, &raw, &small_config(), Some(&embedder)).unwrap();
        assert!(!report.unchanged);
        assert!(report.chunks_added > 1);

        let check = check_index(&mut conn, false, Some(&embedder)).unwrap();
        assert!(check.is_healthy(), "{check:?}");
        assert_eq!(check.chunks as usize, report.chunks_added);
        assert_eq!(check.lexical_entries, check.chunks);
        assert_eq!(check.vector_entries, check.chunks);
    }

    #[test]
    fn reingest_same_content_is_noop() {
        let mut conn = open_memory_corpus();
        let raw = RawDocument::new(Source::Arxiv, "Paper", paragraph("w", 40));
        let first = ingest(&mut conn, &raw, &small_config(), None).unwrap();
        let second = ingest(&mut conn, &raw, &small_config(), None).unwrap();
        assert_eq!(first.document_id, second.document_id);
        assert!(second.unchanged);
        assert_eq!(second.chunks_added, 0);
    }

    #[test]
    fn duplicate_passages_indexed_once() {
        let mut conn = open_memory_corpus();
        let config = IndexingConfig {
            chunk_size: 64,
            chunk_overlap: 0,
            workers: 1,
        };
        let block = "x".repeat(63);
        let raw = RawDocument::new(Source::Other, "Repeat", format!("{block} {block} {block}"));
        let report = ingest(&mut conn, &raw, &config, None).unwrap();
        assert_eq!(report.chunks_added, 1);
    }

    #[test]
    fn empty_text_is_an_ingest_error() {
        let mut conn = open_memory_corpus();
        let raw = RawDocument::new(Source::Other, "Empty", "   ");
        let err = ingest(&mut conn, &raw, &small_config(), None).unwrap_err();
        assert!(matches!(err, CoreError::Ingest(_)));
    }

    #[test]
    fn repair_rebuilds_dangling_entries() {
        let mut conn = open_memory_corpus();
        let embedder = HashedEmbeddingProvider::new();
        let raw = RawDocument::new(Source::Wikipedia, "Beta", paragraph("beta", 30));
        ingest(&mut conn, &raw, &small_config(), Some(&embedder)).unwrap();

        conn.execute("INSERT INTO chunks_fts (rowid, text) VALUES (999999, 'ghost')", [])
            .unwrap();
        conn.execute(
            "DELETE FROM chunks_vec WHERE chunk_id = (SELECT id FROM chunks ORDER BY rowid LIMIT 1)",
            [],
        )
            .unwrap();

        let broken = check_index(&mut conn, false, Some(&embedder)).unwrap();
        assert_eq!(broken.dangling_lexical, 1);
        assert_eq!(broken.missing_vector, 1);

        let fixed = check_index(&mut conn, true, Some(&embedder)).unwrap();
        assert!(fixed.repaired);
        assert!(fixed.is_healthy(), "{fixed:?}");
        assert_eq!(
            migrations::get_embedding_model(&conn).unwrap().as_deref(),
            Some("hashed-384")
        );
    }
}
