//! Document storage: `put`, `get`, keyset-paged `list`, `purge`, and stats.
//!
//! Functions take a plain `&Connection`; callers decide whether that is the
//! writer connection or a pooled reader.

use std::collections::{BTreeMap, VecDeque};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::types::{now_timestamp, Document, RawDocument, Source};
use crate::error::{IngestError, Result};

const DEFAULT_PAGE_SIZE: usize = 100;

pub(crate) const DOCUMENT_COLUMNS: &str =
    "id, lineage, source, title, raw_text, retrieved_at, superseded_by";

pub(crate) fn parse_source(idx: usize, value: String) -> rusqlite::Result<Source> {
    value.parse::<Source>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

pub(crate) fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        lineage: row.get(1)?,
        source: parse_source(2, row.get(2)?)?,
        title: row.get(3)?,
        raw_text: row.get(4)?,
        retrieved_at: row.get(5)?,
        superseded_by: row.get(6)?,
    })
}

/// Check a raw document and turn it into the row that would be stored.
pub fn prepare_document(raw: &RawDocument) -> std::result::Result<Document, IngestError> {
    let id = raw.fingerprint();
    let fail = |cause: &str| IngestError {
        document_id: id.clone(),
        cause: cause.to_string(),
    };
    if raw.title.trim().is_empty() {
        return Err(fail("title is empty"));
    }
    if raw.raw_text.trim().is_empty() {
        return Err(fail("raw_text is empty"));
    }
    let retrieved_at = match raw.retrieved_at.as_deref() {
        None => now_timestamp(),
        Some(ts) => chrono::DateTime::parse_from_rfc3339(ts)
            .map_err(|e| fail(&format!("invalid retrieved_at {ts:?}: {e}")))?
            .with_timezone(&chrono::Utc)
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
    };

    Ok(Document {
        id: id.clone(),
        lineage: raw.lineage(),
        source: raw.source,
        title: raw.title.clone(),
        raw_text: raw.raw_text.clone(),
        retrieved_at,
        superseded_by: None,
    })
}

/// Insert the document row if it does not exist yet. Returns `true` when inserted.
pub(crate) fn insert_document(conn: &Connection, doc: &Document) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO documents (id, lineage, source, title, raw_text, retrieved_at, superseded_by) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
        params![
            doc.id,
            doc.lineage,
            doc.source.as_str(),
            doc.title,
            doc.raw_text,
            doc.retrieved_at
        ],
    )?;
    Ok(inserted > 0)
}

/// Store a document without indexing it. Idempotent on the content fingerprint.
pub fn put(conn: &Connection, raw: &RawDocument) -> Result<String> {
    let doc = prepare_document(raw)?;
    if insert_document(conn, &doc)? {
        tracing::debug!(document_id = %doc.id, source = %doc.source, "document stored");
    }
    Ok(doc.id)
}

/// Fetch a document by id. Superseded versions are still returned.
pub fn get(conn: &Connection, id: &str) -> Result<Option<Document>> {
    let doc = conn
        .query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
            params![id],
            document_from_row,
        )
        .optional()?;
    Ok(doc)
}

/// Position after which a listing resumes: the last `(retrieved_at, id)` seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub retrieved_at: String,
    pub id: String,
}

impl std::fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.retrieved_at, self.id)
    }
}

impl std::str::FromStr for ResumeToken {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (retrieved_at, id) = s
            .rsplit_once('/')
            .ok_or_else(|| format!("malformed resume token: {s}"))?;
        Ok(Self {
            retrieved_at: retrieved_at.to_string(),
            id: id.to_string(),
        })
    }
}

/// Lazy, finite iterator over live documents ordered by `(retrieved_at, id)`.
///
/// Pages are fetched on demand; [`DocumentCursor::resume_token`] can be handed
/// to [`list_from`] to continue after the last yielded document.
pub struct DocumentCursor<'c> {
    conn: &'c Connection,
    source: Option<Source>,
    after: Option<ResumeToken>,
    page_size: usize,
    buffer: VecDeque<Document>,
    exhausted: bool,
}

impl<'c> DocumentCursor<'c> {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn resume_token(&self) -> Option<&ResumeToken> {
        self.after.as_ref()
    }

    fn fetch_page(&mut self) -> Result<()> {
        let (after_ts, after_id) = match &self.after {
            Some(t) => (Some(t.retrieved_at.as_str()), Some(t.id.as_str())),
            None => (None, None),
        };
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents \
             WHERE superseded_by IS NULL \
               AND (?1 IS NULL OR source = ?1) \
               AND (?2 IS NULL OR retrieved_at > ?2 OR (retrieved_at = ?2 AND id > ?3)) \
             ORDER BY retrieved_at, id LIMIT ?4"
        ))?;
        let page = stmt
            .query_map(
                params![
                    self.source.map(|s| s.as_str()),
                    after_ts,
                    after_id,
                    self.page_size as i64
                ],
                document_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for DocumentCursor<'_> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let doc = self.buffer.pop_front()?;
        self.after = Some(ResumeToken {
            retrieved_at: doc.retrieved_at.clone(),
            id: doc.id.clone(),
        });
        Some(Ok(doc))
    }
}

/// List live (non-superseded) documents, optionally restricted to one source.
pub fn list(conn: &Connection, source: Option<Source>) -> DocumentCursor<'_> {
    list_from(conn, source, None)
}

/// Resume a listing after `token`.
pub fn list_from(
    conn: &Connection,
    source: Option<Source>,
    token: Option<ResumeToken>,
) -> DocumentCursor<'_> {
    DocumentCursor {
        conn,
        source,
        after: token,
        page_size: DEFAULT_PAGE_SIZE,
        buffer: VecDeque::new(),
        exhausted: false,
    }
}

/// Delete a chunk row together with its lexical and vector entries.
pub(crate) fn delete_chunk(conn: &Connection, rowid: i64, chunk_id: &str) -> Result<()> {
    conn.execute("DELETE FROM chunks_fts WHERE rowid = ?1", params![rowid])?;
    conn.execute("DELETE FROM chunks_vec WHERE chunk_id = ?1", params![chunk_id])?;
    conn.execute("DELETE FROM chunks WHERE rowid = ?1", params![rowid])?;
    Ok(())
}

/// Remove a document, its chunks and their index entries in one transaction.
/// Returns `false` when no such document exists.
pub fn purge(conn: &mut Connection, id: &str) -> Result<bool> {
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

    let chunks: Vec<(i64, String)> = {
        let mut stmt = tx.prepare("SELECT rowid, id FROM chunks WHERE document_id = ?1")?;
        let rows = stmt
            .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    for (rowid, chunk_id) in &chunks {
        delete_chunk(&tx, *rowid, chunk_id)?;
    }
    let removed = tx.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
    tx.commit()?;

    if removed > 0 {
        tracing::info!(document_id = %id, chunks = chunks.len(), "document purged");
    }
    Ok(removed > 0)
}

#[derive(Debug, Clone, Serialize)]
pub struct CorpusStats {
    pub documents: u64,
    pub live_documents: u64,
    pub superseded_documents: u64,
    pub chunks: u64,
    pub by_source: BTreeMap<String, u64>,
    pub embedding_model: Option<String>,
}

pub fn stats(conn: &Connection) -> Result<CorpusStats> {
    let (documents, live_documents): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(superseded_by IS NULL), 0) FROM documents",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let chunks: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;

    let mut by_source: BTreeMap<String, u64> = Source::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    let mut stmt = conn.prepare(
        "SELECT source, COUNT(*) FROM documents WHERE superseded_by IS NULL GROUP BY source",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
        let (source, count) = row?;
        by_source.insert(source, count as u64);
    }

    Ok(CorpusStats {
        documents: documents as u64,
        live_documents: live_documents as u64,
        superseded_documents: (documents - live_documents) as u64,
        chunks: chunks as u64,
        by_source,
        embedding_model: crate::db::migrations::get_embedding_model(conn)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_corpus;
    use crate::error::CoreError;

    fn doc(source: Source, title: &str, text: &str, ts: &str) -> RawDocument {
        RawDocument {
            source,
            title: title.into(),
            raw_text: text.into(),
            retrieved_at: Some(ts.into()),
        }
    }

    #[test]
    fn put_is_idempotent_and_get_returns_document() {
        let conn = open_memory_corpus();
        let raw = doc(Source::Wikipedia, "Rust", "Rust is a language.", "2024-01-01T00:00:00Z");
        let a = put(&conn, &raw).unwrap();
        let b = put(&conn, &raw).unwrap();
        assert_eq!(a, b);

        let stored = get(&conn, &a).unwrap().unwrap();
        assert_eq!(stored.title, "Rust");
        assert_eq!(stored.retrieved_at, "2024-01-01T00:00:00.000000Z");
        assert!(get(&conn, "missing").unwrap().is_none());

        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM documents", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn put_rejects_malformed_documents() {
        let conn = open_memory_corpus();
        let err = put(&conn, &RawDocument::new(Source::Other, "  ", "text")).unwrap_err();
        assert!(matches!(err, CoreError::Ingest(_)));
        let err = put(
            &conn,
            &doc(Source::Other, "t", "text", "yesterday"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("retrieved_at"));
    }

    #[test]
    fn list_pages_and_resumes() {
        let conn = open_memory_corpus();
        for i in 0..7 {
            let ts = format!("2024-01-0{}T00:00:00Z", i + 1);
            put(&conn, &doc(Source::Arxiv, &format!("paper {i}"), "abstract", &ts)).unwrap();
        }
        put(&conn, &doc(Source::Wikipedia, "wiki", "text", "2024-01-01T00:00:00Z")).unwrap();

        let mut cursor = list(&conn, Some(Source::Arxiv)).with_page_size(3);
        let first: Vec<Document> = cursor.by_ref().take(4).map(|d| d.unwrap()).collect();
        assert_eq!(first.len(), 4);
        assert_eq!(first[0].title, "paper 0");

        let token = cursor.resume_token().cloned().unwrap();
        let token: ResumeToken = token.to_string().parse().unwrap();
        let rest: Vec<Document> = list_from(&conn, Some(Source::Arxiv), Some(token))
            .map(|d| d.unwrap())
            .collect();
        let titles: Vec<&str> = rest.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(titles, vec!["paper 4", "paper 5", "paper 6"]);

        assert_eq!(list(&conn, None).count(), 8);
    }

    #[test]
    fn purge_missing_is_false() {
        let mut conn = open_memory_corpus();
        assert!(!purge(&mut conn, "nope").unwrap());
    }

    #[test]
    fn stats_counts_by_source() {
        let conn = open_memory_corpus();
        put(&conn, &RawDocument::new(Source::MitreAttack, "T1003 OS Credential Dumping", "x")).unwrap();
        let stats = stats(&conn).unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.by_source["mitre_attack"], 1);
        assert_eq!(stats.by_source["arxiv"], 0);
    }
}
