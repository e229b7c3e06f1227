//! Hybrid ranking: FTS5 BM25 + sqlite-vec KNN → fusion → technique boost →
//! deterministic ordering → per-document near-duplicate removal.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use rusqlite::{params, Connection};
use serde::Serialize;

use super::query::{fts_expression, jaccard, parse_query, term_set, TechniqueId};
use crate::config::{Fusion, RetrievalConfig};
use crate::corpus::store::parse_source;
use crate::corpus::{OffsetRange, Source};
use crate::embedding::{embedding_to_bytes, l2_to_cosine};
use crate::error::Result;

/// Where a passage came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
    pub source: Source,
    pub title: String,
    pub document_id: String,
    pub retrieved_at: String,
    pub offset_range: OffsetRange,
}

/// A ranked chunk of a document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub chunk_id: String,
    pub text: String,
    pub score: f64,
    pub lexical_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f64>,
    pub provenance: Provenance,
}

#[derive(Debug, Default, Clone)]
struct Candidate {
    lexical: Option<(usize, f64)>,
    vector: Option<(usize, f64)>,
}

/// Rank chunks for `query`. `query_embedding` is `None` when vectors are
/// disabled. `source` overrides any routing prefix in the query text.
pub fn search(
    conn: &Connection,
    query: &str,
    query_embedding: Option<&[f32]>,
    top_k: usize,
    source: Option<Source>,
    config: &RetrievalConfig,
) -> Result<Vec<Passage>> {
    let parsed = parse_query(query);
    let source = source.or(parsed.source);
    let expression = fts_expression(&parsed.text);
    if top_k == 0 || expression.is_empty() {
        return Ok(Vec::new());
    }

    let limit = top_k.saturating_mul(config.candidate_multiplier.max(1)).max(top_k);

    let mut candidates: HashMap<String, Candidate> = HashMap::new();
    for (rank, (chunk_id, score)) in lexical_candidates(conn, &expression, source, limit)?
        .into_iter()
        .enumerate()
    {
        candidates.entry(chunk_id).or_default().lexical = Some((rank, score));
    }
    if let Some(embedding) = query_embedding {
        for (rank, (chunk_id, similarity)) in vector_candidates(conn, embedding, limit)?
            .into_iter()
            .enumerate()
        {
            candidates.entry(chunk_id).or_default().vector = Some((rank, similarity));
        }
    }
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<&str> = candidates.keys().map(String::as_str).collect();
    let rows = hydrate(conn, &ids)?;

    let vectors_enabled = query_embedding.is_some();
    let mut passages: Vec<Passage> = Vec::with_capacity(rows.len());
    for row in rows {
        if row.superseded || source.is_some_and(|s| s != row.provenance.source) {
            continue;
        }
        let Some(candidate) = candidates.get(&row.chunk_id) else {
            continue;
        };
        let lexical_score = candidate.lexical.map(|(_, s)| s).unwrap_or(0.0);
        let vector_score = vectors_enabled.then(|| candidate.vector.map(|(_, s)| s).unwrap_or(0.0));
        let mut score = fuse(candidate, vectors_enabled, config);
        score += technique_boost(&parsed.techniques, &row.provenance.title, &row.text, config);

        passages.push(Passage {
            chunk_id: row.chunk_id,
            text: row.text,
            score,
            lexical_score,
            vector_score,
            provenance: row.provenance,
        });
    }

    passages.sort_by(compare_passages);
    let mut passages = dedup(passages, config.dedup_threshold);
    passages.truncate(top_k);

    tracing::debug!(
        query = %parsed.text,
        candidates = candidates.len(),
        returned = passages.len(),
        "retrieval ranked"
    );
    Ok(passages)
}

fn fuse(candidate: &Candidate, vectors_enabled: bool, config: &RetrievalConfig) -> f64 {
    match config.fusion {
        Fusion::Weighted => {
            let lexical = candidate.lexical.map(|(_, s)| s).unwrap_or(0.0);
            if !vectors_enabled {
                return lexical;
            }
            let vector = candidate.vector.map(|(_, s)| s).unwrap_or(0.0);
            let w = config.vector_weight;
            (1.0 - w) * lexical + w * vector
        }
        Fusion::Rrf => {
            let k = config.rrf_k as f64;
            [candidate.lexical, candidate.vector]
                .iter()
                .flatten()
                .map(|(rank, _)| 1.0 / (k + (*rank + 1) as f64))
                .sum()
        }
    }
}

fn technique_boost(
    techniques: &[TechniqueId],
    title: &str,
    text: &str,
    config: &RetrievalConfig,
) -> f64 {
    techniques
        .iter()
        .map(|t| t.match_weight(title).max(t.match_weight(text)))
        .fold(0.0, f64::max)
        * config.technique_boost
}

/// Score desc, then newest document, then document id, then position.
pub fn compare_passages(a: &Passage, b: &Passage) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.provenance.retrieved_at.cmp(&a.provenance.retrieved_at))
        .then_with(|| a.provenance.document_id.cmp(&b.provenance.document_id))
        .then_with(|| a.provenance.offset_range.cmp(&b.provenance.offset_range))
}

/// Drop passages whose terms largely repeat a higher-ranked passage of the same document.
fn dedup(passages: Vec<Passage>, threshold: f64) -> Vec<Passage> {
    let mut kept_terms: HashMap<String, Vec<HashSet<String>>> = HashMap::new();
    let mut kept = Vec::with_capacity(passages.len());
    for passage in passages {
        let terms = term_set(&passage.text);
        let seen = kept_terms
            .entry(passage.provenance.document_id.clone())
            .or_default();
        if seen.iter().any(|other| jaccard(&terms, other) > threshold) {
            tracing::trace!(chunk_id = %passage.chunk_id, "near-duplicate passage dropped");
            continue;
        }
        seen.push(terms);
        kept.push(passage);
    }
    kept
}

/// BM25 candidates as `(chunk id, score normalized to the best candidate)`.
fn lexical_candidates(
    conn: &Connection,
    expression: &str,
    source: Option<Source>,
    limit: usize,
) -> Result<Vec<(String, f64)>> {
    // LEFT JOINs keep entries whose rows vanished so they can be reported.
    let mut stmt = conn.prepare_cached(
        "SELECT chunks_fts.rowid, c.id, bm25(chunks_fts) FROM chunks_fts \
         LEFT JOIN chunks c ON c.rowid = chunks_fts.rowid \
         LEFT JOIN documents d ON d.id = c.document_id \
         WHERE chunks_fts MATCH ?1 \
           AND (d.id IS NULL OR (d.superseded_by IS NULL AND (?2 IS NULL OR d.source = ?2))) \
         ORDER BY bm25(chunks_fts) LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(
            params![expression, source.map(|s| s.as_str()), limit as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            },
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    // bm25() is negative; more negative is better.
    let mut scored: Vec<(String, f64)> = Vec::with_capacity(rows.len());
    for (rowid, chunk_id, bm25) in rows {
        match chunk_id {
            Some(id) => scored.push((id, -bm25)),
            None => tracing::warn!(rowid, "lexical entry references a missing chunk, skipped"),
        }
    }
    let best = scored.iter().map(|(_, s)| *s).fold(0.0, f64::max);
    if best > 0.0 {
        scored.iter_mut().for_each(|(_, s)| *s = (*s / best).clamp(0.0, 1.0));
    }
    Ok(scored)
}

/// KNN candidates as `(chunk id, cosine similarity clamped to [0, 1])`.
fn vector_candidates(
    conn: &Connection,
    embedding: &[f32],
    limit: usize,
) -> Result<Vec<(String, f64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT chunk_id, distance FROM chunks_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![embedding_to_bytes(embedding), limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows
        .into_iter()
        .map(|(id, distance)| (id, l2_to_cosine(distance).max(0.0)))
        .collect())
}

struct HydratedRow {
    chunk_id: String,
    text: String,
    superseded: bool,
    provenance: Provenance,
}

/// Load chunk text and document provenance. Chunks without a readable
/// document row are skipped with a warning.
fn hydrate(conn: &Connection, ids: &[&str]) -> Result<Vec<HydratedRow>> {
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT c.id, c.text, c.start_offset, c.end_offset, c.document_id, \
                d.id, d.source, d.title, d.retrieved_at, d.superseded_by \
         FROM chunks c LEFT JOIN documents d ON d.id = c.document_id \
         WHERE c.id IN ({})",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

    let mut rows = stmt.query(params.as_slice())?;
    let mut hydrated = Vec::with_capacity(ids.len());
    while let Some(row) = rows.next()? {
        let chunk_id: String = row.get(0)?;
        let parsed = (|| -> rusqlite::Result<Option<HydratedRow>> {
            let Some(document_id) = row.get::<_, Option<String>>(5)? else {
                return Ok(None);
            };
            Ok(Some(HydratedRow {
                chunk_id: chunk_id.clone(),
                text: row.get(1)?,
                superseded: row.get::<_, Option<String>>(9)?.is_some(),
                provenance: Provenance {
                    source: parse_source(6, row.get(6)?)?,
                    title: row.get(7)?,
                    document_id,
                    retrieved_at: row.get(8)?,
                    offset_range: OffsetRange {
                        start: row.get::<_, i64>(2)? as usize,
                        end: row.get::<_, i64>(3)? as usize,
                    },
                },
            }))
        })();
        match parsed {
            Ok(Some(h)) => hydrated.push(h),
            Ok(None) => {
                let document_id: Option<String> = row.get(4).ok();
                tracing::warn!(chunk_id = %chunk_id, ?document_id, "chunk references a missing document, skipped");
            }
            Err(e) => tracing::warn!(chunk_id = %chunk_id, error = %e, "unreadable candidate row, skipped"),
        }
    }

    if hydrated.len() < ids.len() {
        tracing::debug!(
            requested = ids.len(),
            found = hydrated.len(),
            "some candidates had no chunk row"
        );
    }
    Ok(hydrated)
}
