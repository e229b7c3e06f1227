//! Retrieval engine: ranked, deduplicated, provenance-tagged passages.
//!
//! [`search::search`] is the synchronous ranking pipeline over one
//! connection. [`RetrievalEngine`] wraps it for async callers: it embeds the
//! query, runs the search on a pooled reader inside a read transaction (one
//! WAL snapshot), and enforces the latency budget by interrupting the SQLite
//! statement when the budget expires.

pub mod query;
pub mod search;

use std::sync::Arc;
use std::time::Duration;

pub use search::{Passage, Provenance};

use crate::config::RetrievalConfig;
use crate::corpus::Source;
use crate::db::ConnectionPool;
use crate::embedding::EmbeddingProvider;
use crate::error::{CoreError, Result};

#[derive(Clone)]
pub struct RetrievalEngine {
    readers: Arc<ConnectionPool>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        readers: Arc<ConnectionPool>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            readers,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Run a query within `timeout_ms` (the configured budget when `None`).
    pub async fn query(
        &self,
        text: &str,
        top_k: usize,
        source: Option<Source>,
        timeout_ms: Option<u64>,
    ) -> Result<Vec<Passage>> {
        let budget_ms = timeout_ms.unwrap_or(self.config.timeout_ms);
        let budget = Duration::from_millis(budget_ms);
        let timed_out = || CoreError::RetrievalTimeout {
            query: text.to_string(),
            budget_ms,
        };
        // an exhausted budget never starts a query
        if budget.is_zero() {
            return Err(timed_out());
        }

        let mut conn = self.readers.get()?;
        let interrupt = conn.get_interrupt_handle();

        let embedder = self.embedder.clone();
        let config = self.config.clone();
        let query = text.to_string();

        let task = tokio::task::spawn_blocking(move || -> Result<Vec<Passage>> {
            let embedding = match vector_provider(&conn, embedder.as_deref())? {
                Some(provider) => Some(
                    provider
                        .embed(&query)
                        .map_err(|e| CoreError::Embedding { cause: format!("{e:#}") })?,
                ),
                None => None,
            };
            let tx = conn.transaction()?;
            let passages = search::search(
                &tx,
                &query,
                embedding.as_deref(),
                top_k,
                source,
                &config,
            )?;
            tx.finish()?;
            Ok(passages)
        });

        match tokio::time::timeout(budget, task).await {
            Ok(joined) => {
                let result = joined.map_err(|e| CoreError::storage("retrieval worker", e))?;
                match result {
                    Err(CoreError::StorageUnavailable { source, .. })
                        if is_interrupt(source.as_ref()) =>
                    {
                        Err(timed_out())
                    }
                    other => other,
                }
            }
            Err(_) => {
                interrupt.interrupt();
                tracing::warn!(query = %text, budget_ms, "retrieval interrupted after exceeding its budget");
                Err(timed_out())
            }
        }
    }
}

/// The provider to embed queries with, or `None` for lexical-only search.
/// Vectors stored under a different model are not comparable with the
/// configured provider's, so a mismatch disables the vector path.
fn vector_provider<'a>(
    conn: &rusqlite::Connection,
    embedder: Option<&'a dyn EmbeddingProvider>,
) -> Result<Option<&'a dyn EmbeddingProvider>> {
    let Some(provider) = embedder else {
        return Ok(None);
    };
    match crate::db::migrations::get_embedding_model(conn)? {
        Some(stored) if stored != provider.model_id() => {
            tracing::warn!(
                stored = %stored,
                configured = %provider.model_id(),
                "embedding model mismatch, falling back to lexical retrieval"
            );
            Ok(None)
        }
        _ => Ok(Some(provider)),
    }
}

fn is_interrupt(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::OperationInterrupted
    )
}
