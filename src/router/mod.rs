//! Tool router: the single entry point for every explicit invocation.
//!
//! Nothing reaches the corpus, the memory store or the context assembler
//! except through [`Router::dispatch`], and every dispatch is written to the
//! audit log whatever its outcome.

pub mod audit;
pub mod params;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use rusqlite::Connection;
use serde::Serialize;

pub use audit::{AuditEntry, AuditLog};
pub use params::ToolRequest;

use crate::config::ScriptoriumConfig;
use crate::context::{ContextAssembler, ContextBundle, InferenceRequest};
use crate::corpus::indexer::{self, IndexCheckReport};
use crate::corpus::loader;
use crate::corpus::store::{self as corpus_store, CorpusStats};
use crate::corpus::types::content_fingerprint;
use crate::corpus::{BatchReport, RawDocument};
use crate::db::{open_corpus_database, ConnectionPool};
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{CoreError, IngestError, Result};
use crate::memory::{MemoryRecord, MemoryService, ReadOptions};
use crate::retrieval::{Passage, RetrievalEngine};
use params::IngestParams;

/// A request plus the moment it was issued. Only ever persisted as an audit line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub request: ToolRequest,
    pub issued_at: String,
}

impl ToolInvocation {
    pub fn new(request: ToolRequest) -> Self {
        Self {
            request,
            issued_at: crate::corpus::types::now_timestamp(),
        }
    }

    /// Build an invocation from a kind name and JSON parameters.
    pub fn parse(kind: &str, parameters: serde_json::Value) -> Result<Self> {
        if !ToolRequest::KINDS.contains(&kind) {
            return Err(CoreError::UnsupportedInvocation {
                kind: kind.to_string(),
            });
        }
        let parameters = match parameters {
            serde_json::Value::Null => serde_json::json!({}),
            other => other,
        };
        let request: ToolRequest =
            serde_json::from_value(serde_json::json!({"kind": kind, "parameters": parameters}))
                .map_err(|e| CoreError::invalid(kind, e.to_string()))?;
        request.validate()?;
        Ok(Self::new(request))
    }

    pub fn kind(&self) -> &'static str {
        self.request.kind()
    }

    pub fn parameters(&self) -> serde_json::Value {
        serde_json::to_value(&self.request)
            .ok()
            .and_then(|mut v| v.get_mut("parameters").map(serde_json::Value::take))
            .unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    /// Files or records the loader could not turn into documents.
    pub skipped: Vec<String>,
    #[serde(flatten)]
    pub batch: BatchReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextOutcome {
    pub bundle: ContextBundle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Result of a dispatch, tagged with the kind that produced it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "result", rename_all = "kebab-case")]
pub enum ToolOutcome {
    Ingest(IngestOutcome),
    Retrieve { passages: Vec<Passage> },
    MemoryRead { records: Vec<MemoryRecord> },
    MemoryWrite(MemoryRecord),
    MemoryClear { session_id: String, count: usize },
    MemoryRestore { session_id: String, count: usize },
    MemoryForget { session_id: String, count: usize },
    MemoryCompact { session_id: Option<String>, count: usize },
    ContextAssemble(ContextOutcome),
    CorpusPurge { document_id: String, purged: bool },
    CorpusStats(CorpusStats),
    IndexCheck(IndexCheckReport),
}

/// Owns every component and routes invocations to them.
#[derive(Clone)]
pub struct Router {
    config: Arc<ScriptoriumConfig>,
    writer: Arc<Mutex<Connection>>,
    readers: Arc<ConnectionPool>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    retrieval: RetrievalEngine,
    memory: MemoryService,
    assembler: ContextAssembler,
    audit: Arc<AuditLog>,
}

impl Router {
    /// Open both databases under the configured data dir and build the
    /// embedding provider.
    pub fn open(config: ScriptoriumConfig) -> Result<Self> {
        let embedder = create_provider(&config.embedding)
            .map_err(|e| CoreError::Embedding {
                cause: format!("{e:#}"),
            })?
            .map(Arc::from);
        Self::with_embedder(config, embedder)
    }

    pub fn with_embedder(
        config: ScriptoriumConfig,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self> {
        let writer = open_corpus_database(config.corpus_db_path())?;
        let readers = ConnectionPool::new(config.corpus_db_path(), config.storage.reader_pool_size);
        let retrieval =
            RetrievalEngine::new(Arc::clone(&readers), embedder.clone(), config.retrieval.clone());
        let memory = MemoryService::open(
            config.memory_db_path(),
            config.storage.reader_pool_size,
            config.memory.clone(),
        )?;
        let assembler = ContextAssembler::new(
            retrieval.clone(),
            memory.clone(),
            config.context.clone(),
            config.memory.clone(),
        );
        let audit = Arc::new(AuditLog::new(config.audit_log_path()));

        tracing::info!(
            data_dir = %config.storage.data_dir,
            embedder = embedder.as_ref().map(|e| e.model_id()).as_deref().unwrap_or("none"),
            "router ready"
        );

        Ok(Self {
            config: Arc::new(config),
            writer: Arc::new(Mutex::new(writer)),
            readers,
            embedder,
            retrieval,
            memory,
            assembler,
            audit,
        })
    }

    pub fn config(&self) -> &ScriptoriumConfig {
        &self.config
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Read-only inspection of memory outside the invocation set.
    pub fn memory(&self) -> &MemoryService {
        &self.memory
    }

    /// Model id of the configured embedding provider, `None` when lexical only.
    pub fn embedding_model(&self) -> Option<String> {
        self.embedder.as_ref().map(|e| e.model_id())
    }

    /// Parse and dispatch in one step. Unknown kinds and malformed parameters
    /// are audit-logged as well.
    pub async fn invoke(&self, kind: &str, parameters: serde_json::Value) -> Result<ToolOutcome> {
        match ToolInvocation::parse(kind, parameters.clone()) {
            Ok(invocation) => self.dispatch(invocation).await,
            Err(e) => {
                self.record(
                    &crate::corpus::types::now_timestamp(),
                    kind,
                    parameters,
                    Err(&e),
                    0,
                );
                Err(e)
            }
        }
    }

    pub async fn dispatch(&self, invocation: ToolInvocation) -> Result<ToolOutcome> {
        let started = Instant::now();
        let kind = invocation.kind();
        tracing::debug!(kind, issued_at = %invocation.issued_at, "dispatching");

        let result = self.route(invocation.request.clone()).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.record(
            &invocation.issued_at,
            kind,
            invocation.parameters(),
            result.as_ref().map(|_| ()),
            elapsed_ms,
        );
        result
    }

    fn record(
        &self,
        issued_at: &str,
        kind: &str,
        parameters: serde_json::Value,
        result: std::result::Result<(), &CoreError>,
        elapsed_ms: u64,
    ) {
        let (outcome, error) = match result {
            Ok(()) => ("ok".to_string(), None),
            Err(e) => (e.label().to_string(), Some(e.to_string())),
        };
        match &error {
            None => tracing::info!(kind, elapsed_ms, outcome = %outcome, "invocation handled"),
            Some(err) => {
                tracing::warn!(kind, elapsed_ms, outcome = %outcome, error = %err, "invocation failed")
            }
        }
        let entry = AuditEntry {
            issued_at: issued_at.to_string(),
            kind: kind.to_string(),
            parameters: audit_parameters(parameters),
            outcome,
            error,
            elapsed_ms,
        };
        // the invocation already ran; a lost audit line must not change its result
        if let Err(e) = self.audit.append(&entry) {
            tracing::error!(error = %e, kind, "failed to write audit line");
        }
    }

    async fn route(&self, request: ToolRequest) -> Result<ToolOutcome> {
        match request {
            ToolRequest::Ingest(p) => self.ingest(p).await.map(ToolOutcome::Ingest),
            ToolRequest::Retrieve(p) => {
                let source = p.source()?;
                let top_k = p.top_k.unwrap_or(self.config.retrieval.default_top_k);
                let passages = self
                    .retrieval
                    .query(&p.query, top_k, source, p.timeout_ms)
                    .await?;
                Ok(ToolOutcome::Retrieve { passages })
            }
            ToolRequest::MemoryRead(p) => {
                let options = ReadOptions {
                    limit: p.limit.unwrap_or(self.config.memory.read_limit),
                    include_deleted: p.include_deleted.unwrap_or(false),
                    contains: p.contains,
                };
                let records = self.memory.read(&p.session_id, options).await?;
                Ok(ToolOutcome::MemoryRead { records })
            }
            ToolRequest::MemoryWrite(p) => {
                let role = p.role()?;
                let record = self.memory.append(&p.session_id, role, &p.content).await?;
                Ok(ToolOutcome::MemoryWrite(record))
            }
            ToolRequest::MemoryClear(p) => {
                let count = self.memory.clear(&p.session_id).await?;
                Ok(ToolOutcome::MemoryClear {
                    session_id: p.session_id,
                    count,
                })
            }
            ToolRequest::MemoryRestore(p) => {
                let count = self.memory.restore(&p.session_id).await?;
                Ok(ToolOutcome::MemoryRestore {
                    session_id: p.session_id,
                    count,
                })
            }
            ToolRequest::MemoryForget(p) => {
                let target = p.target()?;
                let count = self.memory.forget(&p.session_id, target).await?;
                Ok(ToolOutcome::MemoryForget {
                    session_id: p.session_id,
                    count,
                })
            }
            ToolRequest::MemoryCompact(p) => {
                let count = self.memory.compact(p.session_id.as_deref()).await?;
                Ok(ToolOutcome::MemoryCompact {
                    session_id: p.session_id,
                    count,
                })
            }
            ToolRequest::ContextAssemble(p) => {
                let bundle = self
                    .assembler
                    .assemble(&p.query, &p.session_id, p.token_budget)
                    .await?;
                let prompt = p
                    .render_prompt
                    .unwrap_or(false)
                    .then(|| InferenceRequest::from_bundle(&bundle).render_prompt());
                Ok(ToolOutcome::ContextAssemble(ContextOutcome { bundle, prompt }))
            }
            ToolRequest::CorpusPurge(p) => {
                let id = p.document_id.clone();
                let purged = self
                    .with_writer(move |conn| corpus_store::purge(conn, &id))
                    .await?;
                Ok(ToolOutcome::CorpusPurge {
                    document_id: p.document_id,
                    purged,
                })
            }
            ToolRequest::CorpusStats(_) => {
                let readers = Arc::clone(&self.readers);
                let stats = tokio::task::spawn_blocking(move || {
                    let conn = readers.get()?;
                    corpus_store::stats(&conn)
                })
                .await
                .map_err(|e| CoreError::storage("stats worker", e))??;
                Ok(ToolOutcome::CorpusStats(stats))
            }
            ToolRequest::IndexCheck(p) => {
                let repair = p.repair.unwrap_or(false);
                let embedder = self.embedder.clone();
                let report = self
                    .with_writer(move |conn| indexer::check_index(conn, repair, embedder.as_deref()))
                    .await?;
                Ok(ToolOutcome::IndexCheck(report))
            }
        }
    }

    async fn with_writer<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut conn = writer
                .lock()
                .map_err(|_| CoreError::storage("corpus writer", "writer lock poisoned"))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| CoreError::storage("corpus worker", e))?
    }

    async fn ingest(&self, params: IngestParams) -> Result<IngestOutcome> {
        let mut documents = Vec::new();
        let mut rejected = Vec::new();
        for doc in params.documents.iter() {
            match doc.source.parse() {
                Ok(source) => documents.push(RawDocument {
                    source,
                    title: doc.title.clone(),
                    raw_text: doc.raw_text.clone(),
                    retrieved_at: doc.retrieved_at.clone(),
                }),
                Err(cause) => rejected.push(IngestError {
                    document_id: content_fingerprint(&doc.source, &doc.title, &doc.raw_text),
                    cause,
                }),
            }
        }

        let mut skipped = Vec::new();
        if let Some(path) = &params.path {
            let path = crate::config::expand_tilde(path);
            let source = params.source()?;
            let loaded = tokio::task::spawn_blocking(move || loader::load_path(&path, source))
                .await
                .map_err(|e| CoreError::storage("loader worker", e))?
                .map_err(|e| CoreError::invalid("ingest", format!("{e:#}")))?;
            documents.extend(loaded.documents);
            skipped = loaded.skipped;
        }

        let mut batch = indexer::ingest_batch(
            Arc::clone(&self.writer),
            documents,
            self.config.indexing.clone(),
            self.embedder.clone(),
        )
        .await?;
        batch.errors.extend(rejected);
        Ok(IngestOutcome { skipped, batch })
    }
}

/// Inline document bodies are summarized as `raw_text_bytes` so the audit
/// log stays small and does not duplicate corpus content.
fn audit_parameters(mut parameters: serde_json::Value) -> serde_json::Value {
    let documents = parameters
        .get_mut("documents")
        .and_then(serde_json::Value::as_array_mut);
    for doc in documents.into_iter().flatten() {
        let Some(fields) = doc.as_object_mut() else {
            continue;
        };
        if let Some(serde_json::Value::String(text)) = fields.remove("raw_text") {
            fields.insert("raw_text_bytes".into(), text.len().into());
        }
    }
    parameters
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn router(tmp: &TempDir) -> Router {
        Router::with_embedder(ScriptoriumConfig::with_data_dir(tmp.path()), None).unwrap()
    }

    #[test]
    fn parse_rejects_unknown_kind() {
        let err = ToolInvocation::parse("shell-exec", json!({})).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedInvocation { kind } if kind == "shell-exec"));
    }

    #[test]
    fn parse_rejects_malformed_parameters() {
        for (kind, params) in [
            ("retrieve", json!({"top_k": 3})),
            ("retrieve", json!({"query": "x", "top_k": 0})),
            ("retrieve", json!({"query": "x", "bogus": true})),
            ("memory-write", json!({"session_id": "s", "role": "system", "content": "hi"})),
            ("memory-forget", json!({"session_id": "s"})),
            ("memory-forget", json!({"session_id": "s", "id": "a", "keyword": "b"})),
            ("ingest", json!({})),
            ("corpus-purge", json!({"document_id": " "})),
        ] {
            let err = ToolInvocation::parse(kind, params.clone()).unwrap_err();
            assert!(
                matches!(err, CoreError::InvalidInvocation { .. }),
                "{kind} {params} gave {err:?}"
            );
        }
    }

    #[test]
    fn parse_accepts_every_kind() {
        for kind in ToolRequest::KINDS {
            let params = match kind {
                "ingest" => json!({"path": "/tmp/none"}),
                "retrieve" => json!({"query": "kerberos"}),
                "memory-read" | "memory-clear" | "memory-restore" => json!({"session_id": "s"}),
                "memory-write" => json!({"session_id": "s", "role": "user", "content": "hi"}),
                "memory-forget" => json!({"session_id": "s", "keyword": "hi"}),
                "context-assemble" => json!({"query": "q", "session_id": "s"}),
                "corpus-purge" => json!({"document_id": "abc"}),
                _ => serde_json::Value::Null,
            };
            let invocation = ToolInvocation::parse(kind, params).unwrap();
            assert_eq!(invocation.kind(), kind);
        }
    }

    #[tokio::test]
    async fn memory_round_trip_through_router() {
        let tmp = TempDir::new().unwrap();
        let router = router(&tmp);
        router
            .invoke("memory-write", json!({"session_id": "s", "role": "user", "content": "hello"}))
            .await
            .unwrap();
        let outcome = router
            .invoke("memory-read", json!({"session_id": "s"}))
            .await
            .unwrap();
        match outcome {
            ToolOutcome::MemoryRead { records } => assert_eq!(records[0].content, "hello"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_source_is_isolated_to_its_document() {
        let tmp = TempDir::new().unwrap();
        let router = router(&tmp);
        let outcome = router
            .invoke(
                "ingest",
                json!({"documents": [
                    {"source": "wikipedia", "title": "Kerberos", "raw_text": "Kerberos authenticates users."},
                    {"source": "myspace", "title": "Bad", "raw_text": "nope"}
                ]}),
            )
            .await
            .unwrap();
        let ToolOutcome::Ingest(report) = outcome else {
            panic!("expected ingest outcome");
        };
        assert_eq!(report.batch.reports.len(), 1);
        assert_eq!(report.batch.errors.len(), 1);
        assert!(report.batch.errors[0].cause.contains("myspace"));
    }

    #[tokio::test]
    async fn every_dispatch_is_audited() {
        let tmp = TempDir::new().unwrap();
        let router = router(&tmp);
        router.invoke("corpus-stats", json!({})).await.unwrap();
        router.invoke("memory-clear", json!({"session_id": "nobody"})).await.unwrap();
        router.invoke("launch-missiles", json!({})).await.unwrap_err();

        let entries = router.audit_log().entries().unwrap();
        let kinds: Vec<&str> = entries.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["corpus-stats", "memory-clear", "launch-missiles"]);
        assert_eq!(entries[1].outcome, "ok");
        assert_eq!(entries[1].parameters, json!({"session_id": "nobody"}));
        assert_eq!(entries[2].outcome, "unsupported_invocation");
    }

    #[tokio::test]
    async fn audit_summarizes_inline_document_text() {
        let tmp = TempDir::new().unwrap();
        let router = router(&tmp);
        let body = "Kerberos is a network authentication protocol. ".repeat(200);
        router
            .invoke(
                "ingest",
                json!({"documents": [{"source": "wikipedia", "title": "Kerberos", "raw_text": body}]}),
            )
            .await
            .unwrap();
        router
            .invoke(
                "ingest",
                json!({"documents": [{"source": "gopher", "title": "Bad", "raw_text": "abc"}], "extra": 1}),
            )
            .await
            .unwrap_err();

        let entries = router.audit_log().entries().unwrap();
        assert_eq!(entries.len(), 2);
        let ok = &entries[0].parameters["documents"][0];
        assert_eq!(ok["title"], "Kerberos");
        assert_eq!(ok["raw_text_bytes"], body.len());
        assert!(ok.get("raw_text").is_none());

        let rejected = &entries[1].parameters["documents"][0];
        assert_eq!(rejected["raw_text_bytes"], 3);
        assert!(rejected.get("raw_text").is_none());
        assert!(!serde_json::to_string(&entries).unwrap().contains("network authentication"));
    }
}
