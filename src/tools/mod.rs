use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use serde::Serialize;

use crate::router::params::{
    ContextAssembleParams, CorpusPurgeParams, CorpusStatsParams, IndexCheckParams, IngestParams,
    MemoryCompactParams, MemoryForgetParams, MemoryReadParams, MemoryWriteParams, RetrieveParams,
    SessionParams,
};
use crate::router::Router;

/// The Scriptorium MCP tool handler. Every tool is a thin shim over
/// [`Router::invoke`], so MCP calls are validated and audit-logged exactly like
/// CLI commands.
#[derive(Clone)]
pub struct ScriptoriumTools {
    tool_router: ToolRouter<Self>,
    router: Router,
}

impl ScriptoriumTools {
    async fn invoke<P: Serialize>(&self, kind: &str, params: P) -> Result<String, String> {
        let params =
            serde_json::to_value(params).map_err(|e| format!("serialization failed: {e}"))?;
        tracing::info!(kind, "mcp tool called");
        let outcome = self
            .router
            .invoke(kind, params)
            .await
            .map_err(|e| e.to_string())?;
        serde_json::to_string(&outcome).map_err(|e| format!("serialization failed: {e}"))
    }
}

#[tool_router]
impl ScriptoriumTools {
    pub fn new(router: Router) -> Self {
        Self {
            tool_router: Self::tool_router(),
            router,
        }
    }

    #[tool(description = "Ingest documents (inline, or from a file/directory path) into the offline corpus index. Re-ingesting unchanged content is a no-op.")]
    async fn ingest(&self, Parameters(params): Parameters<IngestParams>) -> Result<String, String> {
        self.invoke("ingest", params).await
    }

    #[tool(description = "Retrieve ranked, provenance-tagged passages from the offline corpus (Wikipedia, MITRE ATT&CK, arXiv).")]
    async fn retrieve(
        &self,
        Parameters(params): Parameters<RetrieveParams>,
    ) -> Result<String, String> {
        self.invoke("retrieve", params).await
    }

    #[tool(description = "Read a session's memory, most recent first.")]
    async fn memory_read(
        &self,
        Parameters(params): Parameters<MemoryReadParams>,
    ) -> Result<String, String> {
        self.invoke("memory-read", params).await
    }

    #[tool(description = "Append a conversation turn or pinned fact to a session's memory.")]
    async fn memory_write(
        &self,
        Parameters(params): Parameters<MemoryWriteParams>,
    ) -> Result<String, String> {
        self.invoke("memory-write", params).await
    }

    #[tool(description = "Tombstone every live record of a session. Reversible with memory_restore until compacted.")]
    async fn memory_clear(
        &self,
        Parameters(params): Parameters<SessionParams>,
    ) -> Result<String, String> {
        self.invoke("memory-clear", params).await
    }

    #[tool(description = "Restore tombstoned records of a session that have not been compacted.")]
    async fn memory_restore(
        &self,
        Parameters(params): Parameters<SessionParams>,
    ) -> Result<String, String> {
        self.invoke("memory-restore", params).await
    }

    #[tool(description = "Tombstone one memory record by id, or every record containing a keyword.")]
    async fn memory_forget(
        &self,
        Parameters(params): Parameters<MemoryForgetParams>,
    ) -> Result<String, String> {
        self.invoke("memory-forget", params).await
    }

    #[tool(description = "Permanently delete tombstoned memory records. Not reversible.")]
    async fn memory_compact(
        &self,
        Parameters(params): Parameters<MemoryCompactParams>,
    ) -> Result<String, String> {
        self.invoke("memory-compact", params).await
    }

    #[tool(description = "Assemble a token-budgeted context bundle from retrieval and a session's memory, optionally rendered as an inference prompt.")]
    async fn context_assemble(
        &self,
        Parameters(params): Parameters<ContextAssembleParams>,
    ) -> Result<String, String> {
        self.invoke("context-assemble", params).await
    }

    #[tool(description = "Remove a document with its chunks and index entries.")]
    async fn corpus_purge(
        &self,
        Parameters(params): Parameters<CorpusPurgeParams>,
    ) -> Result<String, String> {
        self.invoke("corpus-purge", params).await
    }

    #[tool(description = "Corpus statistics: documents by source, chunks, embedding model.")]
    async fn corpus_stats(
        &self,
        Parameters(params): Parameters<CorpusStatsParams>,
    ) -> Result<String, String> {
        self.invoke("corpus-stats", params).await
    }

    #[tool(description = "Check the lexical and vector indexes against the chunk table; optionally rebuild them.")]
    async fn index_check(
        &self,
        Parameters(params): Parameters<IndexCheckParams>,
    ) -> Result<String, String> {
        self.invoke("index-check", params).await
    }
}

#[tool_handler]
impl ServerHandler for ScriptoriumTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Scriptorium retrieves passages from an offline corpus and keeps explicit, \
                 reversible session memory. Nothing runs unless a tool is called: use retrieve \
                 for passages, memory_write/memory_read for memory, and context_assemble to \
                 build a bounded context for an inference call."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
