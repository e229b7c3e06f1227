//! Parameter shapes for every invocation kind. Shared by the router, the CLI
//! and the MCP tools, so all three accept exactly the same input.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::corpus::Source;
use crate::error::{CoreError, Result};
use crate::memory::{ForgetTarget, Role};

fn parse_source(kind: &str, value: Option<&str>) -> Result<Option<Source>> {
    value
        .map(|s| s.parse::<Source>().map_err(|e| CoreError::invalid(kind, e)))
        .transpose()
}

fn require_non_empty(kind: &str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CoreError::invalid(kind, format!("{field} must not be empty")));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DocumentParams {
    #[schemars(description = "Source corpus: wikipedia, mitre_attack, arxiv, or other")]
    pub source: String,

    #[schemars(description = "Document title")]
    pub title: String,

    #[schemars(description = "Full document text")]
    pub raw_text: String,

    #[schemars(description = "RFC 3339 retrieval timestamp (default: now)")]
    #[serde(default)]
    pub retrieved_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct IngestParams {
    #[schemars(description = "Documents to ingest inline")]
    #[serde(default)]
    pub documents: Vec<DocumentParams>,

    #[schemars(description = "File or directory to load (.jsonl, .json, STIX bundle, .txt, .md)")]
    #[serde(default)]
    pub path: Option<String>,

    #[schemars(description = "Source applied to documents loaded from path")]
    #[serde(default)]
    pub source: Option<String>,
}

impl IngestParams {
    pub fn source(&self) -> Result<Option<Source>> {
        parse_source("ingest", self.source.as_deref())
    }

    fn validate(&self) -> Result<()> {
        if self.documents.is_empty() && self.path.is_none() {
            return Err(CoreError::invalid("ingest", "either documents or path is required"));
        }
        self.source()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RetrieveParams {
    #[schemars(description = "Query text; a prefix such as 'mitre:' or 'wiki:' restricts the source")]
    pub query: String,

    #[schemars(description = "Maximum passages to return (default from config)")]
    #[serde(default)]
    pub top_k: Option<usize>,

    #[schemars(description = "Restrict to one source")]
    #[serde(default)]
    pub source: Option<String>,

    #[schemars(description = "Latency budget in milliseconds (default from config)")]
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RetrieveParams {
    pub fn source(&self) -> Result<Option<Source>> {
        parse_source("retrieve", self.source.as_deref())
    }

    fn validate(&self) -> Result<()> {
        require_non_empty("retrieve", "query", &self.query)?;
        if self.top_k == Some(0) {
            return Err(CoreError::invalid("retrieve", "top_k must be at least 1"));
        }
        self.source()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MemoryReadParams {
    #[schemars(description = "Session to read")]
    pub session_id: String,

    #[schemars(description = "Maximum records, most recent first (default from config)")]
    #[serde(default)]
    pub limit: Option<usize>,

    #[schemars(description = "Include tombstoned records (default: false)")]
    #[serde(default)]
    pub include_deleted: Option<bool>,

    #[schemars(description = "Only records containing this text (case-insensitive)")]
    #[serde(default)]
    pub contains: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MemoryWriteParams {
    #[schemars(description = "Session to append to")]
    pub session_id: String,

    #[schemars(description = "user, assistant, or pinned-fact")]
    pub role: String,

    #[schemars(description = "Record content")]
    pub content: String,
}

impl MemoryWriteParams {
    pub fn role(&self) -> Result<Role> {
        self.role
            .parse::<Role>()
            .map_err(|e| CoreError::invalid("memory-write", e))
    }

    fn validate(&self) -> Result<()> {
        require_non_empty("memory-write", "session_id", &self.session_id)?;
        require_non_empty("memory-write", "content", &self.content)?;
        self.role()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SessionParams {
    #[schemars(description = "Session id")]
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MemoryForgetParams {
    #[schemars(description = "Session id")]
    pub session_id: String,

    #[schemars(description = "Tombstone this record id")]
    #[serde(default)]
    pub id: Option<String>,

    #[schemars(description = "Tombstone every live record containing this keyword")]
    #[serde(default)]
    pub keyword: Option<String>,
}

impl MemoryForgetParams {
    pub fn target(&self) -> Result<ForgetTarget> {
        match (&self.id, &self.keyword) {
            (Some(id), None) => Ok(ForgetTarget::Id(id.clone())),
            (None, Some(keyword)) if !keyword.trim().is_empty() => {
                Ok(ForgetTarget::Keyword(keyword.clone()))
            }
            _ => Err(CoreError::invalid(
                "memory-forget",
                "exactly one of id or a non-empty keyword is required",
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MemoryCompactParams {
    #[schemars(description = "Compact only this session (default: all sessions)")]
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ContextAssembleParams {
    #[schemars(description = "Question the context is assembled for")]
    pub query: String,

    #[schemars(description = "Session whose memory is included")]
    pub session_id: String,

    #[schemars(description = "Token budget (default from config)")]
    #[serde(default)]
    pub token_budget: Option<usize>,

    #[schemars(description = "Also render the plain-text inference prompt (default: false)")]
    #[serde(default)]
    pub render_prompt: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CorpusPurgeParams {
    #[schemars(description = "Id of the document to remove with its chunks")]
    pub document_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CorpusStatsParams {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct IndexCheckParams {
    #[schemars(description = "Rebuild the lexical and vector indexes from chunks (default: false)")]
    #[serde(default)]
    pub repair: Option<bool>,
}

/// The closed set of things the router will do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "parameters", rename_all = "kebab-case")]
pub enum ToolRequest {
    Ingest(IngestParams),
    Retrieve(RetrieveParams),
    MemoryRead(MemoryReadParams),
    MemoryWrite(MemoryWriteParams),
    MemoryClear(SessionParams),
    MemoryRestore(SessionParams),
    MemoryForget(MemoryForgetParams),
    MemoryCompact(MemoryCompactParams),
    ContextAssemble(ContextAssembleParams),
    CorpusPurge(CorpusPurgeParams),
    CorpusStats(CorpusStatsParams),
    IndexCheck(IndexCheckParams),
}

impl ToolRequest {
    pub const KINDS: [&'static str; 12] = [
        "ingest",
        "retrieve",
        "memory-read",
        "memory-write",
        "memory-clear",
        "memory-restore",
        "memory-forget",
        "memory-compact",
        "context-assemble",
        "corpus-purge",
        "corpus-stats",
        "index-check",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ingest(_) => "ingest",
            Self::Retrieve(_) => "retrieve",
            Self::MemoryRead(_) => "memory-read",
            Self::MemoryWrite(_) => "memory-write",
            Self::MemoryClear(_) => "memory-clear",
            Self::MemoryRestore(_) => "memory-restore",
            Self::MemoryForget(_) => "memory-forget",
            Self::MemoryCompact(_) => "memory-compact",
            Self::ContextAssemble(_) => "context-assemble",
            Self::CorpusPurge(_) => "corpus-purge",
            Self::CorpusStats(_) => "corpus-stats",
            Self::IndexCheck(_) => "index-check",
        }
    }

    /// Reject requests that deserialized but cannot be carried out.
    pub fn validate(&self) -> Result<()> {
        let kind = self.kind();
        match self {
            Self::Ingest(p) => p.validate(),
            Self::Retrieve(p) => p.validate(),
            Self::MemoryRead(p) => {
                require_non_empty(kind, "session_id", &p.session_id)?;
                if p.limit == Some(0) {
                    return Err(CoreError::invalid(kind, "limit must be at least 1"));
                }
                Ok(())
            }
            Self::MemoryWrite(p) => p.validate(),
            Self::MemoryClear(p) | Self::MemoryRestore(p) => {
                require_non_empty(kind, "session_id", &p.session_id)
            }
            Self::MemoryForget(p) => {
                require_non_empty(kind, "session_id", &p.session_id)?;
                p.target().map(|_| ())
            }
            Self::MemoryCompact(p) => match &p.session_id {
                Some(id) => require_non_empty(kind, "session_id", id),
                None => Ok(()),
            },
            Self::ContextAssemble(p) => {
                require_non_empty(kind, "query", &p.query)?;
                require_non_empty(kind, "session_id", &p.session_id)
            }
            Self::CorpusPurge(p) => require_non_empty(kind, "document_id", &p.document_id),
            Self::CorpusStats(_) | Self::IndexCheck(_) => Ok(()),
        }
    }
}
