//! Error taxonomy shared by every component.
//!
//! Lookup misses are not errors: they surface as `Option::None`. Everything
//! else carries enough context (document id, query text, session id) to
//! reproduce the failure.

use serde::Serialize;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Failure of a single document inside an ingestion batch.
#[derive(Debug, Clone, Error, Serialize)]
#[error("ingest failed for document {document_id}: {cause}")]
pub struct IngestError {
    pub document_id: String,
    pub cause: String,
}

#[derive(Debug, Error)]
pub enum CoreError {
    /// The backing medium could not be read or written. Never retried automatically.
    #[error("storage unavailable ({context}): {source}")]
    StorageUnavailable {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// The query exceeded its latency budget and was interrupted.
    #[error("retrieval timed out after {budget_ms} ms for query {query:?}")]
    RetrievalTimeout { query: String, budget_ms: u64 },

    #[error("unsupported invocation kind: {kind}")]
    UnsupportedInvocation { kind: String },

    #[error("invalid {kind} invocation: {reason}")]
    InvalidInvocation { kind: String, reason: String },

    #[error("embedding failed: {cause}")]
    Embedding { cause: String },
}

impl CoreError {
    pub fn storage(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::StorageUnavailable {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn invalid(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInvocation {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// Process exit code for the command surface: 2 for storage, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::StorageUnavailable { .. } => 2,
            _ => 1,
        }
    }

    /// Stable machine-readable name, used in audit lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::StorageUnavailable { .. } => "storage_unavailable",
            Self::Ingest(_) => "ingest_error",
            Self::RetrievalTimeout { .. } => "retrieval_timeout",
            Self::UnsupportedInvocation { .. } => "unsupported_invocation",
            Self::InvalidInvocation { .. } => "invalid_invocation",
            Self::Embedding { .. } => "embedding_error",
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::storage("sqlite", err)
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::storage("io", err)
    }
}

/// Attach a context string to storage failures.
pub trait StorageContext<T> {
    fn storage_context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T, E> StorageContext<T> for std::result::Result<T, E>
where
    E: Into<BoxError>,
{
    fn storage_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| CoreError::storage(context(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_command_surface() {
        let storage = CoreError::storage("open corpus.db", "disk gone");
        assert_eq!(storage.exit_code(), 2);
        assert_eq!(
            CoreError::UnsupportedInvocation { kind: "x".into() }.exit_code(),
            1
        );
        assert_eq!(CoreError::invalid("retrieve", "top_k").exit_code(), 1);
        assert_eq!(
            CoreError::RetrievalTimeout { query: "q".into(), budget_ms: 5 }.exit_code(),
            1
        );
    }

    #[test]
    fn messages_carry_context() {
        let err = CoreError::from(IngestError {
            document_id: "abc".into(),
            cause: "empty text".into(),
        });
        assert!(err.to_string().contains("abc"));
        assert!(err.to_string().contains("empty text"));

        let err = CoreError::RetrievalTimeout {
            query: "credential dumping".into(),
            budget_ms: 10,
        };
        assert!(err.to_string().contains("credential dumping"));
    }
}
