//! Corpus data model: [`Source`], [`RawDocument`] (the ingestion boundary),
//! [`Document`] (a stored, immutable version) and [`Chunk`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Wikipedia,
    MitreAttack,
    Arxiv,
    Other,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::Wikipedia,
        Source::MitreAttack,
        Source::Arxiv,
        Source::Other,
    ];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wikipedia => "wikipedia",
            Self::MitreAttack => "mitre_attack",
            Self::Arxiv => "arxiv",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Source {
    type Err = String;

    /// Accepts the canonical names plus the short aliases operators type.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wikipedia" | "wiki" | "kiwix" => Ok(Self::Wikipedia),
            "mitre_attack" | "mitre" | "attack" | "mitre-attack" => Ok(Self::MitreAttack),
            "arxiv" => Ok(Self::Arxiv),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown source: {other}")),
        }
    }
}

/// A document as handed to the indexer, before it has an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub source: Source,
    pub title: String,
    pub raw_text: String,
    /// Defaults to ingestion time when absent.
    #[serde(default)]
    pub retrieved_at: Option<String>,
}

impl RawDocument {
    pub fn new(source: Source, title: impl Into<String>, raw_text: impl Into<String>) -> Self {
        Self {
            source,
            title: title.into(),
            raw_text: raw_text.into(),
            retrieved_at: None,
        }
    }

    /// Content fingerprint: identical source, title and text always map to the same id.
    pub fn fingerprint(&self) -> String {
        content_fingerprint(self.source.as_str(), &self.title, &self.raw_text)
    }

    /// Logical identity shared by every version of the same titled document.
    pub fn lineage(&self) -> String {
        lineage_of(self.source, &self.title)
    }
}

/// Also used for records whose source never parsed, so a rejection still
/// carries a stable id.
pub(crate) fn content_fingerprint(source: &str, title: &str, raw_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0]);
    hasher.update(title.as_bytes());
    hasher.update([0]);
    hasher.update(raw_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub(crate) fn lineage_of(source: Source, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(title.trim().to_lowercase().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A stored document version. Never mutated except for `superseded_by`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub lineage: String,
    pub source: Source,
    pub title: String,
    pub raw_text: String,
    pub retrieved_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

/// Byte range `[start, end)` into the owning document's `raw_text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OffsetRange {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub offset_range: OffsetRange,
    pub text: String,
    pub fingerprint: String,
}

pub(crate) fn text_fingerprint(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Current time in the single timestamp format used across both databases.
pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
