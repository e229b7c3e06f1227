//! Memory data model.
//!
//! [`Role`] distinguishes conversation turns from pinned facts, [`MemoryRecord`]
//! is one stored entry, and [`ForgetTarget`] selects what `forget` tombstones.
//! Nothing here refers to an inference model.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    User,
    Assistant,
    /// A standing fact kept ahead of conversation turns in every context bundle.
    PinnedFact,
}

impl Role {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::PinnedFact => "pinned-fact",
        }
    }

    pub fn is_turn(&self) -> bool {
        !matches!(self, Self::PinnedFact)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "pinned-fact" | "pinned_fact" | "fact" => Ok(Self::PinnedFact),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryRecord {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: String,
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

/// What `forget` should tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgetTarget {
    /// One record by id.
    Id(String),
    /// Every live record whose content contains the keyword (case-insensitive).
    Keyword(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub limit: usize,
    pub include_deleted: bool,
    /// Case-insensitive substring filter on content.
    pub contains: Option<String>,
}

impl ReadOptions {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub live: u64,
    pub tombstoned: u64,
    pub pinned_facts: u64,
    pub last_activity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryLogEntry {
    pub operation: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub created_at: String,
}
