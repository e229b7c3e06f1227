//! Query text handling: routing prefixes, ATT&CK technique ids, FTS5 escaping.

use std::sync::OnceLock;

use regex::Regex;

use crate::corpus::Source;

const ROUTING_PREFIXES: &[(&str, Source)] = &[
    ("wikipedia:", Source::Wikipedia),
    ("wiki:", Source::Wikipedia),
    ("kiwix:", Source::Wikipedia),
    ("mitre:", Source::MitreAttack),
    ("attack:", Source::MitreAttack),
    ("arxiv:", Source::Arxiv),
];

/// An ATT&CK technique or sub-technique id, normalized to `T1234` / `T1234.001`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TechniqueId {
    pub base: String,
    pub sub: Option<String>,
}

impl TechniqueId {
    pub fn full(&self) -> String {
        match &self.sub {
            Some(sub) => format!("{}.{}", self.base, sub),
            None => self.base.clone(),
        }
    }

    /// Boost multiplier for a haystack: 1.0 for the exact id, 0.5 when only
    /// the parent technique of a sub-technique appears.
    pub fn match_weight(&self, haystack: &str) -> f64 {
        let hay = haystack.to_ascii_uppercase();
        match &self.sub {
            Some(sub) => {
                if hay.contains(&format!("{}.{}", self.base, sub))
                    || hay.contains(&format!("{}/{}", self.base, sub))
                {
                    1.0
                } else if contains_token(&hay, &self.base) {
                    0.5
                } else {
                    0.0
                }
            }
            None if contains_token(&hay, &self.base) => 1.0,
            None => 0.0,
        }
    }
}

/// `T1003` must not match inside `T10030`.
fn contains_token(hay: &str, needle: &str) -> bool {
    hay.match_indices(needle).any(|(i, _)| {
        !hay[i + needle.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    })
}

fn technique_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(T\d{4})(?:[./](\d{3}))?\b").expect("technique id pattern is valid")
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    /// Query text with any routing prefix removed.
    pub text: String,
    /// Source implied by a routing prefix.
    pub source: Option<Source>,
    pub techniques: Vec<TechniqueId>,
}

pub fn parse_query(raw: &str) -> ParsedQuery {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    let (text, source) = ROUTING_PREFIXES
        .iter()
        .find(|(prefix, _)| lower.starts_with(prefix))
        .map(|(prefix, source)| (trimmed[prefix.len()..].trim(), Some(*source)))
        .unwrap_or((trimmed, None));

    let mut techniques: Vec<TechniqueId> = Vec::new();
    for caps in technique_regex().captures_iter(text) {
        let id = TechniqueId {
            base: caps[1].to_ascii_uppercase(),
            sub: caps.get(2).map(|m| m.as_str().to_string()),
        };
        if !techniques.contains(&id) {
            techniques.push(id);
        }
    }

    ParsedQuery {
        text: text.to_string(),
        source,
        techniques,
    }
}

/// Build an FTS5 MATCH expression: every word quoted, OR-joined.
pub fn fts_expression(text: &str) -> String {
    text.split_whitespace()
        .map(|word| word.replace('"', ""))
        .filter(|word| word.chars().any(char::is_alphanumeric))
        .map(|word| format!("\"{word}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Lowercased alphanumeric terms, used for near-duplicate detection.
pub fn term_set(text: &str) -> std::collections::HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

pub fn jaccard(
    a: &std::collections::HashSet<String>,
    b: &std::collections::HashSet<String>,
) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}
