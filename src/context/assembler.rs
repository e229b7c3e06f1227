//! Token-budgeted context bundles.
//!
//! The budget is charged in a fixed order: the query first, then pinned
//! facts, then passages by descending score, then conversation turns from the
//! most recent backwards. The first item that does not fit is truncated when
//! enough room remains for a useful fragment; everything after it is counted
//! as omitted. `tokens.used` never exceeds `tokens.budget`.

use serde::Serialize;

use crate::config::{ContextConfig, MemoryConfig};
use crate::error::{CoreError, Result};
use crate::memory::{MemoryRecord, MemoryService, Role};
use crate::retrieval::{Passage, RetrievalEngine};

/// `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Header line printed above a passage; counted against the budget.
pub fn passage_header(passage: &Passage) -> String {
    let p = &passage.provenance;
    format!(
        "[{}] {} ({}) score={:.3}",
        p.source, p.title, p.retrieved_at, passage.score
    )
}

/// Header printed before a memory item; counted against the budget.
pub fn memory_header(role: Role) -> String {
    format!("{}:", role.as_str().to_uppercase())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundlePassage {
    pub passage: Passage,
    pub truncated: bool,
    pub tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleMemory {
    pub record_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: String,
    pub truncated: bool,
    pub tokens: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenAccounting {
    pub budget: usize,
    pub used: usize,
    pub query: usize,
    pub pinned_facts: usize,
    pub passages: usize,
    pub memory: usize,
}

impl TokenAccounting {
    pub fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.used)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextBundle {
    pub query: String,
    pub session_id: String,
    pub pinned_facts: Vec<BundleMemory>,
    pub passages: Vec<BundlePassage>,
    /// Conversation turns, oldest first.
    pub memory: Vec<BundleMemory>,
    pub tokens: TokenAccounting,
    pub omitted_passages: usize,
    pub omitted_memory: usize,
    /// Retrieval timed out and the bundle carries memory only.
    pub retrieval_degraded: bool,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.pinned_facts.is_empty() && self.passages.is_empty() && self.memory.is_empty()
    }
}

/// Inputs gathered before budgeting.
#[derive(Debug, Default)]
pub struct Candidates {
    pub passages: Vec<Passage>,
    pub pinned_facts: Vec<MemoryRecord>,
    /// Most recent first.
    pub recent_turns: Vec<MemoryRecord>,
    pub retrieval_degraded: bool,
}

enum Fit {
    Whole,
    Truncated(String),
    No,
}

struct Filler {
    tokens: TokenAccounting,
    min_truncated: usize,
    exhausted: bool,
}

impl Filler {
    /// Try to place `header` + `body`; returns the body that fits, if any.
    fn place(&mut self, header: &str, body: &str) -> Fit {
        if self.exhausted {
            return Fit::No;
        }
        let header_cost = estimate_tokens(header);
        let cost = header_cost + estimate_tokens(body);
        let remaining = self.tokens.remaining();
        if cost <= remaining {
            self.tokens.used += cost;
            return Fit::Whole;
        }

        self.exhausted = true;
        if remaining < self.min_truncated || remaining <= header_cost {
            return Fit::No;
        }
        let allowance = (remaining - header_cost) * 4;
        let cut: String = body.chars().take(allowance).collect();
        let cut = cut.trim_end().to_string();
        if cut.is_empty() {
            return Fit::No;
        }
        self.tokens.used += header_cost + estimate_tokens(&cut);
        Fit::Truncated(cut)
    }

    fn place_memory(&mut self, record: &MemoryRecord) -> Option<BundleMemory> {
        let header = memory_header(record.role);
        let (content, truncated) = match self.place(&header, &record.content) {
            Fit::Whole => (record.content.clone(), false),
            Fit::Truncated(cut) => (cut, true),
            Fit::No => return None,
        };
        let tokens = estimate_tokens(&header) + estimate_tokens(&content);
        Some(BundleMemory {
            record_id: record.id.clone(),
            role: record.role,
            content,
            created_at: record.created_at.clone(),
            truncated,
            tokens,
        })
    }
}

/// Budget the candidates into a bundle.
pub fn fit_to_budget(
    query: &str,
    session_id: &str,
    token_budget: usize,
    candidates: Candidates,
    min_truncated_tokens: usize,
) -> Result<ContextBundle> {
    if query.trim().is_empty() {
        return Err(CoreError::invalid("context-assemble", "query must not be empty"));
    }
    let query_tokens = estimate_tokens(query);
    if token_budget < query_tokens {
        return Err(CoreError::invalid(
            "context-assemble",
            format!("token budget {token_budget} is smaller than the query ({query_tokens} tokens)"),
        ));
    }

    let mut filler = Filler {
        tokens: TokenAccounting {
            budget: token_budget,
            used: query_tokens,
            query: query_tokens,
            ..TokenAccounting::default()
        },
        min_truncated: min_truncated_tokens.max(1),
        exhausted: false,
    };
    let mut omitted_memory = 0;
    let mut omitted_passages = 0;

    let mut pinned_facts = Vec::new();
    for record in &candidates.pinned_facts {
        match filler.place_memory(record) {
            Some(item) => {
                filler.tokens.pinned_facts += item.tokens;
                pinned_facts.push(item);
            }
            None => omitted_memory += 1,
        }
    }

    let mut ranked = candidates.passages;
    ranked.sort_by(crate::retrieval::search::compare_passages);
    let mut passages = Vec::new();
    for passage in ranked {
        let header = passage_header(&passage);
        let (text, truncated) = match filler.place(&header, &passage.text) {
            Fit::Whole => (passage.text.clone(), false),
            Fit::Truncated(cut) => (cut, true),
            Fit::No => {
                omitted_passages += 1;
                continue;
            }
        };
        let tokens = estimate_tokens(&header) + estimate_tokens(&text);
        filler.tokens.passages += tokens;
        passages.push(BundlePassage {
            passage: Passage { text, ..passage },
            truncated,
            tokens,
        });
    }

    let mut memory = Vec::new();
    for record in candidates.recent_turns.iter().filter(|r| r.role.is_turn()) {
        match filler.place_memory(record) {
            Some(item) => {
                filler.tokens.memory += item.tokens;
                memory.push(item);
            }
            None => omitted_memory += 1,
        }
    }
    memory.reverse();

    Ok(ContextBundle {
        query: query.to_string(),
        session_id: session_id.to_string(),
        pinned_facts,
        passages,
        memory,
        tokens: filler.tokens,
        omitted_passages,
        omitted_memory,
        retrieval_degraded: candidates.retrieval_degraded,
    })
}

/// Gathers retrieval results and memory for a session and budgets them.
#[derive(Clone)]
pub struct ContextAssembler {
    retrieval: RetrievalEngine,
    memory: MemoryService,
    config: ContextConfig,
    memory_config: MemoryConfig,
}

impl ContextAssembler {
    pub fn new(
        retrieval: RetrievalEngine,
        memory: MemoryService,
        config: ContextConfig,
        memory_config: MemoryConfig,
    ) -> Self {
        Self {
            retrieval,
            memory,
            config,
            memory_config,
        }
    }

    pub async fn assemble(
        &self,
        query: &str,
        session_id: &str,
        token_budget: Option<usize>,
    ) -> Result<ContextBundle> {
        let budget = token_budget.unwrap_or(self.config.default_token_budget);
        // reject before doing any work
        fit_to_budget(query, session_id, budget, Candidates::default(), 0)?;

        let (passages, retrieval_degraded) = match self
            .retrieval
            .query(query, self.config.passages, None, None)
            .await
        {
            Ok(passages) => (passages, false),
            Err(CoreError::RetrievalTimeout { budget_ms, .. }) => {
                tracing::warn!(
                    query = %query,
                    session = %session_id,
                    budget_ms,
                    "retrieval timed out, assembling memory-only context"
                );
                (Vec::new(), true)
            }
            Err(e) => return Err(e),
        };

        let (pinned_facts, recent_turns) = self
            .memory
            .context_window(session_id, self.memory_config.context_window)
            .await?;

        let bundle = fit_to_budget(
            query,
            session_id,
            budget,
            Candidates {
                passages,
                pinned_facts,
                recent_turns,
                retrieval_degraded,
            },
            self.config.min_truncated_tokens,
        )?;

        tracing::info!(
            session = %session_id,
            budget,
            used = bundle.tokens.used,
            passages = bundle.passages.len(),
            memory = bundle.memory.len(),
            omitted_passages = bundle.omitted_passages,
            omitted_memory = bundle.omitted_memory,
            degraded = bundle.retrieval_degraded,
            "context assembled"
        );
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{OffsetRange, Source};
    use crate::retrieval::Provenance;

    fn passage(id: &str, score: f64, text: &str) -> Passage {
        Passage {
            chunk_id: id.into(),
            text: text.into(),
            score,
            lexical_score: score,
            vector_score: None,
            provenance: Provenance {
                source: Source::MitreAttack,
                title: format!("doc {id}"),
                document_id: format!("d-{id}"),
                retrieved_at: "2024-01-01T00:00:00.000000Z".into(),
                offset_range: OffsetRange { start: 0, end: text.len() },
            },
        }
    }

    fn record(id: &str, role: Role, content: &str) -> MemoryRecord {
        MemoryRecord {
            id: id.into(),
            session_id: "s".into(),
            role,
            content: content.into(),
            created_at: "2024-01-01T00:00:00.000000Z".into(),
            deleted: false,
            deleted_at: None,
        }
    }

    fn candidates() -> Candidates {
        Candidates {
            passages: vec![
                passage("low", 0.2, &"low relevance text ".repeat(10)),
                passage("high", 0.9, &"credential dumping from lsass ".repeat(10)),
            ],
            pinned_facts: vec![record("f1", Role::PinnedFact, "engagement scope is the lab")],
            recent_turns: vec![
                record("t3", Role::Assistant, "third"),
                record("t2", Role::User, "second"),
                record("t1", Role::User, "first"),
            ],
            retrieval_degraded: false,
        }
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("éééé"), 1);
    }

    #[test]
    fn generous_budget_keeps_everything_in_order() {
        let bundle = fit_to_budget("lsass", "s", 10_000, candidates(), 16).unwrap();
        assert_eq!(bundle.pinned_facts.len(), 1);
        let ids: Vec<&str> = bundle.passages.iter().map(|p| p.passage.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low"]);
        let turns: Vec<&str> = bundle.memory.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(turns, vec!["first", "second", "third"]);
        assert_eq!(bundle.omitted_passages + bundle.omitted_memory, 0);
        assert_eq!(
            bundle.tokens.used,
            bundle.tokens.query + bundle.tokens.pinned_facts + bundle.tokens.passages + bundle.tokens.memory
        );
    }

    #[test]
    fn never_exceeds_budget() {
        for budget in 2..400 {
            let bundle = fit_to_budget("lsass", "s", budget, candidates(), 4).unwrap();
            assert!(bundle.tokens.used <= budget, "budget {budget} used {}", bundle.tokens.used);
            let total = bundle.pinned_facts.len()
                + bundle.passages.len()
                + bundle.memory.len()
                + bundle.omitted_passages
                + bundle.omitted_memory;
            assert_eq!(total, 6, "budget {budget}");
        }
    }

    #[test]
    fn first_misfit_is_truncated() {
        // query 2 + pinned fact 10, leaving 28: enough for a header and a fragment
        let bundle = fit_to_budget("lsass", "s", 40, candidates(), 4).unwrap();
        assert_eq!(bundle.passages.len(), 1);
        assert!(bundle.passages[0].truncated);
        assert_eq!(bundle.passages[0].passage.chunk_id, "high");
        assert_eq!(bundle.omitted_passages, 1);
        assert_eq!(bundle.omitted_memory, 3);
        assert!(bundle.tokens.used <= 40);
    }

    #[test]
    fn budget_below_query_is_rejected() {
        let err = fit_to_budget("a fairly long question", "s", 2, candidates(), 4).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInvocation { .. }));
    }

    #[test]
    fn nothing_found_yields_query_only_bundle() {
        let bundle = fit_to_budget("lsass", "s", 100, Candidates::default(), 4).unwrap();
        assert!(bundle.is_empty());
        assert_eq!(bundle.tokens.used, bundle.tokens.query);
    }
}
