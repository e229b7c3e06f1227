//! Request shape handed to the external inference service.
//!
//! Nothing here performs inference. The caller decides whether and where to
//! send the request.

use serde::{Deserialize, Serialize};

use super::assembler::ContextBundle;
use crate::corpus::Source;
use crate::memory::Role;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPassage {
    pub source: Source,
    pub title: String,
    pub document_id: String,
    pub retrieved_at: String,
    pub score: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryTurn {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub query: String,
    pub context_passages: Vec<ContextPassage>,
    /// Pinned facts first, then conversation turns oldest first.
    pub memory_turns: Vec<MemoryTurn>,
}

impl InferenceRequest {
    pub fn from_bundle(bundle: &ContextBundle) -> Self {
        let context_passages = bundle
            .passages
            .iter()
            .map(|item| {
                let p = &item.passage;
                ContextPassage {
                    source: p.provenance.source,
                    title: p.provenance.title.clone(),
                    document_id: p.provenance.document_id.clone(),
                    retrieved_at: p.provenance.retrieved_at.clone(),
                    score: p.score,
                    text: p.text.clone(),
                }
            })
            .collect();
        let memory_turns = bundle
            .pinned_facts
            .iter()
            .chain(&bundle.memory)
            .map(|m| MemoryTurn {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        Self {
            query: bundle.query.clone(),
            context_passages,
            memory_turns,
        }
    }

    /// Plain-text prompt: memory, evidence, question, instructions.
    pub fn render_prompt(&self) -> String {
        let facts: Vec<&MemoryTurn> = self
            .memory_turns
            .iter()
            .filter(|t| !t.role.is_turn())
            .collect();
        let turns: Vec<&MemoryTurn> = self.memory_turns.iter().filter(|t| t.role.is_turn()).collect();

        if facts.is_empty() && turns.is_empty() && self.context_passages.is_empty() {
            return format!(
                "User question:\n{}\n\nInstructions:\n\
                 - No evidence or memory was supplied. If you need sources to answer accurately, say so.\n\
                 - Otherwise answer normally.",
                self.query
            );
        }

        let mut out = String::new();
        if !facts.is_empty() {
            out.push_str("Pinned facts:\n");
            for fact in &facts {
                out.push_str(&format!("- {}\n", fact.content));
            }
            out.push('\n');
        }

        out.push_str("Conversation (most recent last):\n");
        for turn in &turns {
            out.push_str(&format!("{}: {}\n", turn.role.as_str().to_uppercase(), turn.content));
        }
        out.push('\n');

        out.push_str("Evidence:\n");
        for (i, p) in self.context_passages.iter().enumerate() {
            out.push_str(&format!(
                "[{}] {} ({}, retrieved {})\n{}\n\n",
                i + 1,
                p.title,
                p.source,
                p.retrieved_at,
                p.text
            ));
        }
        if self.context_passages.is_empty() {
            out.push('\n');
        }

        out.push_str(&format!("User question:\n{}\n\n", self.query));
        out.push_str(
            "Instructions:\n\
             - Use the pinned facts and conversation for continuity; say so when memory is vague.\n\
             - Use the evidence when relevant and cite it by its bracketed number.\n\
             - If the question needs external facts and the evidence is insufficient, say so.\n\
             - Label anything drawn from your own knowledge.",
        );
        out
    }
}
