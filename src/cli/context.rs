use anyhow::{bail, Result};
use serde_json::json;

use super::{preview, print_json};
use crate::router::{Router, ToolOutcome};

/// Assemble a context bundle and print it, or the rendered prompt with `--prompt`.
pub async fn context(
    router: &Router,
    query: &str,
    session_id: &str,
    budget: Option<usize>,
    prompt: bool,
    as_json: bool,
) -> Result<()> {
    let outcome = router
        .invoke(
            "context-assemble",
            json!({
                "query": query,
                "session_id": session_id,
                "token_budget": budget,
                "render_prompt": prompt,
            }),
        )
        .await?;
    let ToolOutcome::ContextAssemble(outcome) = outcome else {
        bail!("unexpected outcome for context-assemble");
    };
    if as_json {
        return print_json(&outcome);
    }
    if let Some(text) = &outcome.prompt {
        println!("{text}");
        return Ok(());
    }

    let bundle = &outcome.bundle;
    let t = &bundle.tokens;
    println!("Context for {:?} (session {})", bundle.query, bundle.session_id);
    println!(
        "Tokens: {}/{} (query {}, facts {}, passages {}, memory {})",
        t.used, t.budget, t.query, t.pinned_facts, t.passages, t.memory
    );
    if bundle.retrieval_degraded {
        println!("WARNING: retrieval timed out; bundle contains memory only.");
    }
    println!();

    if !bundle.pinned_facts.is_empty() {
        println!("Pinned facts:");
        for fact in &bundle.pinned_facts {
            println!("  - {}", preview(&fact.content, 120));
        }
        println!();
    }
    println!("Passages ({} omitted):", bundle.omitted_passages);
    for item in &bundle.passages {
        let p = &item.passage;
        let cut = if item.truncated { " [truncated]" } else { "" };
        println!(
            "  [{}] {} (score {:.3}, {} tokens){cut}",
            p.provenance.source, p.provenance.title, p.score, item.tokens
        );
    }
    println!();
    println!("Memory ({} omitted), oldest first:", bundle.omitted_memory);
    for item in &bundle.memory {
        let cut = if item.truncated { " [truncated]" } else { "" };
        println!("  {}: {}{cut}", item.role, preview(&item.content, 100));
    }
    Ok(())
}
